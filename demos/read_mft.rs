use std::fs::File;

use ntfs_parser::device::FileDevice;
use ntfs_parser::file_info::FileInformation;
use ntfs_parser::mft::Mft;
use ntfs_parser::path::{full_path, PathCache};
use ntfs_parser::volume::Volume;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Any raw NTFS image works, e.g. one taken with `dd`.
    let image = std::env::args()
        .nth(1)
        .ok_or("usage: read_mft <ntfs image>")?;
    let volume = Volume::new(FileDevice::new(File::open(image)?)?)?;
    let mut mft = Mft::new(volume)?;

    // One cache for the whole walk, so each directory is read only once.
    let mut cache = PathCache::new();
    let summary = mft.iterate_files(None, |mft, file| {
        let info = FileInformation::new(file)?;
        let path = full_path(mft, file, &mut cache)?;

        println!(
            "Path: {}, Size: {} bytes, Directory: {}, Modified: {}",
            path,
            info.size,
            info.is_directory(),
            info.modified()
        );
        Ok(())
    })?;

    println!(
        "{} files, {} records skipped",
        summary.visited, summary.skipped
    );
    Ok(())
}
