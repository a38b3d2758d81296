use std::fs::File;

use ntfs_parser::device::FileDevice;
use ntfs_parser::index::DirEntry;
use ntfs_parser::parser::NtfsParser;

fn print(entries: &[DirEntry], indent: usize) {
    for entry in entries {
        let name = entry
            .file
            .friendly_name()
            .unwrap_or_else(|_| format!("<record {}>", entry.file.number()));
        let size = entry.file.main_size().unwrap_or(0);

        if entry.file.is_directory() {
            println!("{:indent$}{}\\", "", name, indent = indent);
        } else {
            println!("{:indent$}{} ({} bytes)", "", name, size, indent = indent);
        }
        print(&entry.children, indent + 2);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let image = args
        .next()
        .ok_or("usage: dump_tree <ntfs image> [path] [depth]")?;
    let path = args.next().unwrap_or_else(|| "C:\\".to_string());
    let depth = args.next().map(|d| d.parse()).transpose()?.unwrap_or(2);

    let mut parser = NtfsParser::new(FileDevice::new(File::open(image)?)?)?;
    let attributes = parser.volume_attributes();
    println!(
        "Volume '{}', NTFS {}.{}, serial {:#018x}",
        attributes.name, attributes.major_version, attributes.minor_version, attributes.serial_number
    );

    let listing = parser.list_files(&path, depth)?;
    println!("{}", path);
    print(&listing, 2);

    Ok(())
}
