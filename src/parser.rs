// Copyright (c) 2022, Matteo Bernacchia <dev@kikijiki.com>. All rights reserved.
// This project is dual licensed under the Apache License 2.0 and the MIT license.
// See the LICENSE files in the project root for details.

use std::time::Instant;

use tracing::{debug, info, warn};

use crate::{
    api::*,
    attribute::{VolumeInformation, VolumeName},
    cancel::StopSignal,
    device::BlockDevice,
    errors::{NtfsError, NtfsResult},
    file::NtfsFile,
    index::{list_directory, DirEntry},
    journal::{ChangeJournalReader, JournalOptions},
    mft::{DumpSummary, Mft},
    path::{full_path, PathCache, PathResolver},
    stream::OutStream,
    volume::Volume,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeAttributes {
    pub major_version: u8,
    pub minor_version: u8,
    pub serial_number: u64,
    pub name: String,
}

/// One journal change resolved to the path of the file it touched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiffRecord {
    pub reason: u32,
    pub timestamp: i64,
    pub path: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileDumpSummary {
    pub written: u64,
    pub blocks: u64,
    pub stopped: bool,
}

/// Opens a volume and answers file system questions from its raw metadata.
pub struct NtfsParser<D: BlockDevice> {
    pub mft: Mft<D>,
    attributes: VolumeAttributes,
    journal: Option<ChangeJournalReader>,
    resolver: PathResolver,
    stop_full_dir: StopSignal,
    stop_file_dump: StopSignal,
}

impl<D: BlockDevice> NtfsParser<D> {
    pub fn new(device: D) -> NtfsResult<Self> {
        Self::with_options(device, JournalOptions::default(), PathResolver::default())
    }

    pub fn with_options(
        device: D,
        journal_options: JournalOptions,
        resolver: PathResolver,
    ) -> NtfsResult<Self> {
        let start = Instant::now();
        let mut mft = Mft::new(Volume::new(device)?)?;

        let volume_file = mft.read_record(VOLUME_RECORD)?;
        let attributes = Self::read_volume_attributes(&volume_file, mft.volume.geometry.serial_number)?;
        if attributes.major_version < MINIMUM_MAJOR_VERSION {
            return Err(NtfsError::UnsupportedVersion {
                major: attributes.major_version,
                minor: attributes.minor_version,
            });
        }

        let journal = match ChangeJournalReader::new(mft.volume.device_mut(), journal_options) {
            Ok(journal) => Some(journal),
            Err(e) => {
                warn!("Change journal unavailable: {}", e);
                None
            }
        };

        info!(
            "Opened NTFS {}.{} volume '{}' (took {:?})",
            attributes.major_version,
            attributes.minor_version,
            attributes.name,
            Instant::now() - start
        );

        Ok(NtfsParser {
            mft,
            attributes,
            journal,
            resolver,
            stop_full_dir: StopSignal::new(),
            stop_file_dump: StopSignal::new(),
        })
    }

    fn read_volume_attributes(file: &NtfsFile, serial_number: u64) -> NtfsResult<VolumeAttributes> {
        let information = file
            .find_attributes::<VolumeInformation>(true)?
            .swap_remove(0);
        let name = file
            .find_attributes::<VolumeName>(false)?
            .into_iter()
            .next()
            .map(|name| name.0)
            .unwrap_or_default();

        Ok(VolumeAttributes {
            major_version: information.major_version(),
            minor_version: information.minor_version(),
            serial_number,
            name,
        })
    }

    pub fn volume_attributes(&self) -> &VolumeAttributes {
        &self.attributes
    }

    pub fn has_journal(&self) -> bool {
        self.journal.is_some()
    }

    pub fn journal(&self) -> Option<&ChangeJournalReader> {
        self.journal.as_ref()
    }

    pub fn find_record(&mut self, path: &str) -> NtfsResult<NtfsFile> {
        debug!("Resolving {}", path);
        self.resolver.resolve(&mut self.mft, path)
    }

    /// Lists the directory at `path`, descending `depth` levels below it.
    pub fn list_files(&mut self, path: &str, depth: u32) -> NtfsResult<Vec<DirEntry>> {
        let directory = self.find_record(path)?;
        list_directory(&mut self.mft, &directory, depth)
    }

    /// Changes recorded since the last call, with the full path of each file.
    /// Changes whose file can no longer be resolved are left out.
    pub fn list_diffs(&mut self, reason_mask: u32) -> NtfsResult<Vec<DiffRecord>> {
        let journal = self.journal.as_mut().ok_or(NtfsError::UnexpectedAction {
            details: "the change journal is not available",
        })?;
        journal.set_reason_mask(reason_mask);
        let records = journal.read(self.mft.volume.device_mut())?;

        let mut cache = PathCache::new();
        let mut diffs = Vec::with_capacity(records.len());
        for record in records {
            let number = record.file_reference.record_number();
            let path = self
                .mft
                .read_record(number)
                .and_then(|file| full_path(&mut self.mft, &file, &mut cache));

            match path {
                Ok(path) => diffs.push(DiffRecord {
                    reason: record.reason,
                    timestamp: record.timestamp,
                    path,
                }),
                Err(e) if e.is_recoverable() => {
                    debug!("Skipping change to record {}: {}", number, e);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(diffs)
    }

    pub fn full_path(&mut self, file: &NtfsFile) -> NtfsResult<String> {
        full_path(&mut self.mft, file, &mut PathCache::new())
    }

    pub fn dump_full_dir<S: OutStream>(
        &mut self,
        sink: &mut S,
        records_per_flush: usize,
    ) -> NtfsResult<DumpSummary> {
        info!(
            "Dumping full dir, flushing every {} records at most",
            records_per_flush
        );
        self.mft
            .dump_full_dir(sink, records_per_flush, Some(&self.stop_full_dir))
    }

    /// Writes `amount` bytes of `stream` from `offset`, in blocks of
    /// `block_size`. An `amount` of zero means up to the end of the stream.
    pub fn dump_file<S: OutStream>(
        &mut self,
        sink: &mut S,
        block_size: u64,
        path: &str,
        stream: &str,
        offset: u64,
        amount: u64,
    ) -> NtfsResult<FileDumpSummary> {
        if block_size == 0 {
            return Err(NtfsError::BadSize {
                expected: 1,
                actual: 0,
            });
        }

        let file = self.find_record(path)?;
        let data = file.data_stream(stream)?;
        let size = data.size();
        let total = if amount == 0 {
            size.checked_sub(offset).ok_or(NtfsError::OutOfBounds {
                offset,
                length: 0,
                size,
            })?
        } else {
            match offset.checked_add(amount) {
                Some(end) if end <= size => amount,
                _ => {
                    return Err(NtfsError::OutOfBounds {
                        offset,
                        length: amount,
                        size,
                    })
                }
            }
        };
        info!(
            "Dumping {} bytes of {}:[{}] in blocks of {}",
            total,
            path,
            if stream.is_empty() { "main" } else { stream },
            block_size
        );

        let mut summary = FileDumpSummary::default();
        while summary.written < total {
            if self.stop_file_dump.take() {
                info!("Stop requested, ending file dump");
                summary.stopped = true;
                break;
            }

            let length = u64::min(block_size, total - summary.written);
            let block = data.read(
                &mut self.mft.volume,
                offset.saturating_add(summary.written),
                length,
            )?;
            sink.write_chunk(&block).map_err(NtfsError::OutputError)?;

            summary.written += length;
            summary.blocks += 1;
        }

        Ok(summary)
    }

    pub fn stop_full_dir(&self) {
        self.stop_full_dir.signal();
    }

    pub fn stop_file_dump(&self) {
        self.stop_file_dump.signal();
    }

    /// A handle other threads can use to stop `dump_full_dir`.
    pub fn full_dir_signal(&self) -> StopSignal {
        self.stop_full_dir.clone()
    }

    pub fn file_dump_signal(&self) -> StopSignal {
        self.stop_file_dump.clone()
    }
}
