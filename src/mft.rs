// Copyright (c) 2022, Matteo Bernacchia <dev@kikijiki.com>. All rights reserved.
// This project is dual licensed under the Apache License 2.0 and the MIT license.
// See the LICENSE files in the project root for details.

use std::collections::{BTreeSet, HashSet};
use std::time::Instant;

use tracing::{debug, info};

use crate::{
    api::*,
    attribute::{AttributeList, NonResidentLayout},
    cancel::StopSignal,
    device::BlockDevice,
    errors::{NtfsError, NtfsResult},
    file::{NtfsFile, NtfsRecord},
    file_info::FileInformation,
    stream::OutStream,
    volume::Volume,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IterationSummary {
    pub visited: u64,
    pub skipped: u64,
    pub stopped: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DumpSummary {
    /// Records handed to the sink.
    pub written: u64,
    pub flushes: u64,
    pub skipped: u64,
    pub stopped: bool,
}

/// Record access through the `$MFT` record's own data stream.
pub struct Mft<D: BlockDevice> {
    pub volume: Volume<D>,
    data: NonResidentLayout,
    record_count: u64,
}

impl<D: BlockDevice> Mft<D> {
    pub fn new(mut volume: Volume<D>) -> NtfsResult<Self> {
        let start = Instant::now();
        let record_size = volume.geometry.file_record_size;

        let raw = volume.read_bytes(volume.geometry.mft_position, record_size as usize)?;
        if raw.len() as u64 != record_size {
            return Err(NtfsError::BadSize {
                expected: record_size,
                actual: raw.len() as u64,
            });
        }

        let data = Self::data_layout(&NtfsFile::new(NtfsRecord::new(MFT_RECORD, raw)?))?;
        let mut mft = Mft {
            volume,
            record_count: data.data_size / record_size,
            data,
        };

        // Parts of $DATA can live in extension records once the MFT is
        // heavily fragmented.
        let file = mft.read_record(MFT_RECORD)?;
        if !file.extensions().is_empty() {
            mft.data = Self::data_layout(&file)?;
            mft.record_count = mft.data.data_size / record_size;
        }

        info!(
            "Loaded MFT with {} records in {} runs (took {:?})",
            mft.record_count,
            mft.data.runs.len(),
            Instant::now() - start
        );

        Ok(mft)
    }

    fn data_layout(file: &NtfsFile) -> NtfsResult<NonResidentLayout> {
        let stream = file.data_stream("")?;
        stream
            .attribute()
            .layout()
            .cloned()
            .ok_or(NtfsError::BadRecordHeader {
                details: "$MFT data is resident",
            })
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    pub fn record_size(&self) -> u64 {
        self.volume.geometry.file_record_size
    }

    pub fn read_raw_record(&mut self, number: u64) -> NtfsResult<NtfsRecord> {
        if number >= self.record_count {
            return Err(NtfsError::RecordNotFound(format!(
                "record {} is past the end of the MFT ({} records)",
                number, self.record_count
            )));
        }

        let size = self.record_size();
        let data = self.data.read(&mut self.volume, number * size, size)?;
        NtfsRecord::new(number, data)
    }

    /// Reads a record and every extension record its attribute list names.
    pub fn read_record(&mut self, number: u64) -> NtfsResult<NtfsFile> {
        let mut visited = HashSet::new();
        visited.insert(number);
        self.assemble(number, &mut visited)
    }

    fn assemble(&mut self, number: u64, visited: &mut HashSet<u64>) -> NtfsResult<NtfsFile> {
        let mut file = NtfsFile::new(self.read_raw_record(number)?);

        let mut targets = BTreeSet::new();
        for list in file.record().find_attributes::<AttributeList>(false)? {
            for entry in list.entries(&mut self.volume)? {
                let target = entry.reference.record_number();
                if target != number && !visited.contains(&target) {
                    targets.insert(target);
                }
            }
        }

        for target in targets {
            if visited.insert(target) {
                let extension = self.assemble(target, visited)?;
                file.attach(extension);
            }
        }

        Ok(file)
    }

    /// Calls `f` for every base record of the volume. Records that fail to
    /// decode, or that `f` fails on, are skipped unless the error is fatal.
    pub fn iterate_files<F>(
        &mut self,
        stop: Option<&StopSignal>,
        mut f: F,
    ) -> NtfsResult<IterationSummary>
    where
        F: FnMut(&mut Self, &NtfsFile) -> NtfsResult<()>,
    {
        let mut summary = IterationSummary::default();

        for number in 0..self.record_count {
            if stop.is_some_and(StopSignal::take) {
                info!("Stop requested, ending iteration at record {}", number);
                summary.stopped = true;
                break;
            }

            let file = match self.read_record(number) {
                Ok(file) => file,
                Err(e) if e.is_recoverable() => {
                    debug!("Skipping record {}: {}", number, e);
                    summary.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if file.record().is_extension() {
                continue;
            }

            match f(self, &file) {
                Ok(()) => summary.visited += 1,
                Err(e) if e.is_recoverable() => {
                    debug!("Skipping record {}: {}", number, e);
                    summary.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(summary)
    }

    /// Serializes every base record to `sink`, `records_per_flush` records
    /// per chunk. On a stop request the unflushed records are dropped.
    pub fn dump_full_dir<S: OutStream>(
        &mut self,
        sink: &mut S,
        records_per_flush: usize,
        stop: Option<&StopSignal>,
    ) -> NtfsResult<DumpSummary> {
        if records_per_flush == 0 {
            return Err(NtfsError::BadSize {
                expected: 1,
                actual: 0,
            });
        }

        let mut summary = DumpSummary::default();
        let mut buffer = Vec::new();
        let mut pending = 0usize;

        let iteration = self.iterate_files(stop, |_, file| {
            let info = FileInformation::new(file)?;
            info.serialize(&mut buffer);
            pending += 1;

            if pending == records_per_flush {
                debug!("Flushing {} records", pending);
                sink.write_chunk(&buffer).map_err(NtfsError::OutputError)?;
                summary.written += pending as u64;
                summary.flushes += 1;
                buffer.clear();
                pending = 0;
            }
            Ok(())
        })?;

        summary.skipped = iteration.skipped;
        summary.stopped = iteration.stopped;

        if !iteration.stopped && pending > 0 {
            debug!("Flushing {} records", pending);
            sink.write_chunk(&buffer).map_err(NtfsError::OutputError)?;
            summary.written += pending as u64;
            summary.flushes += 1;
        }

        info!(
            "Dumped {} records in {} chunks ({} skipped)",
            summary.written, summary.flushes, summary.skipped
        );
        Ok(summary)
    }
}
