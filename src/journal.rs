// Copyright (c) 2022, Matteo Bernacchia <dev@kikijiki.com>. All rights reserved.
// This project is dual licensed under the Apache License 2.0 and the MIT license.
// See the LICENSE files in the project root for details.

use time::OffsetDateTime;
use tracing::{debug, info};

use crate::{
    api::*,
    device::BlockDevice,
    errors::{NtfsError, NtfsResult},
};

const USN_JOURNAL_DATA_SIZE: usize = 56;
const USN_SIZE: usize = 8;

#[derive(Debug, Clone)]
pub struct JournalRecord {
    pub usn: i64,
    /// FILETIME of the change.
    pub timestamp: i64,
    pub file_reference: MftReference,
    pub parent_reference: MftReference,
    pub reason: u32,
    pub record_length: u32,
    pub file_attributes: u32,
    pub name: String,
}

impl JournalRecord {
    pub fn time(&self) -> OffsetDateTime {
        u64::try_from(self.timestamp)
            .map(ntfs_to_unix_time)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }

    /// Decodes one `USN_RECORD_V2` at the start of `data`.
    pub fn parse(data: &[u8]) -> NtfsResult<Self> {
        let header: UsnRecordV2Header = read_struct(data)?;
        let length = header.record_length as usize;
        if length < USN_RECORD_V2_HEADER_SIZE || length > data.len() {
            return Err(NtfsError::BadRecordHeader {
                details: "journal record length outside buffer",
            });
        }

        let name_start = header.file_name_offset as usize;
        let name_end = name_start + header.file_name_length as usize;
        let name = data
            .get(name_start..name_end)
            .filter(|_| name_end <= length)
            .map(decode_utf16)
            .ok_or(NtfsError::BadRecordHeader {
                details: "journal record name outside record",
            })?;

        Ok(JournalRecord {
            usn: header.usn,
            timestamp: header.timestamp,
            file_reference: MftReference(header.file_reference_number),
            parent_reference: MftReference(header.parent_file_reference_number),
            reason: header.reason,
            record_length: header.record_length,
            file_attributes: header.file_attributes,
            name,
        })
    }
}

#[derive(Debug, Clone)]
pub enum NextUsn {
    First,
    Next,
    Custom(i64),
}

#[derive(Debug, Clone)]
pub struct JournalOptions {
    pub reason_mask: u32,
    pub next_usn: NextUsn,
    pub buffer_size: usize,
}

impl Default for JournalOptions {
    fn default() -> Self {
        JournalOptions {
            reason_mask: USN_REASON_ALL,
            next_usn: NextUsn::Next,
            buffer_size: 4096,
        }
    }
}

/// Reads the change journal of a volume from a resumable cursor. The cursor
/// only moves forward.
pub struct ChangeJournalReader {
    journal: UsnJournalData,
    next_usn: i64,
    reason_mask: u32,
    buffer_size: usize,
}

impl ChangeJournalReader {
    pub fn new<D: BlockDevice>(device: &mut D, options: JournalOptions) -> NtfsResult<Self> {
        let data = device.device_control(FSCTL_QUERY_USN_JOURNAL, &[], USN_JOURNAL_DATA_SIZE)?;
        if data.len() < USN_JOURNAL_DATA_SIZE {
            return Err(NtfsError::BadSize {
                expected: USN_JOURNAL_DATA_SIZE as u64,
                actual: data.len() as u64,
            });
        }
        let journal: UsnJournalData = read_struct(&data)?;

        let next_usn = match options.next_usn {
            NextUsn::First => 0,
            NextUsn::Next => journal.next_usn,
            NextUsn::Custom(usn) => usn,
        };

        info!(
            "Opened change journal {:#x}, next USN {:#x}, reading from {:#x}",
            journal.journal_id, journal.next_usn, next_usn
        );

        Ok(ChangeJournalReader {
            journal,
            next_usn,
            reason_mask: options.reason_mask,
            buffer_size: usize::max(options.buffer_size, USN_SIZE + USN_RECORD_V2_HEADER_SIZE),
        })
    }

    pub fn next_usn(&self) -> i64 {
        self.next_usn
    }

    pub fn journal_data(&self) -> &UsnJournalData {
        &self.journal
    }

    pub fn set_reason_mask(&mut self, reason_mask: u32) {
        self.reason_mask = reason_mask;
    }

    /// Moves the cursor past every pending record without decoding them.
    pub fn forward<D: BlockDevice>(&mut self, device: &mut D) -> NtfsResult<()> {
        self.pump(device, false).map(|_| ())
    }

    /// Every record appended since the cursor, in journal order.
    pub fn read<D: BlockDevice>(&mut self, device: &mut D) -> NtfsResult<Vec<JournalRecord>> {
        self.pump(device, true)
    }

    fn pump<D: BlockDevice>(&mut self, device: &mut D, collect: bool) -> NtfsResult<Vec<JournalRecord>> {
        debug!(
            "{} change journal from {:#x}, reasons {:#010x}",
            if collect { "Reading" } else { "Forwarding" },
            self.next_usn,
            self.reason_mask
        );

        let mut records = Vec::new();
        loop {
            let start = self.next_usn;
            let request = ReadUsnJournalData {
                start_usn: start,
                reason_mask: self.reason_mask,
                return_only_on_close: 0,
                timeout: 0,
                bytes_to_wait_for: 0,
                journal_id: self.journal.journal_id,
            };
            let response =
                device.device_control(FSCTL_READ_USN_JOURNAL, &request.to_bytes(), self.buffer_size)?;
            if response.len() < USN_SIZE {
                return Err(NtfsError::BadSize {
                    expected: USN_SIZE as u64,
                    actual: response.len() as u64,
                });
            }

            let mut usn = [0u8; USN_SIZE];
            usn.copy_from_slice(&response[..USN_SIZE]);
            self.next_usn = i64::max(self.next_usn, i64::from_le_bytes(usn));

            let batch = &response[USN_SIZE..];
            if batch.is_empty() {
                break;
            }

            let mut offset = 0usize;
            while offset + USN_RECORD_V2_HEADER_SIZE <= batch.len() {
                let header: UsnRecordV2Header = read_struct(&batch[offset..])?;
                let length = header.record_length as usize;
                if length == 0 {
                    break;
                }
                if offset + length > batch.len() {
                    return Err(NtfsError::BadRecordHeader {
                        details: "journal record past the end of the batch",
                    });
                }

                if collect && header.major_version == 2 && header.usn >= start {
                    records.push(JournalRecord::parse(&batch[offset..offset + length])?);
                }
                offset += length;
            }

            if self.next_usn == start {
                break;
            }
        }

        debug!(
            "Change journal cursor at {:#x}, {} records",
            self.next_usn,
            records.len()
        );
        Ok(records)
    }
}

const REASON_NAMES: [(u32, &str); 21] = [
    (USN_REASON_DATA_OVERWRITE, "DATA_OVERWRITE"),
    (USN_REASON_DATA_EXTEND, "DATA_EXTEND"),
    (USN_REASON_DATA_TRUNCATION, "DATA_TRUNCATION"),
    (USN_REASON_NAMED_DATA_OVERWRITE, "NAMED_DATA_OVERWRITE"),
    (USN_REASON_NAMED_DATA_EXTEND, "NAMED_DATA_EXTEND"),
    (USN_REASON_NAMED_DATA_TRUNCATION, "NAMED_DATA_TRUNCATION"),
    (USN_REASON_FILE_CREATE, "FILE_CREATE"),
    (USN_REASON_FILE_DELETE, "FILE_DELETE"),
    (USN_REASON_EA_CHANGE, "EA_CHANGE"),
    (USN_REASON_SECURITY_CHANGE, "SECURITY_CHANGE"),
    (USN_REASON_RENAME_OLD_NAME, "RENAME_OLD_NAME"),
    (USN_REASON_RENAME_NEW_NAME, "RENAME_NEW_NAME"),
    (USN_REASON_INDEXABLE_CHANGE, "INDEXABLE_CHANGE"),
    (USN_REASON_BASIC_INFO_CHANGE, "BASIC_INFO_CHANGE"),
    (USN_REASON_HARD_LINK_CHANGE, "HARD_LINK_CHANGE"),
    (USN_REASON_COMPRESSION_CHANGE, "COMPRESSION_CHANGE"),
    (USN_REASON_ENCRYPTION_CHANGE, "ENCRYPTION_CHANGE"),
    (USN_REASON_OBJECT_ID_CHANGE, "OBJECT_ID_CHANGE"),
    (USN_REASON_REPARSE_POINT_CHANGE, "REPARSE_POINT_CHANGE"),
    (USN_REASON_STREAM_CHANGE, "STREAM_CHANGE"),
    (USN_REASON_CLOSE, "CLOSE"),
];

/// `FILE_CREATE | CLOSE` style rendering; unknown bits are shown in hex.
pub fn reason_to_string(reason: u32) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut known = 0u32;
    for (bit, name) in REASON_NAMES {
        if reason & bit != 0 {
            parts.push(name.to_string());
            known |= bit;
        }
    }

    let unknown = reason & !known;
    if unknown != 0 {
        parts.push(format!("{:#010x}", unknown));
    }
    if parts.is_empty() {
        return "NONE".to_string();
    }
    parts.join(" | ")
}
