// Copyright (c) 2022, Matteo Bernacchia <dev@kikijiki.com>. All rights reserved.
// This project is dual licensed under the Apache License 2.0 and the MIT license.
// See the LICENSE files in the project root for details.

use time::OffsetDateTime;

use crate::{
    api::*,
    errors::{NtfsError, NtfsResult},
    file::NtfsFile,
    stream::OutStream,
};

pub const DUMP_IS_DIRECTORY: u8 = 1;
pub const DUMP_IS_DELETED: u8 = 2;
pub const DUMP_IS_READ_ONLY: u8 = 4;
pub const DUMP_IS_HIDDEN: u8 = 8;
pub const DUMP_IS_SYSTEM: u8 = 16;
pub const DUMP_IS_COMPRESSED: u8 = 32;
pub const DUMP_IS_ENCRYPTED: u8 = 64;
pub const DUMP_IS_ARCHIVED: u8 = 128;

/// Metadata of one file as it appears in a full directory dump.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileInformation {
    pub record: u64,
    pub parent: u64,
    pub name: String,
    pub flags: u8,
    /// Size of the unnamed stream.
    pub size: u64,
    /// Size of every stream together.
    pub total_size: u64,
    pub created: u64,
    pub modified: u64,
    pub mft_modified: u64,
    pub accessed: u64,
}

impl FileInformation {
    pub fn new(file: &NtfsFile) -> NtfsResult<Self> {
        let info = file.standard_information()?;

        let mut flags = 0;
        let mut set = |condition: bool, flag: u8| {
            if condition {
                flags |= flag;
            }
        };
        set(file.is_directory(), DUMP_IS_DIRECTORY);
        set(file.is_deleted(), DUMP_IS_DELETED);
        set(info.has_attribute(NtfsFileAttributeFlags::ReadOnly), DUMP_IS_READ_ONLY);
        set(info.has_attribute(NtfsFileAttributeFlags::Hidden), DUMP_IS_HIDDEN);
        set(info.has_attribute(NtfsFileAttributeFlags::System), DUMP_IS_SYSTEM);
        set(info.has_attribute(NtfsFileAttributeFlags::Compressed), DUMP_IS_COMPRESSED);
        set(info.has_attribute(NtfsFileAttributeFlags::Encrypted), DUMP_IS_ENCRYPTED);
        set(info.has_attribute(NtfsFileAttributeFlags::Archive), DUMP_IS_ARCHIVED);

        Ok(FileInformation {
            record: file.number(),
            parent: file.parent_reference()?.record_number(),
            name: file.friendly_name()?,
            flags,
            size: file.main_size()?,
            total_size: file.total_size()?,
            created: info.inner.creation_time,
            modified: info.inner.modification_time,
            mft_modified: info.inner.mft_record_modification_time,
            accessed: info.inner.access_time,
        })
    }

    pub fn is_directory(&self) -> bool {
        self.flags & DUMP_IS_DIRECTORY != 0
    }

    pub fn is_deleted(&self) -> bool {
        self.flags & DUMP_IS_DELETED != 0
    }

    pub fn created(&self) -> OffsetDateTime {
        ntfs_to_unix_time(self.created)
    }

    pub fn modified(&self) -> OffsetDateTime {
        ntfs_to_unix_time(self.modified)
    }

    pub fn accessed(&self) -> OffsetDateTime {
        ntfs_to_unix_time(self.accessed)
    }

    pub fn serialized_len(&self) -> usize {
        DUMP_RECORD_HEADER_SIZE + self.name.encode_utf16().count() * 2
    }

    /// Appends the dump form: flags, sizes, the four times, record and parent
    /// numbers, then the length prefixed UTF-16 name. Little endian.
    pub fn serialize(&self, out: &mut Vec<u8>) {
        let name: Vec<u16> = self.name.encode_utf16().collect();

        out.reserve(DUMP_RECORD_HEADER_SIZE + name.len() * 2);
        out.push(self.flags);
        for value in [
            self.size,
            self.total_size,
            self.created,
            self.modified,
            self.mft_modified,
            self.accessed,
            self.record,
            self.parent,
        ] {
            out.extend_from_slice(&value.to_le_bytes());
        }
        out.extend_from_slice(&(name.len() as u32).to_le_bytes());
        for unit in name {
            out.extend_from_slice(&unit.to_le_bytes());
        }
    }

    pub fn write_to<S: OutStream>(&self, sink: &mut S) -> NtfsResult<()> {
        let mut buffer = Vec::new();
        self.serialize(&mut buffer);
        sink.write_chunk(&buffer).map_err(NtfsError::OutputError)
    }

    /// Decodes one serialized file and returns it with the bytes it used.
    pub fn parse_serialized(data: &[u8]) -> NtfsResult<(Self, usize)> {
        if data.len() < DUMP_RECORD_HEADER_SIZE {
            return Err(NtfsError::BadSize {
                expected: DUMP_RECORD_HEADER_SIZE as u64,
                actual: data.len() as u64,
            });
        }
        let header: DumpRecordHeader = read_struct(data)?;

        let end = DUMP_RECORD_HEADER_SIZE + header.name_length as usize * 2;
        let name = data
            .get(DUMP_RECORD_HEADER_SIZE..end)
            .map(decode_utf16)
            .ok_or(NtfsError::BadSize {
                expected: end as u64,
                actual: data.len() as u64,
            })?;

        let info = FileInformation {
            record: header.record,
            parent: header.parent,
            name,
            flags: header.flags,
            size: header.size,
            total_size: header.total_size,
            created: header.created,
            modified: header.modified,
            mft_modified: header.mft_modified,
            accessed: header.accessed,
        };
        Ok((info, end))
    }
}

/// Decodes a whole dump, as concatenated by `dump_full_dir`.
pub fn parse_dump(mut data: &[u8]) -> NtfsResult<Vec<FileInformation>> {
    let mut files = Vec::new();
    while !data.is_empty() {
        let (info, used) = FileInformation::parse_serialized(data)?;
        files.push(info);
        data = &data[used..];
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialized_layout() {
        let info = FileInformation {
            record: 42,
            parent: 5,
            name: "ab".to_string(),
            flags: DUMP_IS_DIRECTORY | DUMP_IS_HIDDEN,
            size: 0x1122,
            total_size: 0x3344,
            created: 1,
            modified: 2,
            mft_modified: 3,
            accessed: 4,
        };

        let mut out = Vec::new();
        info.serialize(&mut out);

        assert_eq!(out.len(), 73);
        assert_eq!(out.len(), info.serialized_len());
        assert_eq!(out[0], 9);
        assert_eq!(&out[1..9], &0x1122u64.to_le_bytes());
        assert_eq!(&out[49..57], &42u64.to_le_bytes());
        assert_eq!(&out[57..65], &5u64.to_le_bytes());
        assert_eq!(&out[65..69], &2u32.to_le_bytes());
        assert_eq!(&out[69..], &[b'a', 0, b'b', 0]);

        let (parsed, used) = FileInformation::parse_serialized(&out).unwrap();
        assert_eq!(used, 73);
        assert_eq!(parsed, info);
    }

    #[test]
    fn truncated_dump_is_a_bad_size() {
        let info = FileInformation {
            name: "name.txt".to_string(),
            ..Default::default()
        };
        let mut out = Vec::new();
        info.serialize(&mut out);

        assert!(matches!(
            parse_dump(&out[..out.len() - 1]),
            Err(NtfsError::BadSize { .. })
        ));
        assert!(matches!(
            parse_dump(&out[..10]),
            Err(NtfsError::BadSize { .. })
        ));
    }
}
