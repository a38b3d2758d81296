// Copyright (c) 2022, Matteo Bernacchia <dev@kikijiki.com>. All rights reserved.
// This project is dual licensed under the Apache License 2.0 and the MIT license.
// See the LICENSE files in the project root for details.

use std::fmt;
use std::io::Cursor;

use binread::{BinRead, BinReaderExt};
use time::OffsetDateTime;

use crate::errors::NtfsResult;

pub const BOOT_SECTOR_SIZE: usize = 512;
pub const FIXUP_STRIDE: usize = 512;
pub const MFT_RECORD: u64 = 0;
pub const VOLUME_RECORD: u64 = 3;
pub const ROOT_RECORD: u64 = 5;
pub const FIRST_USER_RECORD: u64 = 16;
pub const NTFS_SIGNATURE: &[u8; 8] = b"NTFS    ";
pub const FILE_RECORD_SIGNATURE: &[u8; 4] = b"FILE";
pub const INDEX_RECORD_SIGNATURE: &[u8; 4] = b"INDX";
pub const DIRECTORY_INDEX_NAME: &str = "$I30";
pub const DOS_NAME_LENGTH: usize = 8;
pub const MINIMUM_MAJOR_VERSION: u8 = 3;
pub const EPOCH_DIFFERENCE: u64 = 116_444_736_000_000_000;

pub const FSCTL_QUERY_USN_JOURNAL: u32 = 0x0009_00f4;
pub const FSCTL_READ_USN_JOURNAL: u32 = 0x0009_00bb;

#[allow(unused)]
#[derive(Clone, Copy, Debug, BinRead)]
#[br(little)]
pub struct BootSector {
    pub jump: [u8; 3],
    pub oem_id: [u8; 8],
    pub sector_size: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub fats: u8,
    pub root_entries: u16,
    pub sectors: u16,
    pub media_descriptor: u8,
    pub sectors_per_fat: u16,
    pub sectors_per_track: u16,
    pub heads: u16,
    pub hidden_sectors: u32,
    pub large_sectors: u32,
    pub unused: u32,
    pub total_sectors: u64,
    pub mft_lcn: u64,
    pub mft_mirror_lcn: u64,
    pub file_record_size_info: i8,
    pub reserved_0: [u8; 3],
    pub index_record_size_info: i8,
    pub reserved_1: [u8; 3],
    pub serial_number: u64,
    pub checksum: u32,
    pub bootstrap: [u8; 426],
    pub end_marker: u16,
}

#[derive(Clone, Copy, Debug, BinRead)]
#[br(little)]
pub struct NtfsFileRecordHeader {
    // Record
    pub signature: [u8; 4],
    pub update_sequence_offset: u16,
    pub update_sequence_length: u16,
    pub logfile_sequence_number: u64,
    // File
    pub sequence_value: u16,
    pub link_count: u16,
    pub attributes_offset: u16,
    pub flags: u16,
    pub used_size: u32,
    pub allocated_size: u32,
    pub base_reference: u64,
    pub next_attribute_id: u16,
    pub alignment: u16,
    pub record_number: u32,
}

#[repr(u16)]
pub enum NtfsFileFlags {
    InUse = 0x0001,
    IsDirectory = 0x0002,
}

#[derive(Clone, Copy, Debug, BinRead)]
#[br(little)]
pub struct NtfsAttributeHeader {
    pub type_id: u32,
    pub length: u32,
    pub is_non_resident: u8,
    pub name_length: u8,
    pub name_offset: u16,
    pub flags: u16,
    pub id: u16,
}

#[repr(u16)]
pub enum NtfsAttributeFlags {
    Compressed = 0x0001,
    Encrypted = 0x4000,
    Sparse = 0x8000,
}

#[derive(Clone, Copy, Debug, BinRead)]
#[br(little)]
pub struct NtfsResidentAttributeHeader {
    pub attribute_header: NtfsAttributeHeader,
    pub value_length: u32,
    pub value_offset: u16,
    pub indexed_flag: u8,
    pub alignment: u8,
}

#[derive(Clone, Copy, Debug, BinRead)]
#[br(little)]
pub struct NtfsNonResidentAttributeHeader {
    pub attribute_header: NtfsAttributeHeader,
    pub lowest_vcn: u64,
    pub highest_vcn: u64,
    pub data_runs_offset: u16,
    pub compression_unit_exponent: u16,
    pub reserved: [u8; 4],
    pub allocated_size: u64,
    pub data_size: u64,
    pub initialized_size: u64,
}

#[derive(Clone, Copy, Debug, BinRead)]
#[br(little)]
pub struct NtfsStandardInformation {
    pub creation_time: u64,
    pub modification_time: u64,
    pub mft_record_modification_time: u64,
    pub access_time: u64,
    pub file_attributes: u32,
}

#[repr(u8)]
pub enum NtfsFileNamespace {
    Posix = 0,
    Win32 = 1,
    Dos = 2,
    Win32AndDos = 3,
}

#[derive(Clone, Debug, BinRead)]
#[br(little)]
pub struct NtfsFileNameHeader {
    pub parent_directory_reference: u64,
    pub creation_time: u64,
    pub modification_time: u64,
    pub mft_record_modification_time: u64,
    pub access_time: u64,
    pub allocated_size: u64,
    pub real_size: u64,
    pub file_attributes: u32,
    pub reparse_point_tag: u32,
    pub name_length: u8,
    pub namespace: u8,
    #[br(count = name_length as usize)]
    pub name: Vec<u16>,
}

#[repr(u32)]
pub enum NtfsFileAttributeFlags {
    ReadOnly = 0x0001,
    Hidden = 0x0002,
    System = 0x0004,
    Archive = 0x0020,
    Device = 0x0040,
    Normal = 0x0080,
    Temporary = 0x0100,
    SparseFile = 0x0200,
    ReparsePoint = 0x0400,
    Compressed = 0x0800,
    Offline = 0x1000,
    NotContentIndexed = 0x2000,
    Encrypted = 0x4000,
    IsDirectory = 0x1000_0000,
}

#[derive(Clone, Copy, Debug, BinRead)]
#[br(little)]
pub struct NtfsVolumeInformation {
    pub reserved: u64,
    pub major_version: u8,
    pub minor_version: u8,
    pub flags: u16,
}

#[derive(Clone, Copy, Debug, BinRead)]
#[br(little)]
pub struct NtfsAttributeListEntry {
    pub type_id: u32,
    pub length: u16,
    pub name_length: u8,
    pub name_offset: u8,
    pub lowest_vcn: u64,
    pub reference: u64,
    pub id: u16,
}

/// Offsets are relative to the start of this header, not to the entries.
#[derive(Clone, Copy, Debug, BinRead)]
#[br(little)]
pub struct NtfsIndexHeader {
    pub entries_offset: u32,
    pub index_length: u32,
    pub allocated_size: u32,
    pub flags: u8,
    pub reserved: [u8; 3],
}

#[derive(Clone, Copy, Debug, BinRead)]
#[br(little)]
pub struct NtfsIndexRootHeader {
    pub attribute_type: u32,
    pub collation_rule: u32,
    pub index_block_size: u32,
    pub clusters_per_index_block: u8,
    pub reserved: [u8; 3],
    pub index: NtfsIndexHeader,
}

#[derive(Clone, Copy, Debug, BinRead)]
#[br(little)]
pub struct NtfsIndexRecordHeader {
    pub signature: [u8; 4],
    pub update_sequence_offset: u16,
    pub update_sequence_length: u16,
    pub logfile_sequence_number: u64,
    pub vcn: u64,
    pub index: NtfsIndexHeader,
}

pub const INDEX_RECORD_HEADER_OFFSET: usize = 24;
pub const INDEX_ROOT_HEADER_OFFSET: usize = 16;

#[derive(Clone, Copy, Debug, BinRead)]
#[br(little)]
pub struct NtfsIndexEntryHeader {
    pub reference: u64,
    pub length: u16,
    pub stream_length: u16,
    pub flags: u8,
    pub reserved: [u8; 3],
}

pub const INDEX_ENTRY_HEADER_SIZE: usize = 16;

#[repr(u8)]
pub enum NtfsIndexEntryFlags {
    SubNode = 0x01,
    Last = 0x02,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum NtfsAttributeType {
    StandardInformation = 0x10,
    AttributeList = 0x20,
    FileName = 0x30,
    ObjectId = 0x40,
    SecurityDescriptor = 0x50,
    VolumeName = 0x60,
    VolumeInformation = 0x70,
    Data = 0x80,
    IndexRoot = 0x90,
    IndexAllocation = 0xA0,
    Bitmap = 0xB0,
    ReparsePoint = 0xC0,
    EaInformation = 0xD0,
    Ea = 0xE0,
    LoggedUtilityStream = 0x100,
    End = 0xFFFF_FFFF,
}

#[derive(Clone, Copy, Debug, Default, BinRead)]
#[br(little)]
pub struct UsnJournalData {
    pub journal_id: u64,
    pub first_usn: i64,
    pub next_usn: i64,
    pub lowest_valid_usn: i64,
    pub max_usn: i64,
    pub maximum_size: u64,
    pub allocation_delta: u64,
}

pub struct ReadUsnJournalData {
    pub start_usn: i64,
    pub reason_mask: u32,
    pub return_only_on_close: u32,
    pub timeout: u64,
    pub bytes_to_wait_for: u64,
    pub journal_id: u64,
}

impl ReadUsnJournalData {
    pub const SIZE: usize = 40;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.start_usn.to_le_bytes());
        out.extend_from_slice(&self.reason_mask.to_le_bytes());
        out.extend_from_slice(&self.return_only_on_close.to_le_bytes());
        out.extend_from_slice(&self.timeout.to_le_bytes());
        out.extend_from_slice(&self.bytes_to_wait_for.to_le_bytes());
        out.extend_from_slice(&self.journal_id.to_le_bytes());
        out
    }
}

#[derive(Clone, Copy, Debug, BinRead)]
#[br(little)]
pub struct UsnRecordV2Header {
    pub record_length: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub file_reference_number: u64,
    pub parent_file_reference_number: u64,
    pub usn: i64,
    pub timestamp: i64,
    pub reason: u32,
    pub source_info: u32,
    pub security_id: u32,
    pub file_attributes: u32,
    pub file_name_length: u16,
    pub file_name_offset: u16,
}

pub const USN_RECORD_V2_HEADER_SIZE: usize = 60;

/// Fixed part of one serialized file in a full directory dump. The UTF-16
/// name follows.
#[derive(Clone, Copy, Debug, BinRead)]
#[br(little)]
pub struct DumpRecordHeader {
    pub flags: u8,
    pub size: u64,
    pub total_size: u64,
    pub created: u64,
    pub modified: u64,
    pub mft_modified: u64,
    pub accessed: u64,
    pub record: u64,
    pub parent: u64,
    pub name_length: u32,
}

pub const DUMP_RECORD_HEADER_SIZE: usize = 69;

pub const USN_REASON_DATA_OVERWRITE: u32 = 0x0000_0001;
pub const USN_REASON_DATA_EXTEND: u32 = 0x0000_0002;
pub const USN_REASON_DATA_TRUNCATION: u32 = 0x0000_0004;
pub const USN_REASON_NAMED_DATA_OVERWRITE: u32 = 0x0000_0010;
pub const USN_REASON_NAMED_DATA_EXTEND: u32 = 0x0000_0020;
pub const USN_REASON_NAMED_DATA_TRUNCATION: u32 = 0x0000_0040;
pub const USN_REASON_FILE_CREATE: u32 = 0x0000_0100;
pub const USN_REASON_FILE_DELETE: u32 = 0x0000_0200;
pub const USN_REASON_EA_CHANGE: u32 = 0x0000_0400;
pub const USN_REASON_SECURITY_CHANGE: u32 = 0x0000_0800;
pub const USN_REASON_RENAME_OLD_NAME: u32 = 0x0000_1000;
pub const USN_REASON_RENAME_NEW_NAME: u32 = 0x0000_2000;
pub const USN_REASON_INDEXABLE_CHANGE: u32 = 0x0000_4000;
pub const USN_REASON_BASIC_INFO_CHANGE: u32 = 0x0000_8000;
pub const USN_REASON_HARD_LINK_CHANGE: u32 = 0x0001_0000;
pub const USN_REASON_COMPRESSION_CHANGE: u32 = 0x0002_0000;
pub const USN_REASON_ENCRYPTION_CHANGE: u32 = 0x0004_0000;
pub const USN_REASON_OBJECT_ID_CHANGE: u32 = 0x0008_0000;
pub const USN_REASON_REPARSE_POINT_CHANGE: u32 = 0x0010_0000;
pub const USN_REASON_STREAM_CHANGE: u32 = 0x0020_0000;
pub const USN_REASON_CLOSE: u32 = 0x8000_0000;
pub const USN_REASON_ALL: u32 = 0xFFFF_FFFF;

/// 48-bit record number plus 16-bit sequence number. The sequence number is
/// carried along but never checked against the record it points to.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct MftReference(pub u64);

impl MftReference {
    pub const RECORD_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

    pub fn new(record_number: u64, sequence_number: u16) -> Self {
        MftReference(((sequence_number as u64) << 48) | (record_number & Self::RECORD_MASK))
    }

    pub fn record_number(&self) -> u64 {
        self.0 & Self::RECORD_MASK
    }

    pub fn sequence_number(&self) -> u16 {
        (self.0 >> 48) as u16
    }
}

impl fmt::Display for MftReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}:{}", self.record_number(), self.sequence_number())
    }
}

pub fn ntfs_to_unix_time(src: u64) -> OffsetDateTime {
    src.checked_sub(EPOCH_DIFFERENCE)
        .and_then(|unix| OffsetDateTime::from_unix_timestamp_nanos(unix as i128 * 100).ok())
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

pub fn read_struct<T: BinRead>(data: &[u8]) -> NtfsResult<T> {
    Ok(Cursor::new(data).read_le::<T>()?)
}

pub fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

pub fn decode_utf16(data: &[u8]) -> String {
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}
