// Copyright (c) 2022, Matteo Bernacchia <dev@kikijiki.com>. All rights reserved.
// This project is dual licensed under the Apache License 2.0 and the MIT license.
// See the LICENSE files in the project root for details.

//! Builders for synthetic NTFS structures: single attributes and records for
//! unit tests, whole volume images for the integration tests.

use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};

use crate::{
    api::*,
    device::{BlockDevice, FileDevice},
};

pub const SECTOR_SIZE: u64 = 512;
pub const CLUSTER_SIZE: u64 = 1024;
pub const RECORD_SIZE: usize = 1024;
pub const INDEX_BLOCK_SIZE: usize = 4096;
pub const MFT_LCN: u64 = 4;
pub const MFT_RECORDS: u64 = 64;
pub const SERIAL_NUMBER: u64 = 0x1234_5678_9ABC_DEF0;
/// Contents up to this size are stored resident.
pub const RESIDENT_LIMIT: usize = 256;
/// 2022-10-18, as a FILETIME.
pub const TEST_TIMESTAMP: u64 = 133_105_536_000_000_000;

const RECORD_USA_OFFSET: usize = 0x30;
const INDEX_USA_OFFSET: usize = 0x28;
const INDEX_ENTRIES_START: usize = 0x40;
const DIRECTORY_CHILDREN_IN_ROOT: usize = 3;

fn align8(n: usize) -> usize {
    n.next_multiple_of(8)
}

fn put_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(data: &mut [u8], offset: usize, value: u64) {
    data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn utf16_bytes(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

/// Letter of the volume the live tests run against. On CI this is the drive
/// of the working directory, locally the `R:` ramdisk.
pub fn test_volume_letter() -> char {
    if env::var_os("CI").is_some() {
        if let Ok(cwd) = env::current_dir() {
            let s = cwd.display().to_string();
            let mut chars = s.chars();
            if let (Some(letter), Some(':')) = (chars.next(), chars.next()) {
                return letter;
            }
        }
    }

    'R'
}

pub struct TempDirGuard(pub PathBuf);

impl TempDirGuard {
    pub fn new<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let p = path.as_ref().to_path_buf();
        let _ = std::fs::remove_dir_all(&p);
        std::fs::create_dir_all(&p)?;
        Ok(TempDirGuard(p))
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TempDirGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

/// Boot sector of an image with `cluster_size` byte clusters, `RECORD_SIZE`
/// records and `index_block_size` byte index blocks.
pub fn boot_sector(total_sectors: u64, cluster_size: u64, index_block_size: usize) -> Vec<u8> {
    let mut data = vec![0u8; BOOT_SECTOR_SIZE];
    data[0..3].copy_from_slice(&[0xEB, 0x52, 0x90]);
    data[3..11].copy_from_slice(NTFS_SIGNATURE);
    put_u16(&mut data, 11, SECTOR_SIZE as u16);
    data[13] = (cluster_size / SECTOR_SIZE) as u8;
    data[21] = 0xF8;
    put_u64(&mut data, 40, total_sectors);
    put_u64(&mut data, 48, MFT_LCN);
    put_u64(&mut data, 56, MFT_LCN + MFT_RECORDS);
    data[64] = -(RECORD_SIZE.trailing_zeros() as i8) as u8;
    data[68] = -(index_block_size.trailing_zeros() as i8) as u8;
    put_u64(&mut data, 72, SERIAL_NUMBER);
    put_u16(&mut data, 510, 0xAA55);
    data
}

fn signed_width(value: i64) -> usize {
    (1..=8)
        .find(|n| {
            let shift = 64 - 8 * n;
            (value << shift) >> shift == value
        })
        .unwrap_or(8)
}

fn unsigned_width(value: u64) -> usize {
    (1..8).find(|n| value >> (8 * n) == 0).unwrap_or(8)
}

/// Mapping pairs for `(clusters, lcn delta)` runs; `None` is a sparse run.
pub fn encode_data_runs(runs: &[(u64, Option<i64>)]) -> Vec<u8> {
    let mut out = Vec::new();
    for &(clusters, delta) in runs {
        let count_width = unsigned_width(clusters);
        let delta_width = delta.map(signed_width).unwrap_or(0);

        out.push(((delta_width as u8) << 4) | count_width as u8);
        out.extend_from_slice(&clusters.to_le_bytes()[..count_width]);
        if let Some(delta) = delta {
            out.extend_from_slice(&delta.to_le_bytes()[..delta_width]);
        }
    }
    out.push(0);
    out
}

pub fn resident_attribute(type_id: u32, name: &str, value: &[u8], instance: u16) -> Vec<u8> {
    let name = utf16_bytes(name);
    let value_offset = align8(24 + name.len());
    let length = align8(value_offset + value.len());

    let mut data = vec![0u8; length];
    put_u32(&mut data, 0, type_id);
    put_u32(&mut data, 4, length as u32);
    data[8] = 0;
    data[9] = (name.len() / 2) as u8;
    put_u16(&mut data, 10, 24);
    put_u16(&mut data, 14, instance);
    put_u32(&mut data, 16, value.len() as u32);
    put_u16(&mut data, 20, value_offset as u16);
    data[24..24 + name.len()].copy_from_slice(&name);
    data[value_offset..value_offset + value.len()].copy_from_slice(value);
    data
}

#[allow(clippy::too_many_arguments)]
pub fn non_resident_attribute(
    type_id: u32,
    name: &str,
    runs: &[u8],
    lowest_vcn: u64,
    highest_vcn: u64,
    allocated_size: u64,
    data_size: u64,
    initialized_size: u64,
    flags: u16,
) -> Vec<u8> {
    let name = utf16_bytes(name);
    let runs_offset = align8(64 + name.len());
    let length = align8(runs_offset + runs.len());

    let mut data = vec![0u8; length];
    put_u32(&mut data, 0, type_id);
    put_u32(&mut data, 4, length as u32);
    data[8] = 1;
    data[9] = (name.len() / 2) as u8;
    put_u16(&mut data, 10, 64);
    put_u16(&mut data, 12, flags);
    put_u64(&mut data, 16, lowest_vcn);
    put_u64(&mut data, 24, highest_vcn);
    put_u16(&mut data, 32, runs_offset as u16);
    if flags & NtfsAttributeFlags::Compressed as u16 != 0 {
        put_u16(&mut data, 34, 4);
    }
    put_u64(&mut data, 40, allocated_size);
    put_u64(&mut data, 48, data_size);
    put_u64(&mut data, 56, initialized_size);
    data[64..64 + name.len()].copy_from_slice(&name);
    data[runs_offset..runs_offset + runs.len()].copy_from_slice(runs);
    data
}

pub fn file_name_value(parent: u64, name: &str, namespace: u8, file_attributes: u32) -> Vec<u8> {
    let name = utf16_bytes(name);
    let mut data = vec![0u8; 66 + name.len()];
    put_u64(&mut data, 0, MftReference::new(parent, 1).0);
    for offset in [8, 16, 24, 32] {
        put_u64(&mut data, offset, TEST_TIMESTAMP);
    }
    put_u32(&mut data, 56, file_attributes);
    data[64] = (name.len() / 2) as u8;
    data[65] = namespace;
    data[66..].copy_from_slice(&name);
    data
}

pub fn standard_information_value(file_attributes: u32) -> Vec<u8> {
    let mut data = vec![0u8; 48];
    put_u64(&mut data, 0, TEST_TIMESTAMP);
    put_u64(&mut data, 8, TEST_TIMESTAMP + 10_000_000);
    put_u64(&mut data, 16, TEST_TIMESTAMP + 20_000_000);
    put_u64(&mut data, 24, TEST_TIMESTAMP + 30_000_000);
    put_u32(&mut data, 32, file_attributes);
    data
}

/// Installs an update sequence array at `usa_offset` covering every 512 byte
/// block of `data`.
pub fn protect(data: &mut [u8], usa_offset: usize, sequence: u16) {
    let blocks = data.len() / FIXUP_STRIDE;
    put_u16(data, 4, usa_offset as u16);
    put_u16(data, 6, (blocks + 1) as u16);
    put_u16(data, usa_offset, sequence);

    for block in 1..=blocks {
        let tail = block * FIXUP_STRIDE - 2;
        data.copy_within(tail..tail + 2, usa_offset + block * 2);
        put_u16(data, tail, sequence);
    }
}

/// A protected `RECORD_SIZE` FILE record holding `attributes` in order.
pub fn file_record(
    number: u64,
    sequence: u16,
    flags: u16,
    base_reference: u64,
    attributes: &[Vec<u8>],
) -> Vec<u8> {
    let mut data = vec![0u8; RECORD_SIZE];
    data[0..4].copy_from_slice(FILE_RECORD_SIGNATURE);
    put_u16(&mut data, 16, sequence);
    put_u16(&mut data, 18, 1);
    let attributes_offset = align8(RECORD_USA_OFFSET + 6);
    put_u16(&mut data, 20, attributes_offset as u16);
    put_u16(&mut data, 22, flags);
    put_u32(&mut data, 28, RECORD_SIZE as u32);
    put_u64(&mut data, 32, base_reference);
    put_u16(&mut data, 40, attributes.len() as u16);
    put_u32(&mut data, 44, number as u32);

    let mut offset = attributes_offset;
    for attribute in attributes {
        data[offset..offset + attribute.len()].copy_from_slice(attribute);
        offset += attribute.len();
    }
    put_u32(&mut data, offset, NtfsAttributeType::End as u32);
    let used = offset + 8;
    assert!(used <= RECORD_SIZE - 2, "record {} overflows", number);
    put_u32(&mut data, 24, used as u32);

    protect(&mut data, RECORD_USA_OFFSET, 1);
    data
}

pub fn index_entry(
    record: u64,
    file_name: Option<Vec<u8>>,
    child_vcn: Option<u64>,
    last: bool,
) -> Vec<u8> {
    let stream = file_name.unwrap_or_default();
    let body = align8(INDEX_ENTRY_HEADER_SIZE + stream.len());
    let length = body + if child_vcn.is_some() { 8 } else { 0 };

    let mut data = vec![0u8; length];
    if !last {
        put_u64(&mut data, 0, MftReference::new(record, 1).0);
    }
    put_u16(&mut data, 8, length as u16);
    put_u16(&mut data, 10, stream.len() as u16);
    let mut flags = 0u8;
    if child_vcn.is_some() {
        flags |= NtfsIndexEntryFlags::SubNode as u8;
    }
    if last {
        flags |= NtfsIndexEntryFlags::Last as u8;
    }
    data[12] = flags;
    data[16..16 + stream.len()].copy_from_slice(&stream);
    if let Some(vcn) = child_vcn {
        put_u64(&mut data, length - 8, vcn);
    }
    data
}

/// An index header followed directly by `entries`.
pub fn index_node(entries: &[Vec<u8>]) -> Vec<u8> {
    let total: usize = entries.iter().map(Vec::len).sum();
    let mut data = vec![0u8; 16];
    put_u32(&mut data, 0, 16);
    put_u32(&mut data, 4, (16 + total) as u32);
    put_u32(&mut data, 8, (16 + total) as u32);
    for entry in entries {
        data.extend_from_slice(entry);
    }
    data
}

/// `vcn_step` is the VCN distance between two consecutive index blocks.
pub fn index_root_value(entries: &[Vec<u8>], has_blocks: bool, block_size: usize, vcn_step: u64) -> Vec<u8> {
    let mut data = vec![0u8; 16];
    put_u32(&mut data, 0, NtfsAttributeType::FileName as u32);
    put_u32(&mut data, 4, 1);
    put_u32(&mut data, 8, block_size as u32);
    data[12] = vcn_step as u8;

    let mut node = index_node(entries);
    node[12] = has_blocks as u8;
    data.extend_from_slice(&node);
    data
}

/// A protected INDX block holding `entries`.
pub fn index_block(vcn: u64, entries: &[Vec<u8>], block_size: usize) -> Vec<u8> {
    let mut data = vec![0u8; block_size];
    data[0..4].copy_from_slice(INDEX_RECORD_SIGNATURE);
    put_u64(&mut data, 16, vcn);

    let entries_offset = INDEX_ENTRIES_START - INDEX_RECORD_HEADER_OFFSET;
    let mut offset = INDEX_ENTRIES_START;
    for entry in entries {
        data[offset..offset + entry.len()].copy_from_slice(entry);
        offset += entry.len();
    }
    assert!(offset <= block_size - 2, "index block {} overflows", vcn);

    let header = INDEX_RECORD_HEADER_OFFSET;
    put_u32(&mut data, header, entries_offset as u32);
    put_u32(&mut data, header + 4, (offset - header) as u32);
    put_u32(&mut data, header + 8, (block_size - header) as u32);

    protect(&mut data, INDEX_USA_OFFSET, 1);
    data
}

pub fn usn_record_v2(
    usn: i64,
    file: MftReference,
    parent: MftReference,
    reason: u32,
    name: &str,
) -> Vec<u8> {
    let name = utf16_bytes(name);
    let length = align8(USN_RECORD_V2_HEADER_SIZE + name.len());

    let mut data = vec![0u8; length];
    put_u32(&mut data, 0, length as u32);
    put_u16(&mut data, 4, 2);
    put_u64(&mut data, 8, file.0);
    put_u64(&mut data, 16, parent.0);
    put_u64(&mut data, 24, usn as u64);
    put_u64(&mut data, 32, TEST_TIMESTAMP);
    put_u32(&mut data, 40, reason);
    put_u32(&mut data, 52, NtfsFileAttributeFlags::Archive as u32);
    put_u16(&mut data, 56, name.len() as u16);
    put_u16(&mut data, 58, USN_RECORD_V2_HEADER_SIZE as u16);
    data[USN_RECORD_V2_HEADER_SIZE..USN_RECORD_V2_HEADER_SIZE + name.len()].copy_from_slice(&name);
    data
}

/// Change journal answering the two journal control codes from a list of
/// records.
#[derive(Clone, Debug)]
pub struct ScriptedJournal {
    pub journal_id: u64,
    pub first_usn: i64,
    pub next_usn: i64,
    /// Most records returned by one read request.
    pub batch_size: usize,
    /// Repeat the record just before the requested USN at the head of each
    /// response.
    pub replay_previous: bool,
    /// Answer every read request with its own start USN as the next USN.
    pub stalled: bool,
    /// Start USN of every read request received.
    pub requests: Vec<i64>,
    records: Vec<(i64, u32, Vec<u8>)>,
}

impl ScriptedJournal {
    pub fn new(journal_id: u64, first_usn: i64) -> Self {
        ScriptedJournal {
            journal_id,
            first_usn,
            next_usn: first_usn,
            batch_size: usize::MAX,
            replay_previous: false,
            stalled: false,
            requests: Vec::new(),
            records: Vec::new(),
        }
    }

    pub fn append(&mut self, file: MftReference, parent: MftReference, reason: u32, name: &str) -> i64 {
        let usn = self.next_usn;
        let data = usn_record_v2(usn, file, parent, reason, name);
        self.next_usn += data.len() as i64;
        self.records.push((usn, reason, data));
        usn
    }

    fn query(&self) -> Vec<u8> {
        let mut data = vec![0u8; 56];
        put_u64(&mut data, 0, self.journal_id);
        put_u64(&mut data, 8, self.first_usn as u64);
        put_u64(&mut data, 16, self.next_usn as u64);
        put_u64(&mut data, 24, self.first_usn as u64);
        put_u64(&mut data, 32, i64::MAX as u64);
        put_u64(&mut data, 40, 32 * 1024 * 1024);
        put_u64(&mut data, 48, 4 * 1024 * 1024);
        data
    }

    fn read(&mut self, input: &[u8], output_size: usize) -> io::Result<Vec<u8>> {
        if input.len() < ReadUsnJournalData::SIZE {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "short request"));
        }
        let field = |offset: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&input[offset..offset + 8]);
            u64::from_le_bytes(bytes)
        };
        let start = field(0) as i64;
        let mask = field(8) as u32;
        if field(32) != self.journal_id {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "journal id mismatch"));
        }
        self.requests.push(start);

        let mut out = vec![0u8; 8];
        if self.replay_previous {
            if let Some((_, _, data)) = self.records.iter().rev().find(|(usn, _, _)| *usn < start) {
                out.extend_from_slice(data);
            }
        }

        let mut next = self.next_usn;
        let mut returned = 0usize;
        for (usn, reason, data) in self.records.iter().filter(|(usn, _, _)| *usn >= start) {
            if returned == self.batch_size || out.len() + data.len() > output_size {
                next = *usn;
                break;
            }
            if reason & mask != 0 {
                out.extend_from_slice(data);
                returned += 1;
            }
        }

        let next = if self.stalled { start } else { i64::max(next, start) };
        put_u64(&mut out, 0, next as u64);
        Ok(out)
    }
}

/// An in-memory volume that logs every read and optionally carries a change
/// journal.
pub struct MemoryDevice {
    inner: FileDevice<Cursor<Vec<u8>>>,
    reads: Vec<(u64, usize)>,
    journal: Option<ScriptedJournal>,
}

impl MemoryDevice {
    pub fn new(image: Vec<u8>) -> Self {
        MemoryDevice {
            inner: FileDevice::new(Cursor::new(image)).expect("512 is a valid alignment"),
            reads: Vec::new(),
            journal: None,
        }
    }

    pub fn with_letter(image: Vec<u8>, letter: char) -> Self {
        MemoryDevice {
            inner: FileDevice::with_letter(Cursor::new(image), letter)
                .expect("512 is a valid alignment"),
            reads: Vec::new(),
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: ScriptedJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn journal_mut(&mut self) -> Option<&mut ScriptedJournal> {
        self.journal.as_mut()
    }

    /// `(offset, length)` of every read since the last `clear_reads`.
    pub fn reads(&self) -> &[(u64, usize)] {
        &self.reads
    }

    pub fn clear_reads(&mut self) {
        self.reads.clear();
    }
}

impl BlockDevice for MemoryDevice {
    fn read_bytes(&mut self, offset: u64, length: usize) -> io::Result<Vec<u8>> {
        self.reads.push((offset, length));
        self.inner.read_bytes(offset, length)
    }

    fn device_control(&mut self, code: u32, input: &[u8], output_size: usize) -> io::Result<Vec<u8>> {
        let journal = self.journal.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Unsupported, "no change journal on this volume")
        })?;
        match code {
            FSCTL_QUERY_USN_JOURNAL => Ok(journal.query()),
            FSCTL_READ_USN_JOURNAL => journal.read(input, output_size),
            _ => Err(io::Error::new(io::ErrorKind::Unsupported, "unknown control code")),
        }
    }

    fn volume_letter(&self) -> Option<char> {
        self.inner.volume_letter()
    }
}

struct PendingRecord {
    sequence: u16,
    flags: u16,
    base_reference: u64,
    attributes: Vec<Vec<u8>>,
    extensions: Vec<u64>,
}

struct Child {
    record: u64,
    name: String,
    namespace: u8,
    is_directory: bool,
}

/// Builds a small but complete NTFS image: boot sector, an MFT of
/// `MFT_RECORDS` records, `$Volume`, the root directory and whatever files
/// the test adds. Directories with more than three entries get a two level
/// index with blocks in `$INDEX_ALLOCATION`.
pub struct ImageBuilder {
    image: Vec<u8>,
    records: BTreeMap<u64, PendingRecord>,
    directories: BTreeMap<u64, Vec<Child>>,
    cyclic: BTreeSet<u64>,
    corrupted: BTreeSet<u64>,
    next_record: u64,
    next_lcn: u64,
    version: (u8, u8),
    cluster_size: u64,
    index_block_size: usize,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self::with_geometry(CLUSTER_SIZE, INDEX_BLOCK_SIZE)
    }

    /// An image with other cluster and index block sizes. Both must be
    /// powers of two of at least 512 bytes, and the MFT must fill whole
    /// clusters.
    pub fn with_geometry(cluster_size: u64, index_block_size: usize) -> Self {
        assert!(cluster_size.is_power_of_two() && cluster_size >= SECTOR_SIZE);
        assert!(index_block_size.is_power_of_two() && index_block_size >= FIXUP_STRIDE);

        let mft_size = MFT_RECORDS * RECORD_SIZE as u64;
        assert!(mft_size % cluster_size == 0, "MFT must fill whole clusters");
        let mft_clusters = mft_size / cluster_size;
        let first_data_lcn = MFT_LCN + mft_clusters;

        let mut builder = ImageBuilder {
            image: vec![0u8; (first_data_lcn * cluster_size) as usize],
            records: BTreeMap::new(),
            directories: BTreeMap::new(),
            cyclic: BTreeSet::new(),
            corrupted: BTreeSet::new(),
            next_record: FIRST_USER_RECORD,
            next_lcn: first_data_lcn,
            version: (3, 1),
            cluster_size,
            index_block_size,
        };

        builder.insert_record(MFT_RECORD, NtfsFileFlags::InUse as u16);
        builder.push_file_name(MFT_RECORD, ROOT_RECORD, "$MFT", 3, 0x6);
        builder.push_attribute(
            MFT_RECORD,
            non_resident_attribute(
                NtfsAttributeType::Data as u32,
                "",
                &encode_data_runs(&[(mft_clusters, Some(MFT_LCN as i64))]),
                0,
                mft_clusters - 1,
                mft_size,
                mft_size,
                mft_size,
                0,
            ),
        );

        builder.insert_record(VOLUME_RECORD, NtfsFileFlags::InUse as u16);
        builder.push_file_name(VOLUME_RECORD, ROOT_RECORD, "$Volume", 3, 0x6);
        builder.push_resident(VOLUME_RECORD, NtfsAttributeType::VolumeName, "", &utf16_bytes("TestVol"));

        builder.insert_record(
            ROOT_RECORD,
            NtfsFileFlags::InUse as u16 | NtfsFileFlags::IsDirectory as u16,
        );
        builder.push_file_name(ROOT_RECORD, ROOT_RECORD, ".", 3, 0x6 | NtfsFileAttributeFlags::IsDirectory as u32);
        builder.directories.insert(ROOT_RECORD, Vec::new());

        builder.link(ROOT_RECORD, MFT_RECORD, "$MFT", 3, false);
        builder.link(ROOT_RECORD, VOLUME_RECORD, "$Volume", 3, false);
        builder
    }

    /// Version written to `$VOLUME_INFORMATION`, 3.1 by default.
    pub fn version(mut self, major: u8, minor: u8) -> Self {
        self.version = (major, minor);
        self
    }

    fn insert_record(&mut self, number: u64, flags: u16) {
        self.records.insert(
            number,
            PendingRecord {
                sequence: 1,
                flags,
                base_reference: 0,
                attributes: Vec::new(),
                extensions: Vec::new(),
            },
        );
        self.push_resident(
            number,
            NtfsAttributeType::StandardInformation,
            "",
            &standard_information_value(NtfsFileAttributeFlags::Archive as u32),
        );
    }

    fn allocate_record(&mut self) -> u64 {
        let number = self.next_record;
        assert!(number < MFT_RECORDS, "test MFT is full");
        self.next_record += 1;
        number
    }

    fn record(&mut self, number: u64) -> &mut PendingRecord {
        self.records
            .get_mut(&number)
            .unwrap_or_else(|| panic!("record {} was not added", number))
    }

    fn push_attribute(&mut self, number: u64, mut attribute: Vec<u8>) {
        let record = self.record(number);
        put_u16(&mut attribute, 14, record.attributes.len() as u16);
        record.attributes.push(attribute);
    }

    fn push_resident(&mut self, number: u64, attribute_type: NtfsAttributeType, name: &str, value: &[u8]) {
        self.push_attribute(number, resident_attribute(attribute_type as u32, name, value, 0));
    }

    fn push_file_name(&mut self, number: u64, parent: u64, name: &str, namespace: u8, attributes: u32) {
        self.push_resident(
            number,
            NtfsAttributeType::FileName,
            "",
            &file_name_value(parent, name, namespace, attributes),
        );
    }

    fn link(&mut self, parent: u64, record: u64, name: &str, namespace: u8, is_directory: bool) {
        self.directories
            .get_mut(&parent)
            .unwrap_or_else(|| panic!("record {} is not a directory", parent))
            .push(Child {
                record,
                name: name.to_string(),
                namespace,
                is_directory,
            });
    }

    /// Copies `content` into freshly allocated clusters and returns the
    /// first LCN.
    fn allocate_clusters(&mut self, clusters: u64, content: &[u8]) -> u64 {
        let lcn = self.next_lcn;
        self.next_lcn += clusters;
        self.image.resize((self.next_lcn * self.cluster_size) as usize, 0);

        let start = (lcn * self.cluster_size) as usize;
        self.image[start..start + content.len()].copy_from_slice(content);
        lcn
    }

    fn clusters_for(&self, length: usize) -> u64 {
        (length as u64).div_ceil(self.cluster_size).max(1)
    }

    /// VCN distance between consecutive index blocks: clusters, or 512 byte
    /// units when a block is smaller than a cluster.
    fn index_vcn_step(&self) -> u64 {
        let block_size = self.index_block_size as u64;
        if block_size >= self.cluster_size {
            block_size / self.cluster_size
        } else {
            block_size / FIXUP_STRIDE as u64
        }
    }

    fn data_attribute(&mut self, stream: &str, content: &[u8]) -> Vec<u8> {
        if content.len() <= RESIDENT_LIMIT {
            return resident_attribute(NtfsAttributeType::Data as u32, stream, content, 0);
        }

        let clusters = self.clusters_for(content.len());
        let lcn = self.allocate_clusters(clusters, content);
        non_resident_attribute(
            NtfsAttributeType::Data as u32,
            stream,
            &encode_data_runs(&[(clusters, Some(lcn as i64))]),
            0,
            clusters - 1,
            clusters * self.cluster_size,
            content.len() as u64,
            content.len() as u64,
            0,
        )
    }

    fn new_file(&mut self, parent: u64, name: &str) -> u64 {
        let number = self.allocate_record();
        self.insert_record(number, NtfsFileFlags::InUse as u16);
        self.push_file_name(number, parent, name, NtfsFileNamespace::Win32 as u8, NtfsFileAttributeFlags::Archive as u32);
        self.link(parent, number, name, NtfsFileNamespace::Win32 as u8, false);
        number
    }

    /// A file with an unnamed stream; resident up to `RESIDENT_LIMIT` bytes.
    pub fn add_file(&mut self, parent: u64, name: &str, content: &[u8]) -> u64 {
        let number = self.new_file(parent, name);
        let data = self.data_attribute("", content);
        self.push_attribute(number, data);
        number
    }

    /// A file without any data stream.
    pub fn add_empty_file(&mut self, parent: u64, name: &str) -> u64 {
        self.new_file(parent, name)
    }

    /// A non-resident file whose runs are laid out back to front on disk, so
    /// every run after the first has a negative LCN delta.
    pub fn add_fragmented_file(&mut self, parent: u64, name: &str, content: &[u8], fragments: usize) -> u64 {
        let number = self.new_file(parent, name);

        let clusters = self.clusters_for(content.len());
        assert!(fragments as u64 <= clusters, "more fragments than clusters");
        let per_fragment = clusters.div_ceil(fragments as u64);
        let chunk = (per_fragment * self.cluster_size) as usize;

        let pieces: Vec<&[u8]> = content.chunks(chunk).collect();
        let mut lcns = vec![0u64; pieces.len()];
        for (i, piece) in pieces.iter().enumerate().rev() {
            // Leave a free cluster between fragments.
            self.allocate_clusters(1, &[]);
            lcns[i] = self.allocate_clusters(self.clusters_for(piece.len()), piece);
        }

        let mut runs = Vec::new();
        let mut previous = 0i64;
        for (piece, lcn) in pieces.iter().zip(&lcns) {
            runs.push((self.clusters_for(piece.len()), Some(*lcn as i64 - previous)));
            previous = *lcn as i64;
        }

        let attribute = non_resident_attribute(
            NtfsAttributeType::Data as u32,
            "",
            &encode_data_runs(&runs),
            0,
            clusters - 1,
            clusters * self.cluster_size,
            content.len() as u64,
            content.len() as u64,
            0,
        );
        self.push_attribute(number, attribute);
        number
    }

    /// A sparse file: `head` in real clusters followed by `hole` sparse
    /// clusters. The stream size covers both.
    pub fn add_sparse_file(&mut self, parent: u64, name: &str, head: &[u8], hole: u64) -> u64 {
        let number = self.new_file(parent, name);

        let head_clusters = self.clusters_for(head.len());
        let lcn = self.allocate_clusters(head_clusters, head);
        let clusters = head_clusters + hole;
        let size = clusters * self.cluster_size;

        let attribute = non_resident_attribute(
            NtfsAttributeType::Data as u32,
            "",
            &encode_data_runs(&[(head_clusters, Some(lcn as i64)), (hole, None)]),
            0,
            clusters - 1,
            size,
            size,
            size,
            NtfsAttributeFlags::Sparse as u16,
        );
        self.push_attribute(number, attribute);
        number
    }

    /// A non-resident file whose initialized size stops at `initialized`.
    pub fn add_preallocated_file(&mut self, parent: u64, name: &str, content: &[u8], initialized: u64) -> u64 {
        let number = self.new_file(parent, name);
        let mut attribute = self.data_attribute("", content);
        assert!(content.len() > RESIDENT_LIMIT, "content must be non-resident");
        put_u64(&mut attribute, 56, initialized);
        self.push_attribute(number, attribute);
        number
    }

    pub fn add_directory(&mut self, parent: u64, name: &str) -> u64 {
        let number = self.allocate_record();
        self.insert_record(
            number,
            NtfsFileFlags::InUse as u16 | NtfsFileFlags::IsDirectory as u16,
        );
        self.push_file_name(
            number,
            parent,
            name,
            NtfsFileNamespace::Win32 as u8,
            NtfsFileAttributeFlags::IsDirectory as u32,
        );
        self.directories.insert(number, Vec::new());
        self.link(parent, number, name, NtfsFileNamespace::Win32 as u8, true);
        number
    }

    /// A directory whose index block points back to itself.
    pub fn add_cyclic_directory(&mut self, parent: u64, name: &str) -> u64 {
        let number = self.add_directory(parent, name);
        self.cyclic.insert(number);
        number
    }

    /// Gives `record` a second, DOS only, name in `parent`.
    pub fn add_short_name(&mut self, parent: u64, record: u64, short: &str) {
        let is_directory = self.directories.contains_key(&record);
        self.push_file_name(record, parent, short, NtfsFileNamespace::Dos as u8, 0);
        self.link(parent, record, short, NtfsFileNamespace::Dos as u8, is_directory);
    }

    /// Adds a named data stream to `record`.
    pub fn add_stream(&mut self, record: u64, stream: &str, content: &[u8]) {
        let data = self.data_attribute(stream, content);
        self.push_attribute(record, data);
    }

    /// Adds `stream` to `record` split in two: the first half of the clusters
    /// stays in the record, the second half goes to a new extension record.
    /// An attribute list ties both together. Returns the extension record.
    pub fn add_extension_stream(&mut self, record: u64, stream: &str, content: &[u8]) -> u64 {
        let clusters = self.clusters_for(content.len());
        assert!(clusters >= 2, "a split stream needs two clusters");
        let first = clusters / 2;
        let split = (first * self.cluster_size) as usize;

        let first_lcn = self.allocate_clusters(first, &content[..split]);
        self.allocate_clusters(1, &[]);
        let second_lcn = self.allocate_clusters(clusters - first, &content[split..]);

        let data = NtfsAttributeType::Data as u32;
        let head = non_resident_attribute(
            data,
            stream,
            &encode_data_runs(&[(first, Some(first_lcn as i64))]),
            0,
            first - 1,
            clusters * self.cluster_size,
            content.len() as u64,
            content.len() as u64,
            0,
        );
        let tail = non_resident_attribute(
            data,
            stream,
            &encode_data_runs(&[(clusters - first, Some(second_lcn as i64))]),
            first,
            clusters - 1,
            0,
            0,
            0,
            0,
        );

        let extension = self.allocate_record();
        let sequence = self.record(record).sequence;
        self.records.insert(
            extension,
            PendingRecord {
                sequence: 1,
                flags: NtfsFileFlags::InUse as u16,
                base_reference: MftReference::new(record, sequence).0,
                attributes: Vec::new(),
                extensions: Vec::new(),
            },
        );
        self.push_attribute(record, head);
        self.push_attribute(extension, tail);
        self.record(record).extensions.push(extension);
        extension
    }

    pub fn mark_deleted(&mut self, record: u64) {
        self.record(record).flags &= !(NtfsFileFlags::InUse as u16);
    }

    /// Breaks the update sequence of `record` once it is written.
    pub fn corrupt_record(&mut self, record: u64) {
        self.corrupted.insert(record);
    }

    fn attribute_list(&self, number: u64) -> Vec<u8> {
        let mut members = vec![number];
        members.extend(&self.records[&number].extensions);

        let mut out = Vec::new();
        for member in members {
            let pending = &self.records[&member];
            let reference = MftReference::new(member, pending.sequence).0;
            for attribute in &pending.attributes {
                let name_length = attribute[9] as usize;
                let name_offset = u16::from_le_bytes([attribute[10], attribute[11]]) as usize;
                let name = &attribute[name_offset..name_offset + name_length * 2];
                let lowest_vcn = if attribute[8] != 0 {
                    u64::from_le_bytes(attribute[16..24].try_into().expect("eight bytes"))
                } else {
                    0
                };

                let length = align8(26 + name.len());
                let mut entry = vec![0u8; length];
                entry[0..4].copy_from_slice(&attribute[0..4]);
                put_u16(&mut entry, 4, length as u16);
                entry[6] = name_length as u8;
                entry[7] = 26;
                put_u64(&mut entry, 8, lowest_vcn);
                put_u64(&mut entry, 16, reference);
                entry[24..26].copy_from_slice(&attribute[14..16]);
                entry[26..26 + name.len()].copy_from_slice(name);
                out.extend_from_slice(&entry);
            }
        }
        out
    }

    fn directory_entry(&self, directory: u64, child: &Child) -> Vec<u8> {
        let attributes = if child.is_directory {
            NtfsFileAttributeFlags::IsDirectory as u32
        } else {
            NtfsFileAttributeFlags::Archive as u32
        };
        index_entry(
            child.record,
            Some(file_name_value(directory, &child.name, child.namespace, attributes)),
            None,
            false,
        )
    }

    /// Writes the `$I30` index of `directory`. Entries are sorted by upper
    /// cased name; every third one becomes a separator in the root, with the
    /// two before it in its own block.
    fn build_index(&mut self, directory: u64) {
        let mut children = self.directories.remove(&directory).unwrap_or_default();
        children.sort_by_key(|child| child.name.to_uppercase());

        let step = self.index_vcn_step();
        let mut root = Vec::new();
        let mut blocks: Vec<Vec<Vec<u8>>> = Vec::new();

        if self.cyclic.contains(&directory) {
            blocks.push(vec![index_entry(0, None, Some(0), true)]);
            root.push(index_entry(0, None, Some(0), true));
        } else if children.len() <= DIRECTORY_CHILDREN_IN_ROOT {
            for child in &children {
                root.push(self.directory_entry(directory, child));
            }
            root.push(index_entry(0, None, None, true));
        } else {
            let mut pending = Vec::new();
            for child in &children {
                if pending.len() == 2 {
                    let vcn = blocks.len() as u64 * step;
                    let separator = with_child(self.directory_entry(directory, child), vcn);
                    let mut block = std::mem::take(&mut pending);
                    block.push(index_entry(0, None, None, true));
                    blocks.push(block);
                    root.push(separator);
                } else {
                    pending.push(self.directory_entry(directory, child));
                }
            }

            let end_child = if pending.is_empty() {
                None
            } else {
                let vcn = blocks.len() as u64 * step;
                pending.push(index_entry(0, None, None, true));
                blocks.push(pending);
                Some(vcn)
            };
            root.push(index_entry(0, None, end_child, true));
        }

        let has_blocks = !blocks.is_empty();
        self.push_resident(
            directory,
            NtfsAttributeType::IndexRoot,
            DIRECTORY_INDEX_NAME,
            &index_root_value(&root, has_blocks, self.index_block_size, step),
        );

        if has_blocks {
            let mut content = Vec::new();
            for (i, entries) in blocks.iter().enumerate() {
                content.extend_from_slice(&index_block(i as u64 * step, entries, self.index_block_size));
            }
            let clusters = self.clusters_for(content.len());
            let lcn = self.allocate_clusters(clusters, &content);
            let size = clusters * self.cluster_size;
            let allocation = non_resident_attribute(
                NtfsAttributeType::IndexAllocation as u32,
                DIRECTORY_INDEX_NAME,
                &encode_data_runs(&[(clusters, Some(lcn as i64))]),
                0,
                clusters - 1,
                size,
                size,
                size,
                0,
            );
            self.push_attribute(directory, allocation);
        }
    }

    pub fn build(mut self) -> Vec<u8> {
        let (major, minor) = self.version;
        let mut information = vec![0u8; 12];
        information[8] = major;
        information[9] = minor;
        self.push_resident(VOLUME_RECORD, NtfsAttributeType::VolumeInformation, "", &information);

        let directories: Vec<u64> = self.directories.keys().copied().collect();
        for directory in directories {
            self.build_index(directory);
        }

        let with_lists: Vec<u64> = self
            .records
            .iter()
            .filter(|(_, pending)| !pending.extensions.is_empty())
            .map(|(number, _)| *number)
            .collect();
        for number in with_lists {
            let list = self.attribute_list(number);
            self.push_resident(number, NtfsAttributeType::AttributeList, "", &list);
        }

        let mft_start = (MFT_LCN * self.cluster_size) as usize;
        for (number, pending) in &mut self.records {
            pending.attributes
                .sort_by_key(|a| u32::from_le_bytes([a[0], a[1], a[2], a[3]]));
            let mut data = file_record(
                *number,
                pending.sequence,
                pending.flags,
                pending.base_reference,
                &pending.attributes,
            );
            if self.corrupted.contains(number) {
                data[RECORD_SIZE - 2] ^= 0xFF;
            }

            let offset = mft_start + *number as usize * RECORD_SIZE;
            self.image[offset..offset + RECORD_SIZE].copy_from_slice(&data);
        }

        let total_sectors = self.image.len() as u64 / SECTOR_SIZE;
        self.image[..BOOT_SECTOR_SIZE].copy_from_slice(&boot_sector(
            total_sectors,
            self.cluster_size,
            self.index_block_size,
        ));
        self.image
    }

    pub fn device(self) -> MemoryDevice {
        MemoryDevice::new(self.build())
    }
}

fn with_child(mut entry: Vec<u8>, vcn: u64) -> Vec<u8> {
    let length = entry.len() + 8;
    entry.extend_from_slice(&vcn.to_le_bytes());
    put_u16(&mut entry, 8, length as u16);
    entry[12] |= NtfsIndexEntryFlags::SubNode as u8;
    entry
}
