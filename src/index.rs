// Copyright (c) 2022, Matteo Bernacchia <dev@kikijiki.com>. All rights reserved.
// This project is dual licensed under the Apache License 2.0 and the MIT license.
// See the LICENSE files in the project root for details.

use std::collections::HashSet;

use tracing::trace;

use crate::{
    api::*,
    attribute::{AttributeValue, FileName, NtfsAttribute},
    device::BlockDevice,
    errors::{NtfsError, NtfsResult},
    file::NtfsFile,
    fixup::apply_fixup,
    mft::Mft,
    volume::{Volume, VolumeGeometry},
};

/// Deepest index block chain followed before the tree is considered corrupt.
pub const MAX_INDEX_DEPTH: usize = 64;

const VCN_BLOCK_SIZE: u64 = 512;

#[derive(Clone, Debug)]
pub struct IndexEntry {
    pub reference: MftReference,
    pub flags: u8,
    pub file_name: Option<FileName>,
    pub child_vcn: Option<u64>,
}

impl IndexEntry {
    pub fn is_last(&self) -> bool {
        self.flags & NtfsIndexEntryFlags::Last as u8 != 0
    }

    pub fn has_child(&self) -> bool {
        self.child_vcn.is_some()
    }

    pub fn name(&self) -> Option<&str> {
        self.file_name.as_ref().map(FileName::name)
    }

    /// Entries for ordinary files, as opposed to the terminator and the
    /// system metafiles.
    pub fn is_user_entry(&self) -> bool {
        !self.is_last() && self.reference.record_number() >= FIRST_USER_RECORD
    }

    pub fn matches_name(&self, target: &[u16]) -> bool {
        match &self.file_name {
            Some(name) => names_equal(name.units(), target),
            None => false,
        }
    }
}

fn upcase(unit: u16) -> u16 {
    if unit < 0x80 {
        return (unit as u8).to_ascii_uppercase() as u16;
    }

    let Some(c) = char::from_u32(unit as u32) else {
        return unit;
    };
    let mut upper = c.to_uppercase();
    match (upper.next(), upper.next()) {
        (Some(u), None) if (u as u32) <= 0xFFFF => u as u16,
        _ => unit,
    }
}

/// Case-insensitive comparison of two UTF-16 names of the same length.
pub fn names_equal(a: &[u16], b: &[u16]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| upcase(*x) == upcase(*y))
}

/// Parses the entries that follow an index header located at `header_offset`.
/// The terminating entry is part of the result.
pub fn parse_entries(data: &[u8], header_offset: usize) -> NtfsResult<Vec<IndexEntry>> {
    let header_data = data.get(header_offset..).ok_or(NtfsError::BadRecordHeader {
        details: "index header outside block",
    })?;
    let header: NtfsIndexHeader = read_struct(header_data)?;

    let start = header_offset + header.entries_offset as usize;
    let end = header_offset + header.index_length as usize;
    if end > data.len() || start > end {
        return Err(NtfsError::BadRecordHeader {
            details: "index entries outside block",
        });
    }

    let mut entries = Vec::new();
    let mut offset = start;
    while offset + INDEX_ENTRY_HEADER_SIZE <= end {
        let raw: NtfsIndexEntryHeader = read_struct(&data[offset..end])?;
        let length = raw.length as usize;
        if length < INDEX_ENTRY_HEADER_SIZE || offset + length > end {
            return Err(NtfsError::BadRecordHeader {
                details: "index entry outside block",
            });
        }
        let entry = &data[offset..offset + length];

        let is_last = raw.flags & NtfsIndexEntryFlags::Last as u8 != 0;
        let file_name = if !is_last && raw.stream_length > 0 {
            let stream_end = INDEX_ENTRY_HEADER_SIZE + raw.stream_length as usize;
            let stream = entry
                .get(INDEX_ENTRY_HEADER_SIZE..stream_end)
                .ok_or(NtfsError::BadRecordHeader {
                    details: "index key outside entry",
                })?;
            Some(FileName::parse(stream)?)
        } else {
            None
        };

        let child_vcn = if raw.flags & NtfsIndexEntryFlags::SubNode as u8 != 0 {
            if length < INDEX_ENTRY_HEADER_SIZE + 8 {
                return Err(NtfsError::BadRecordHeader {
                    details: "index entry too short for a child pointer",
                });
            }
            let mut vcn = [0u8; 8];
            vcn.copy_from_slice(&entry[length - 8..]);
            Some(u64::from_le_bytes(vcn))
        } else {
            None
        };

        entries.push(IndexEntry {
            reference: MftReference(raw.reference),
            flags: raw.flags,
            file_name,
            child_vcn,
        });

        if is_last {
            return Ok(entries);
        }
        offset += length;
    }

    Err(NtfsError::CorruptionError {
        details: format!(
            "index entries end at {} without a terminating entry",
            offset
        ),
    })
}

#[derive(Clone, Debug)]
pub struct IndexRoot {
    pub name: String,
    pub attribute_type: u32,
    pub collation_rule: u32,
    pub block_size: u32,
    pub clusters_per_block: u8,
    pub entries: Vec<IndexEntry>,
}

impl<'a> AttributeValue<'a> for IndexRoot {
    const TYPE: NtfsAttributeType = NtfsAttributeType::IndexRoot;

    fn from_attribute(attribute: NtfsAttribute<'a>) -> NtfsResult<Self> {
        let value = attribute.value().ok_or(NtfsError::BadRecordHeader {
            details: "index root is not resident",
        })?;
        let header: NtfsIndexRootHeader = read_struct(value)?;

        Ok(IndexRoot {
            name: attribute.name().to_string(),
            attribute_type: header.attribute_type,
            collation_rule: header.collation_rule,
            block_size: header.index_block_size,
            clusters_per_block: header.clusters_per_index_block,
            entries: parse_entries(value, INDEX_ROOT_HEADER_OFFSET)?,
        })
    }
}

pub struct IndexAllocation<'a> {
    attribute: NtfsAttribute<'a>,
}

impl<'a> IndexAllocation<'a> {
    pub fn name(&self) -> &str {
        self.attribute.name()
    }

    /// Reads, checks and fixes up the index block at `vcn`.
    pub fn read_block<D: BlockDevice>(
        &self,
        volume: &mut Volume<D>,
        vcn: u64,
        block_size: u64,
        vcn_unit: u64,
    ) -> NtfsResult<Vec<IndexEntry>> {
        let offset = vcn.checked_mul(vcn_unit).ok_or(NtfsError::OutOfBounds {
            offset: u64::MAX,
            length: block_size,
            size: self.attribute.size(),
        })?;
        let mut data = self.attribute.read(volume, offset, block_size)?;

        let header: NtfsIndexRecordHeader = read_struct(&data)?;
        if &header.signature != INDEX_RECORD_SIGNATURE {
            return Err(NtfsError::BadRecordHeader {
                details: "missing INDX signature",
            });
        }
        if header.vcn != vcn {
            return Err(NtfsError::CorruptionError {
                details: format!("index block at VCN {:#x} claims VCN {:#x}", vcn, header.vcn),
            });
        }
        apply_fixup(&mut data, FIXUP_STRIDE)?;

        trace!("Read index block at VCN {:#x}", vcn);
        parse_entries(&data, INDEX_RECORD_HEADER_OFFSET)
    }
}

impl<'a> AttributeValue<'a> for IndexAllocation<'a> {
    const TYPE: NtfsAttributeType = NtfsAttributeType::IndexAllocation;

    fn from_attribute(attribute: NtfsAttribute<'a>) -> NtfsResult<Self> {
        Ok(IndexAllocation { attribute })
    }
}

/// The `$I30` file name index of a directory.
pub struct DirectoryIndex<'a> {
    record: u64,
    root: IndexRoot,
    allocation: Option<IndexAllocation<'a>>,
    block_size: u64,
    vcn_unit: u64,
}

impl<'a> DirectoryIndex<'a> {
    pub fn new(directory: &'a NtfsFile, geometry: &VolumeGeometry) -> NtfsResult<Self> {
        if !directory.is_directory() {
            return Err(NtfsError::UnexpectedAction {
                details: "record is not a directory",
            });
        }

        let record = directory.number();
        let root = directory
            .find_attributes::<IndexRoot>(true)?
            .into_iter()
            .find(|root| root.name == DIRECTORY_INDEX_NAME)
            .ok_or(NtfsError::AttributeNotFound {
                type_id: NtfsAttributeType::IndexRoot as u32,
                record,
            })?;
        let allocation = directory
            .find_attributes::<IndexAllocation>(false)?
            .into_iter()
            .find(|allocation| allocation.name() == DIRECTORY_INDEX_NAME);

        let block_size = if root.block_size > 0 {
            root.block_size as u64
        } else {
            geometry.index_record_size
        };
        // Child pointers count clusters, or 512 byte units when a block is
        // smaller than a cluster.
        let vcn_unit = if block_size >= geometry.cluster_size {
            geometry.cluster_size
        } else {
            VCN_BLOCK_SIZE
        };

        Ok(DirectoryIndex {
            record,
            root,
            allocation,
            block_size,
            vcn_unit,
        })
    }

    pub fn root(&self) -> &IndexRoot {
        &self.root
    }

    fn read_block<D: BlockDevice>(
        &self,
        volume: &mut Volume<D>,
        vcn: u64,
        depth: usize,
        visited: &mut HashSet<u64>,
    ) -> NtfsResult<Vec<IndexEntry>> {
        if depth > MAX_INDEX_DEPTH {
            return Err(NtfsError::CorruptionError {
                details: format!(
                    "index of record {} is deeper than {} levels",
                    self.record, MAX_INDEX_DEPTH
                ),
            });
        }
        if !visited.insert(vcn) {
            return Err(NtfsError::CorruptionError {
                details: format!(
                    "index block {:#x} of record {} is referenced twice",
                    vcn, self.record
                ),
            });
        }

        let allocation = self
            .allocation
            .as_ref()
            .ok_or(NtfsError::AttributeNotFound {
                type_id: NtfsAttributeType::IndexAllocation as u32,
                record: self.record,
            })?;
        allocation.read_block(volume, vcn, self.block_size, self.vcn_unit)
    }

    /// Finds the entry named `name`. Subtrees are searched before the entry
    /// that points to them; the first match wins.
    pub fn lookup<D: BlockDevice>(
        &self,
        volume: &mut Volume<D>,
        name: &str,
    ) -> NtfsResult<MftReference> {
        let target: Vec<u16> = name.encode_utf16().collect();
        let mut visited = HashSet::new();

        self.search(volume, &self.root.entries, &target, 0, &mut visited)?
            .ok_or_else(|| {
                NtfsError::RecordNotFound(format!(
                    "'{}' not found in directory {}",
                    name, self.record
                ))
            })
    }

    fn search<D: BlockDevice>(
        &self,
        volume: &mut Volume<D>,
        entries: &[IndexEntry],
        target: &[u16],
        depth: usize,
        visited: &mut HashSet<u64>,
    ) -> NtfsResult<Option<MftReference>> {
        for entry in entries {
            if let Some(vcn) = entry.child_vcn {
                let children = self.read_block(volume, vcn, depth + 1, visited)?;
                if let Some(found) = self.search(volume, &children, target, depth + 1, visited)? {
                    return Ok(Some(found));
                }
            }
            if entry.matches_name(target) {
                return Ok(Some(entry.reference));
            }
        }
        Ok(None)
    }

    /// Every entry of the tree, each subtree ahead of the entry pointing to it.
    pub fn entries<D: BlockDevice>(&self, volume: &mut Volume<D>) -> NtfsResult<Vec<IndexEntry>> {
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        self.collect(volume, &self.root.entries, 0, &mut visited, &mut out)?;
        Ok(out)
    }

    fn collect<D: BlockDevice>(
        &self,
        volume: &mut Volume<D>,
        entries: &[IndexEntry],
        depth: usize,
        visited: &mut HashSet<u64>,
        out: &mut Vec<IndexEntry>,
    ) -> NtfsResult<()> {
        for entry in entries {
            if let Some(vcn) = entry.child_vcn {
                let children = self.read_block(volume, vcn, depth + 1, visited)?;
                self.collect(volume, &children, depth + 1, visited, out)?;
            }
            out.push(entry.clone());
        }
        Ok(())
    }
}

/// A listed file and, for directories within the requested depth, its own
/// listing.
pub struct DirEntry {
    pub file: NtfsFile,
    pub children: Vec<DirEntry>,
}

pub fn find_in_directory<D: BlockDevice>(
    mft: &mut Mft<D>,
    directory: &NtfsFile,
    name: &str,
) -> NtfsResult<NtfsFile> {
    let index = DirectoryIndex::new(directory, &mft.volume.geometry)?;
    let reference = index.lookup(&mut mft.volume, name)?;
    mft.read_record(reference.record_number())
}

/// Lists the user files of `directory`, once per record even when a file has
/// several names. `depth` levels of subdirectories are listed too.
pub fn list_directory<D: BlockDevice>(
    mft: &mut Mft<D>,
    directory: &NtfsFile,
    depth: u32,
) -> NtfsResult<Vec<DirEntry>> {
    let entries = {
        let geometry = mft.volume.geometry;
        let index = DirectoryIndex::new(directory, &geometry)?;
        index.entries(&mut mft.volume)?
    };

    let mut listed = HashSet::new();
    let mut out = Vec::new();
    for entry in entries {
        let number = entry.reference.record_number();
        if !entry.is_user_entry() || !listed.insert(number) {
            continue;
        }

        let file = mft.read_record(number)?;
        let children = if depth > 0 && file.is_directory() {
            list_directory(mft, &file, depth - 1)?
        } else {
            Vec::new()
        };
        out.push(DirEntry { file, children });
    }

    Ok(out)
}
