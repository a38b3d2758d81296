// Copyright (c) 2022, Matteo Bernacchia <dev@kikijiki.com>. All rights reserved.
// This project is dual licensed under the Apache License 2.0 and the MIT license.
// See the LICENSE files in the project root for details.

use time::OffsetDateTime;
use tracing::trace;

use crate::{
    api::*,
    device::BlockDevice,
    errors::{NtfsError, NtfsResult},
    volume::Volume,
};

const ATTRIBUTE_HEADER_SIZE: usize = 16;
const RESIDENT_HEADER_SIZE: usize = 24;
const NON_RESIDENT_HEADER_SIZE: usize = 64;
const ATTRIBUTE_LIST_ENTRY_SIZE: usize = 26;

#[derive(Clone, Debug)]
pub struct AttributeHeader {
    pub type_id: u32,
    pub length: u32,
    pub is_non_resident: bool,
    pub flags: u16,
    pub instance: u16,
    pub name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataRun {
    Data { vcn: u64, lcn: u64, clusters: u64 },
    Sparse { vcn: u64, clusters: u64 },
}

impl DataRun {
    pub fn vcn(&self) -> u64 {
        match *self {
            DataRun::Data { vcn, .. } | DataRun::Sparse { vcn, .. } => vcn,
        }
    }

    pub fn clusters(&self) -> u64 {
        match *self {
            DataRun::Data { clusters, .. } | DataRun::Sparse { clusters, .. } => clusters,
        }
    }

    pub fn end_vcn(&self) -> u64 {
        self.vcn().saturating_add(self.clusters())
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, DataRun::Sparse { .. })
    }
}

/// Decodes a mapping pairs array. Runs start at `lowest_vcn` and follow each
/// other without gaps.
pub fn decode_data_runs(data: &[u8], lowest_vcn: u64) -> NtfsResult<Vec<DataRun>> {
    const BUF_SIZE: usize = 8;

    let mut out = Vec::new();
    let mut cursor = 0usize;
    let mut prev_lcn = 0i64;
    let mut vcn = lowest_vcn;

    loop {
        if cursor >= data.len() {
            return Err(NtfsError::InvalidDataRun {
                details: "unterminated data run sequence",
            });
        }
        if data[cursor] == 0 {
            break;
        }

        let descriptor = data[cursor];
        let cluster_count_b = (descriptor & 0x0f) as usize;
        let cluster_offset_b = ((descriptor & 0xf0) >> 4) as usize;

        if cluster_count_b == 0 || cluster_count_b > BUF_SIZE {
            return Err(NtfsError::InvalidDataRun {
                details: "invalid cluster count field",
            });
        }
        if cluster_offset_b > BUF_SIZE {
            return Err(NtfsError::InvalidDataRun {
                details: "invalid cluster offset field",
            });
        }

        cursor += 1;

        if cursor + cluster_count_b > data.len() {
            return Err(NtfsError::InvalidDataRun {
                details: "unexpected end of run-length data",
            });
        }
        let mut count_buf = [0u8; BUF_SIZE];
        count_buf[..cluster_count_b].copy_from_slice(&data[cursor..cursor + cluster_count_b]);
        let clusters = u64::from_le_bytes(count_buf);
        if clusters == 0 {
            return Err(NtfsError::InvalidDataRun {
                details: "cluster count is zero",
            });
        }
        cursor += cluster_count_b;

        let run = if cluster_offset_b == 0 {
            DataRun::Sparse { vcn, clusters }
        } else {
            if cursor + cluster_offset_b > data.len() {
                return Err(NtfsError::InvalidDataRun {
                    details: "unexpected end of run-offset data",
                });
            }
            let mut offset_buf = [0u8; BUF_SIZE];
            offset_buf[..cluster_offset_b]
                .copy_from_slice(&data[cursor..cursor + cluster_offset_b]);
            let raw = i64::from_le_bytes(offset_buf);
            let empty_bits = (BUF_SIZE - cluster_offset_b) * 8;
            let delta = (raw << empty_bits) >> empty_bits;
            cursor += cluster_offset_b;

            let lcn = prev_lcn
                .checked_add(delta)
                .ok_or(NtfsError::InvalidDataRun {
                    details: "relative offset overflow",
                })?;
            if lcn < 0 {
                return Err(NtfsError::InvalidDataRun {
                    details: "relative offset underflow",
                });
            }
            prev_lcn = lcn;

            DataRun::Data {
                vcn,
                lcn: lcn as u64,
                clusters,
            }
        };

        vcn = vcn.checked_add(clusters).ok_or(NtfsError::InvalidDataRun {
            details: "run length overflow",
        })?;
        out.push(run);
    }

    Ok(out)
}

/// Sizes and cluster mapping of a non-resident attribute.
#[derive(Clone, Debug)]
pub struct NonResidentLayout {
    pub lowest_vcn: u64,
    pub highest_vcn: u64,
    pub allocated_size: u64,
    pub data_size: u64,
    pub initialized_size: u64,
    pub compression_unit: u16,
    pub runs: Vec<DataRun>,
}

impl NonResidentLayout {
    pub fn end_vcn(&self) -> u64 {
        self.runs
            .last()
            .map(DataRun::end_vcn)
            .unwrap_or(self.lowest_vcn)
    }

    /// Appends the runs of a piece of the same attribute stored in another
    /// record. Pieces must be appended in VCN order.
    pub fn append(&mut self, other: &NonResidentLayout) -> NtfsResult<()> {
        if other.lowest_vcn != self.end_vcn() {
            return Err(NtfsError::InvalidDataRun {
                details: "attribute continuation is not contiguous",
            });
        }
        self.runs.extend_from_slice(&other.runs);
        self.highest_vcn = other.highest_vcn;
        Ok(())
    }

    pub fn read<D: BlockDevice>(
        &self,
        volume: &mut Volume<D>,
        offset: u64,
        length: u64,
    ) -> NtfsResult<Vec<u8>> {
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= self.data_size)
            .ok_or(NtfsError::OutOfBounds {
                offset,
                length,
                size: self.data_size,
            })?;
        if length == 0 {
            return Ok(Vec::new());
        }

        let cluster_size = volume.geometry.cluster_size;
        let first_vcn = offset / cluster_size;
        let last_vcn = end.div_ceil(cluster_size);
        let expected = (last_vcn - first_vcn) * cluster_size;

        let mut buffer = Vec::with_capacity(usize::try_from(expected).unwrap_or(0));
        for run in &self.runs {
            let start = u64::max(run.vcn(), first_vcn);
            let stop = u64::min(run.end_vcn(), last_vcn);
            if start >= stop {
                continue;
            }

            let count = stop - start;
            let chunk = match *run {
                DataRun::Data { vcn, lcn, .. } => {
                    volume.read_clusters_or_zero(lcn + (start - vcn), count, false)?
                }
                DataRun::Sparse { .. } => volume.read_clusters_or_zero(0, count, true)?,
            };
            buffer.extend_from_slice(&chunk);
        }

        if buffer.len() as u64 != expected {
            return Err(NtfsError::BadSize {
                expected,
                actual: buffer.len() as u64,
            });
        }

        let window_start = (offset - first_vcn * cluster_size) as usize;
        let mut out = buffer[window_start..window_start + length as usize].to_vec();

        // Bytes past the initialized size read as zero, whatever the clusters hold.
        if end > self.initialized_size {
            let zero_from = self.initialized_size.saturating_sub(offset) as usize;
            out[zero_from..].fill(0);
        }

        trace!(
            "Read {} bytes at {} from {} runs",
            length,
            offset,
            self.runs.len()
        );
        Ok(out)
    }
}

pub enum AttributeBody<'a> {
    Resident(&'a [u8]),
    NonResident(NonResidentLayout),
}

/// One attribute of an MFT record. Resident payloads stay borrowed from the
/// record buffer.
pub struct NtfsAttribute<'a> {
    pub header: AttributeHeader,
    body: AttributeBody<'a>,
}

impl<'a> NtfsAttribute<'a> {
    /// `data` starts at the attribute and may extend past it.
    pub fn new(data: &'a [u8]) -> NtfsResult<Self> {
        if data.len() < ATTRIBUTE_HEADER_SIZE {
            return Err(NtfsError::BadRecordHeader {
                details: "attribute header truncated",
            });
        }
        let raw: NtfsAttributeHeader = read_struct(data)?;

        let length = raw.length as usize;
        if length < ATTRIBUTE_HEADER_SIZE || length > data.len() {
            return Err(NtfsError::BadRecordHeader {
                details: "attribute length outside record",
            });
        }
        let data = &data[..length];

        let name = if raw.name_length > 0 {
            let start = raw.name_offset as usize;
            let end = start + raw.name_length as usize * 2;
            if end > length {
                return Err(NtfsError::BadRecordHeader {
                    details: "attribute name outside attribute",
                });
            }
            decode_utf16(&data[start..end])
        } else {
            String::new()
        };

        let body = if raw.is_non_resident == 0 {
            if length < RESIDENT_HEADER_SIZE {
                return Err(NtfsError::BadRecordHeader {
                    details: "resident header truncated",
                });
            }
            let header: NtfsResidentAttributeHeader = read_struct(data)?;
            let start = header.value_offset as usize;
            let end = start + header.value_length as usize;
            if end > length {
                return Err(NtfsError::BadRecordHeader {
                    details: "resident value outside attribute",
                });
            }
            AttributeBody::Resident(&data[start..end])
        } else {
            if length < NON_RESIDENT_HEADER_SIZE {
                return Err(NtfsError::BadRecordHeader {
                    details: "non-resident header truncated",
                });
            }
            let header: NtfsNonResidentAttributeHeader = read_struct(data)?;
            let runs_offset = header.data_runs_offset as usize;
            if runs_offset > length {
                return Err(NtfsError::InvalidDataRun {
                    details: "data runs offset outside attribute",
                });
            }

            let runs = decode_data_runs(&data[runs_offset..], header.lowest_vcn)?;
            if runs.is_empty() && (header.allocated_size > 0 || header.data_size > 0) {
                return Err(NtfsError::EmptyDataRun);
            }

            AttributeBody::NonResident(NonResidentLayout {
                lowest_vcn: header.lowest_vcn,
                highest_vcn: header.highest_vcn,
                allocated_size: header.allocated_size,
                data_size: header.data_size,
                initialized_size: header.initialized_size,
                compression_unit: header.compression_unit_exponent,
                runs,
            })
        };

        Ok(NtfsAttribute {
            header: AttributeHeader {
                type_id: raw.type_id,
                length: raw.length,
                is_non_resident: raw.is_non_resident != 0,
                flags: raw.flags,
                instance: raw.id,
                name,
            },
            body,
        })
    }

    pub fn type_id(&self) -> u32 {
        self.header.type_id
    }

    pub fn name(&self) -> &str {
        &self.header.name
    }

    pub fn is_resident(&self) -> bool {
        matches!(self.body, AttributeBody::Resident(_))
    }

    pub fn is_compressed(&self) -> bool {
        self.header.flags & NtfsAttributeFlags::Compressed as u16 != 0
    }

    pub fn is_encrypted(&self) -> bool {
        self.header.flags & NtfsAttributeFlags::Encrypted as u16 != 0
    }

    pub fn is_sparse(&self) -> bool {
        self.header.flags & NtfsAttributeFlags::Sparse as u16 != 0
    }

    pub fn size(&self) -> u64 {
        match &self.body {
            AttributeBody::Resident(value) => value.len() as u64,
            AttributeBody::NonResident(layout) => layout.data_size,
        }
    }

    pub fn allocated_size(&self) -> u64 {
        match &self.body {
            AttributeBody::Resident(value) => value.len() as u64,
            AttributeBody::NonResident(layout) => layout.allocated_size,
        }
    }

    pub fn body(&self) -> &AttributeBody<'a> {
        &self.body
    }

    pub fn value(&self) -> Option<&'a [u8]> {
        match self.body {
            AttributeBody::Resident(value) => Some(value),
            AttributeBody::NonResident(_) => None,
        }
    }

    pub fn layout(&self) -> Option<&NonResidentLayout> {
        match &self.body {
            AttributeBody::Resident(_) => None,
            AttributeBody::NonResident(layout) => Some(layout),
        }
    }

    pub fn layout_mut(&mut self) -> Option<&mut NonResidentLayout> {
        match &mut self.body {
            AttributeBody::Resident(_) => None,
            AttributeBody::NonResident(layout) => Some(layout),
        }
    }

    pub fn data_runs(&self) -> &[DataRun] {
        match &self.body {
            AttributeBody::Resident(_) => &[],
            AttributeBody::NonResident(layout) => &layout.runs,
        }
    }

    pub fn read<D: BlockDevice>(
        &self,
        volume: &mut Volume<D>,
        offset: u64,
        length: u64,
    ) -> NtfsResult<Vec<u8>> {
        match &self.body {
            AttributeBody::Resident(value) => {
                let size = value.len() as u64;
                let end = offset
                    .checked_add(length)
                    .filter(|end| *end <= size)
                    .ok_or(NtfsError::OutOfBounds {
                        offset,
                        length,
                        size,
                    })?;
                Ok(value[offset as usize..end as usize].to_vec())
            }
            AttributeBody::NonResident(layout) => layout.read(volume, offset, length),
        }
    }

    pub fn read_all<D: BlockDevice>(&self, volume: &mut Volume<D>) -> NtfsResult<Vec<u8>> {
        self.read(volume, 0, self.size())
    }
}

/// Typed view over the payload of one attribute type.
pub trait AttributeValue<'a>: Sized {
    const TYPE: NtfsAttributeType;

    fn from_attribute(attribute: NtfsAttribute<'a>) -> NtfsResult<Self>;
}

fn resident_value<'a>(
    attribute: &NtfsAttribute<'a>,
    details: &'static str,
) -> NtfsResult<&'a [u8]> {
    attribute
        .value()
        .ok_or(NtfsError::BadRecordHeader { details })
}

#[derive(Clone, Copy, Debug)]
pub struct StandardInformation {
    pub inner: NtfsStandardInformation,
}

impl StandardInformation {
    pub fn created(&self) -> OffsetDateTime {
        ntfs_to_unix_time(self.inner.creation_time)
    }

    pub fn modified(&self) -> OffsetDateTime {
        ntfs_to_unix_time(self.inner.modification_time)
    }

    pub fn mft_modified(&self) -> OffsetDateTime {
        ntfs_to_unix_time(self.inner.mft_record_modification_time)
    }

    pub fn accessed(&self) -> OffsetDateTime {
        ntfs_to_unix_time(self.inner.access_time)
    }

    pub fn file_attributes(&self) -> u32 {
        self.inner.file_attributes
    }

    pub fn has_attribute(&self, flag: NtfsFileAttributeFlags) -> bool {
        self.inner.file_attributes & flag as u32 != 0
    }
}

impl<'a> AttributeValue<'a> for StandardInformation {
    const TYPE: NtfsAttributeType = NtfsAttributeType::StandardInformation;

    fn from_attribute(attribute: NtfsAttribute<'a>) -> NtfsResult<Self> {
        let value = resident_value(&attribute, "standard information is not resident")?;
        Ok(StandardInformation {
            inner: read_struct(value)?,
        })
    }
}

#[derive(Clone, Debug)]
pub struct FileName {
    pub header: NtfsFileNameHeader,
    name: String,
}

impl FileName {
    pub fn parse(value: &[u8]) -> NtfsResult<Self> {
        let header: NtfsFileNameHeader = read_struct(value)?;
        let name = String::from_utf16_lossy(&header.name);
        Ok(FileName { header, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Length in UTF-16 code units, as stored on disk.
    pub fn len(&self) -> usize {
        self.header.name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.header.name.is_empty()
    }

    pub fn parent(&self) -> MftReference {
        MftReference(self.header.parent_directory_reference)
    }

    pub fn namespace(&self) -> u8 {
        self.header.namespace
    }

    pub fn is_dos_only(&self) -> bool {
        self.header.namespace == NtfsFileNamespace::Dos as u8
    }

    pub fn is_reparse_point(&self) -> bool {
        self.header.file_attributes & NtfsFileAttributeFlags::ReparsePoint as u32 != 0
    }

    pub fn real_size(&self) -> u64 {
        self.header.real_size
    }

    pub fn allocated_size(&self) -> u64 {
        self.header.allocated_size
    }

    pub fn units(&self) -> &[u16] {
        &self.header.name
    }
}

impl<'a> AttributeValue<'a> for FileName {
    const TYPE: NtfsAttributeType = NtfsAttributeType::FileName;

    fn from_attribute(attribute: NtfsAttribute<'a>) -> NtfsResult<Self> {
        FileName::parse(resident_value(&attribute, "file name is not resident")?)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct VolumeInformation {
    pub inner: NtfsVolumeInformation,
}

impl VolumeInformation {
    pub fn major_version(&self) -> u8 {
        self.inner.major_version
    }

    pub fn minor_version(&self) -> u8 {
        self.inner.minor_version
    }

    pub fn flags(&self) -> u16 {
        self.inner.flags
    }

    pub fn is_supported(&self) -> bool {
        self.inner.major_version >= MINIMUM_MAJOR_VERSION
    }
}

impl<'a> AttributeValue<'a> for VolumeInformation {
    const TYPE: NtfsAttributeType = NtfsAttributeType::VolumeInformation;

    fn from_attribute(attribute: NtfsAttribute<'a>) -> NtfsResult<Self> {
        let value = resident_value(&attribute, "volume information is not resident")?;
        Ok(VolumeInformation {
            inner: read_struct(value)?,
        })
    }
}

#[derive(Clone, Debug)]
pub struct VolumeName(pub String);

impl<'a> AttributeValue<'a> for VolumeName {
    const TYPE: NtfsAttributeType = NtfsAttributeType::VolumeName;

    fn from_attribute(attribute: NtfsAttribute<'a>) -> NtfsResult<Self> {
        let value = resident_value(&attribute, "volume name is not resident")?;
        Ok(VolumeName(decode_utf16(value)))
    }
}

#[derive(Clone, Debug)]
pub struct AttributeListEntry {
    pub type_id: u32,
    pub lowest_vcn: u64,
    pub reference: MftReference,
    pub instance: u16,
    pub name: String,
}

pub fn parse_attribute_list(data: &[u8]) -> NtfsResult<Vec<AttributeListEntry>> {
    let mut entries = Vec::new();
    let mut offset = 0usize;

    while offset + ATTRIBUTE_LIST_ENTRY_SIZE <= data.len() {
        let raw: NtfsAttributeListEntry = read_struct(&data[offset..])?;
        let length = raw.length as usize;
        if length < ATTRIBUTE_LIST_ENTRY_SIZE || offset + length > data.len() {
            return Err(NtfsError::BadRecordHeader {
                details: "attribute list entry outside list",
            });
        }

        let entry_data = &data[offset..offset + length];
        let name_start = raw.name_offset as usize;
        let name_end = name_start + raw.name_length as usize * 2;
        let name = if raw.name_length == 0 {
            String::new()
        } else if name_end <= length {
            decode_utf16(&entry_data[name_start..name_end])
        } else {
            return Err(NtfsError::BadRecordHeader {
                details: "attribute list name outside entry",
            });
        };

        entries.push(AttributeListEntry {
            type_id: raw.type_id,
            lowest_vcn: raw.lowest_vcn,
            reference: MftReference(raw.reference),
            instance: raw.id,
            name,
        });
        offset += length;
    }

    Ok(entries)
}

/// `$ATTRIBUTE_LIST`, which may itself be non-resident.
pub struct AttributeList<'a> {
    attribute: NtfsAttribute<'a>,
}

impl<'a> AttributeList<'a> {
    pub fn entries<D: BlockDevice>(
        &self,
        volume: &mut Volume<D>,
    ) -> NtfsResult<Vec<AttributeListEntry>> {
        let data = self.attribute.read_all(volume)?;
        parse_attribute_list(&data)
    }
}

impl<'a> AttributeValue<'a> for AttributeList<'a> {
    const TYPE: NtfsAttributeType = NtfsAttributeType::AttributeList;

    fn from_attribute(attribute: NtfsAttribute<'a>) -> NtfsResult<Self> {
        Ok(AttributeList { attribute })
    }
}

/// A `$DATA` attribute. The unnamed stream is the file content.
pub struct DataStream<'a> {
    attribute: NtfsAttribute<'a>,
}

impl<'a> DataStream<'a> {
    pub fn name(&self) -> &str {
        self.attribute.name()
    }

    pub fn size(&self) -> u64 {
        self.attribute.size()
    }

    pub fn attribute(&self) -> &NtfsAttribute<'a> {
        &self.attribute
    }

    pub fn attribute_mut(&mut self) -> &mut NtfsAttribute<'a> {
        &mut self.attribute
    }

    pub fn read<D: BlockDevice>(
        &self,
        volume: &mut Volume<D>,
        offset: u64,
        length: u64,
    ) -> NtfsResult<Vec<u8>> {
        self.attribute.read(volume, offset, length)
    }
}

impl<'a> AttributeValue<'a> for DataStream<'a> {
    const TYPE: NtfsAttributeType = NtfsAttributeType::Data;

    fn from_attribute(attribute: NtfsAttribute<'a>) -> NtfsResult<Self> {
        Ok(DataStream { attribute })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{encode_data_runs, non_resident_attribute, resident_attribute};

    #[test]
    fn runs_cover_vcn_space_without_gaps() {
        let encoded = encode_data_runs(&[(8, Some(100)), (4, None), (16, Some(-40)), (1, Some(7))]);
        let runs = decode_data_runs(&encoded, 0).unwrap();

        assert_eq!(
            runs,
            vec![
                DataRun::Data {
                    vcn: 0,
                    lcn: 100,
                    clusters: 8
                },
                DataRun::Sparse {
                    vcn: 8,
                    clusters: 4
                },
                DataRun::Data {
                    vcn: 12,
                    lcn: 60,
                    clusters: 16
                },
                DataRun::Data {
                    vcn: 28,
                    lcn: 67,
                    clusters: 1
                },
            ]
        );

        let mut next = 0;
        for run in &runs {
            assert_eq!(run.vcn(), next);
            next = run.end_vcn();
        }
        assert_eq!(next, 29);
    }

    #[test]
    fn top_bit_makes_delta_negative() {
        // 0x21: one length byte, two delta bytes. 0xFF80 = -128.
        let encoded = [0x21, 0x10, 0x00, 0x04, 0x21, 0x02, 0x80, 0xFF, 0x00];
        let runs = decode_data_runs(&encoded, 0).unwrap();

        assert_eq!(runs[0], DataRun::Data { vcn: 0, lcn: 0x400, clusters: 0x10 });
        assert_eq!(
            runs[1],
            DataRun::Data {
                vcn: 0x10,
                lcn: 0x400 - 128,
                clusters: 2
            }
        );

        // Three byte field with the top bit set: 0x800000 - 2^24.
        let encoded = [0x31, 0x01, 0x00, 0x00, 0x10, 0x31, 0x01, 0x00, 0x00, 0x80, 0x00];
        assert!(matches!(
            decode_data_runs(&encoded, 0),
            Err(NtfsError::InvalidDataRun { .. })
        ));
    }

    #[test]
    fn runs_start_at_lowest_vcn() {
        let encoded = encode_data_runs(&[(3, Some(50))]);
        let runs = decode_data_runs(&encoded, 40).unwrap();
        assert_eq!(runs[0].vcn(), 40);
        assert_eq!(runs[0].end_vcn(), 43);
    }

    #[test]
    fn malformed_runs_are_rejected() {
        assert!(matches!(
            decode_data_runs(&[0x11, 0x05], 0),
            Err(NtfsError::InvalidDataRun { .. })
        ));
        assert!(matches!(
            decode_data_runs(&[0x10, 0x05, 0x00], 0),
            Err(NtfsError::InvalidDataRun { .. })
        ));
        assert!(matches!(
            decode_data_runs(&[0x11, 0x00, 0x05, 0x00], 0),
            Err(NtfsError::InvalidDataRun { .. })
        ));
        assert!(matches!(
            decode_data_runs(&[0x11, 0x05, 0xFB, 0x00], 0),
            Err(NtfsError::InvalidDataRun { .. })
        ));
    }

    #[test]
    fn resident_reads_are_bounded() {
        let data = resident_attribute(0x80, "", b"hello world", 0);
        let attribute = NtfsAttribute::new(&data).unwrap();

        assert!(attribute.is_resident());
        assert_eq!(attribute.size(), 11);
        assert_eq!(attribute.value(), Some(&b"hello world"[..]));
        assert!(attribute.data_runs().is_empty());
    }

    #[test]
    fn non_resident_without_runs_is_empty() {
        let data = non_resident_attribute(0x80, "", &[0x00], 0, 0, 4096, 4096, 4096, 0);
        assert!(matches!(
            NtfsAttribute::new(&data),
            Err(NtfsError::EmptyDataRun)
        ));

        let data = non_resident_attribute(0x80, "", &[0x00], 0, u64::MAX, 0, 0, 0, 0);
        let attribute = NtfsAttribute::new(&data).unwrap();
        assert_eq!(attribute.size(), 0);
    }

    #[test]
    fn attribute_flags_and_name() {
        let runs = encode_data_runs(&[(2, None)]);
        let data = non_resident_attribute(0x80, "ads", &runs, 0, 1, 2048, 2000, 0, 0x8001);
        let attribute = NtfsAttribute::new(&data).unwrap();

        assert_eq!(attribute.name(), "ads");
        assert!(attribute.is_sparse());
        assert!(attribute.is_compressed());
        assert!(!attribute.is_encrypted());
        assert!(!attribute.is_resident());
        assert_eq!(attribute.size(), 2000);
        assert_eq!(attribute.allocated_size(), 2048);
    }

    #[test]
    fn length_past_buffer_is_a_bad_header() {
        let mut data = resident_attribute(0x10, "", &[0u8; 48], 0);
        let len = data.len();
        data.truncate(len - 8);
        assert!(matches!(
            NtfsAttribute::new(&data),
            Err(NtfsError::BadRecordHeader { .. })
        ));
    }

    #[test]
    fn continuation_must_be_contiguous() {
        let mut first = NonResidentLayout {
            lowest_vcn: 0,
            highest_vcn: 3,
            allocated_size: 8192,
            data_size: 8192,
            initialized_size: 8192,
            compression_unit: 0,
            runs: decode_data_runs(&encode_data_runs(&[(4, Some(10))]), 0).unwrap(),
        };
        let second = NonResidentLayout {
            lowest_vcn: 4,
            highest_vcn: 7,
            allocated_size: 0,
            data_size: 0,
            initialized_size: 0,
            compression_unit: 0,
            runs: decode_data_runs(&encode_data_runs(&[(4, Some(30))]), 4).unwrap(),
        };
        let gap = NonResidentLayout {
            lowest_vcn: 12,
            ..second.clone()
        };

        assert!(first.append(&gap).is_err());
        first.append(&second).unwrap();
        assert_eq!(first.end_vcn(), 8);
        assert_eq!(first.highest_vcn, 7);
    }

    #[test]
    fn attribute_list_entries() {
        let mut data = Vec::new();
        for (type_id, reference, name) in [(0x10u32, 20u64, ""), (0x80, 33, "s")] {
            let name_units: Vec<u8> = name.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
            let length = (ATTRIBUTE_LIST_ENTRY_SIZE + name_units.len()).next_multiple_of(8);
            let mut entry = vec![0u8; length];
            entry[0..4].copy_from_slice(&type_id.to_le_bytes());
            entry[4..6].copy_from_slice(&(length as u16).to_le_bytes());
            entry[6] = name.encode_utf16().count() as u8;
            entry[7] = ATTRIBUTE_LIST_ENTRY_SIZE as u8;
            entry[16..24].copy_from_slice(&MftReference::new(reference, 2).0.to_le_bytes());
            entry[26..26 + name_units.len()].copy_from_slice(&name_units);
            data.extend_from_slice(&entry);
        }

        let entries = parse_attribute_list(&data).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].reference.record_number(), 20);
        assert_eq!(entries[1].type_id, 0x80);
        assert_eq!(entries[1].name, "s");
        assert_eq!(entries[1].reference.sequence_number(), 2);
    }
}
