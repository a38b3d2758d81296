// Copyright (c) 2022, Matteo Bernacchia <dev@kikijiki.com>. All rights reserved.
// This project is dual licensed under the Apache License 2.0 and the MIT license.
// See the LICENSE files in the project root for details.

use crate::{
    api::*,
    attribute::{AttributeValue, DataStream, FileName, NtfsAttribute, StandardInformation},
    device::BlockDevice,
    errors::{NtfsError, NtfsResult},
    fixup::apply_fixup,
    volume::Volume,
};

const FILE_RECORD_HEADER_SIZE: usize = 48;

/// One physical MFT record, fixed up and validated.
pub struct NtfsRecord {
    number: u64,
    header: NtfsFileRecordHeader,
    data: Vec<u8>,
}

impl NtfsRecord {
    pub fn new(number: u64, mut data: Vec<u8>) -> NtfsResult<Self> {
        if data.len() < FILE_RECORD_HEADER_SIZE {
            return Err(NtfsError::BadRecordHeader {
                details: "file record too small",
            });
        }
        if &data[0..4] != FILE_RECORD_SIGNATURE {
            return Err(NtfsError::BadRecordHeader {
                details: "missing FILE signature",
            });
        }

        apply_fixup(&mut data, FIXUP_STRIDE)?;

        let header: NtfsFileRecordHeader = read_struct(&data)?;
        if header.used_size as usize > data.len() {
            return Err(NtfsError::BadRecordHeader {
                details: "used size larger than the record",
            });
        }
        if header.attributes_offset as usize >= header.used_size as usize {
            return Err(NtfsError::BadRecordHeader {
                details: "attributes start past the used size",
            });
        }

        Ok(NtfsRecord {
            number,
            header,
            data,
        })
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn header(&self) -> &NtfsFileRecordHeader {
        &self.header
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn reference(&self) -> MftReference {
        MftReference::new(self.number, self.header.sequence_value)
    }

    pub fn base_reference(&self) -> MftReference {
        MftReference(self.header.base_reference)
    }

    pub fn is_extension(&self) -> bool {
        self.base_reference().record_number() != 0
    }

    pub fn is_used(&self) -> bool {
        self.header.flags & NtfsFileFlags::InUse as u16 != 0
    }

    pub fn is_directory(&self) -> bool {
        self.header.flags & NtfsFileFlags::IsDirectory as u16 != 0
    }

    pub fn raw_attributes(&self) -> RawAttributes<'_> {
        let used = usize::min(self.header.used_size as usize, self.data.len());
        RawAttributes {
            data: &self.data[..used],
            offset: self.header.attributes_offset as usize,
        }
    }

    /// Decodes every attribute of this record, in on-disk order.
    pub fn attributes(&self) -> impl Iterator<Item = NtfsResult<NtfsAttribute<'_>>> {
        self.raw_attributes().map(|(_, data)| NtfsAttribute::new(data))
    }

    pub fn attributes_of(
        &self,
        attribute_type: NtfsAttributeType,
    ) -> impl Iterator<Item = NtfsResult<NtfsAttribute<'_>>> {
        self.raw_attributes()
            .filter(move |(type_id, _)| *type_id == attribute_type as u32)
            .map(|(_, data)| NtfsAttribute::new(data))
    }

    /// Typed attributes of this record only; extension records are not
    /// searched.
    pub fn find_attributes<'a, T: AttributeValue<'a>>(&'a self, required: bool) -> NtfsResult<Vec<T>> {
        let mut found = Vec::new();
        for attribute in self.attributes_of(T::TYPE) {
            found.push(T::from_attribute(attribute?)?);
        }

        if required && found.is_empty() {
            return Err(NtfsError::AttributeNotFound {
                type_id: T::TYPE as u32,
                record: self.number,
            });
        }
        Ok(found)
    }
}

/// Walks the attribute chain of a record, yielding the type and the bytes from
/// the attribute start to the end of the used area. Stops at the end marker or
/// at the first header that does not fit.
pub struct RawAttributes<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for RawAttributes<'a> {
    type Item = (u32, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let slice = self.data.get(self.offset..)?;
        if slice.len() < 8 {
            return None;
        }

        let type_id = u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]);
        if type_id == NtfsAttributeType::End as u32 {
            return None;
        }

        let length = u32::from_le_bytes([slice[4], slice[5], slice[6], slice[7]]) as usize;
        if length == 0 || length > slice.len() {
            self.offset = self.data.len();
            return None;
        }

        self.offset += length;
        Some((type_id, slice))
    }
}

/// A primary record together with the extension records its attribute list
/// points to. Extensions are owned; there are no back references.
pub struct NtfsFile {
    record: NtfsRecord,
    extensions: Vec<NtfsFile>,
}

impl NtfsFile {
    pub fn new(record: NtfsRecord) -> Self {
        NtfsFile {
            record,
            extensions: Vec::new(),
        }
    }

    pub fn attach(&mut self, extension: NtfsFile) {
        self.extensions.push(extension);
    }

    pub fn record(&self) -> &NtfsRecord {
        &self.record
    }

    pub fn extensions(&self) -> &[NtfsFile] {
        &self.extensions
    }

    pub fn number(&self) -> u64 {
        self.record.number()
    }

    pub fn reference(&self) -> MftReference {
        self.record.reference()
    }

    pub fn is_directory(&self) -> bool {
        self.record.is_directory()
    }

    pub fn is_deleted(&self) -> bool {
        !self.record.is_used()
    }

    /// Looks at the primary record only, like every typed lookup on a file.
    /// Use `data_streams`, `total_size` or `list_streams` for views that
    /// include the extension records.
    pub fn find_attributes<'a, T: AttributeValue<'a>>(&'a self, required: bool) -> NtfsResult<Vec<T>> {
        self.record.find_attributes(required)
    }

    pub fn file_names(&self) -> NtfsResult<Vec<FileName>> {
        self.find_attributes::<FileName>(false)
    }

    /// The first name longer than a DOS name, or the first name when all of
    /// them are short.
    pub fn friendly_name(&self) -> NtfsResult<String> {
        let names = self.file_names()?;
        let chosen = names
            .iter()
            .find(|name| name.len() > DOS_NAME_LENGTH)
            .or_else(|| names.first())
            .ok_or(NtfsError::NoName(self.number()))?;
        Ok(chosen.name().to_string())
    }

    pub fn parent_reference(&self) -> NtfsResult<MftReference> {
        let names = self.file_names()?;
        names
            .first()
            .map(FileName::parent)
            .ok_or(NtfsError::NoName(self.number()))
    }

    pub fn standard_information(&self) -> NtfsResult<StandardInformation> {
        let mut found = self.find_attributes::<StandardInformation>(true)?;
        Ok(found.swap_remove(0))
    }

    fn collect_data_attributes<'a>(&'a self, out: &mut Vec<NtfsAttribute<'a>>) -> NtfsResult<()> {
        for attribute in self.record.attributes_of(NtfsAttributeType::Data) {
            out.push(attribute?);
        }
        for extension in &self.extensions {
            extension.collect_data_attributes(out)?;
        }
        Ok(())
    }

    /// Every data stream of the file, across the primary and the extension
    /// records. A stream split over several records is returned once, with
    /// the runs of all its pieces.
    pub fn data_streams(&self) -> NtfsResult<Vec<DataStream<'_>>> {
        let mut pieces = Vec::new();
        self.collect_data_attributes(&mut pieces)?;

        let mut groups: Vec<Vec<NtfsAttribute<'_>>> = Vec::new();
        for piece in pieces {
            match groups.iter().position(|g| g[0].name() == piece.name()) {
                Some(index) => groups[index].push(piece),
                None => groups.push(vec![piece]),
            }
        }

        let mut streams = Vec::with_capacity(groups.len());
        for mut group in groups {
            group.sort_by_key(|a| a.layout().map(|l| l.lowest_vcn).unwrap_or(0));
            let mut pieces = group.into_iter();
            let Some(mut first) = pieces.next() else {
                continue;
            };
            for piece in pieces {
                if let (Some(layout), Some(next)) = (first.layout_mut(), piece.layout()) {
                    layout.append(next)?;
                }
            }
            streams.push(DataStream::from_attribute(first)?);
        }
        Ok(streams)
    }

    pub fn data_stream(&self, name: &str) -> NtfsResult<DataStream<'_>> {
        self.data_streams()?
            .into_iter()
            .find(|stream| stream.name() == name)
            .ok_or_else(|| NtfsError::StreamNotFound(name.to_string()))
    }

    pub fn read<D: BlockDevice>(
        &self,
        volume: &mut Volume<D>,
        stream: &str,
        offset: u64,
        length: u64,
    ) -> NtfsResult<Vec<u8>> {
        self.data_stream(stream)?.read(volume, offset, length)
    }

    pub fn read_all<D: BlockDevice>(
        &self,
        volume: &mut Volume<D>,
        stream: &str,
    ) -> NtfsResult<Vec<u8>> {
        let stream = self.data_stream(stream)?;
        stream.read(volume, 0, stream.size())
    }

    pub fn size(&self, stream: &str) -> NtfsResult<u64> {
        Ok(self.data_stream(stream)?.size())
    }

    /// Size of the unnamed stream, zero when the file has none.
    pub fn main_size(&self) -> NtfsResult<u64> {
        match self.size("") {
            Err(NtfsError::StreamNotFound(_)) => Ok(0),
            other => other,
        }
    }

    /// Sum of every data stream, named ones included.
    pub fn total_size(&self) -> NtfsResult<u64> {
        Ok(self.data_streams()?.iter().map(DataStream::size).sum())
    }

    /// Names of the alternate data streams; the unnamed stream is left out.
    pub fn list_streams(&self) -> NtfsResult<Vec<String>> {
        Ok(self
            .data_streams()?
            .iter()
            .filter(|stream| !stream.name().is_empty())
            .map(|stream| stream.name().to_string())
            .collect())
    }
}
