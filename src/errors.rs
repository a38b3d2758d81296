// Copyright (c) 2022, Matteo Bernacchia <dev@kikijiki.com>. All rights reserved.
// This project is dual licensed under the Apache License 2.0 and the MIT license.
// See the LICENSE files in the project root for details.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NtfsError {
    #[error("bad record header: {details}")]
    BadRecordHeader { details: &'static str },
    #[error("update sequence mismatch: {details}")]
    CorruptionError { details: String },
    #[error("read of {length} bytes at offset {offset} exceeds size {size}")]
    OutOfBounds { offset: u64, length: u64, size: u64 },
    #[error("expected {expected} bytes, got {actual}")]
    BadSize { expected: u64, actual: u64 },
    #[error("non-resident attribute has no data runs")]
    EmptyDataRun,
    #[error("invalid data run: {details}")]
    InvalidDataRun { details: &'static str },
    #[error("invalid boot sector: {details}")]
    InvalidBootSector { details: &'static str },
    #[error("attribute {type_id:#x} not found in record {record}")]
    AttributeNotFound { type_id: u32, record: u64 },
    #[error("stream '{0}' not found")]
    StreamNotFound(String),
    #[error("record not found: {0}")]
    RecordNotFound(String),
    #[error("bad path: {0}")]
    BadPath(String),
    #[error("record {0} has no file name")]
    NoName(u64),
    #[error("unsupported NTFS version {major}.{minor}")]
    UnsupportedVersion { major: u8, minor: u8 },
    #[error("unexpected action: {details}")]
    UnexpectedAction { details: &'static str },
    #[error("device error")]
    DeviceError(#[from] std::io::Error),
    #[error("output stream error")]
    OutputError(#[source] std::io::Error),
    #[error("binread error")]
    BinReadError(#[from] binread::error::Error),
    #[error("the process is not elevated")]
    ElevationError,
}

impl NtfsError {
    /// Errors that only concern the record being decoded. Bulk operations skip
    /// the record and carry on; anything else aborts them.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, NtfsError::OutputError(_) | NtfsError::ElevationError)
    }
}

pub type NtfsResult<T> = core::result::Result<T, NtfsError>;
