//! Firmware image for the EZ-USB loader.
//!
//! An image is an ordered list of (address, payload) records as found in an
//! Intel HEX file. Records are sent to the part in file order; the sequence
//! ends at the first end-of-file record.

use std::path::Path;

use thiserror::Error;
use tracing::info;

use super::hex;

#[derive(Error, Debug)]
pub enum FirmwareError {
    #[error("Line {line}: missing ':' start code")]
    MissingStartCode { line: usize },
    #[error("Line {line}: malformed record")]
    MalformedRecord { line: usize },
    #[error("Line {line}: record declares {declared} data bytes, found {actual}")]
    LengthMismatch {
        line: usize,
        declared: usize,
        actual: usize,
    },
    #[error("Line {line}: checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    ChecksumMismatch { line: usize, expected: u8, actual: u8 },
    #[error("Line {line}: unsupported record type 0x{record_type:02X}")]
    UnsupportedRecordType { line: usize, record_type: u8 },
    #[error("Image has no end-of-file record")]
    MissingEndOfFile,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// Payload to be written at `address`.
    Data,
    /// Terminates the image.
    EndOfFile,
}

/// One firmware record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareRecord {
    pub kind: RecordKind,
    pub address: u16,
    pub data: Vec<u8>,
}

impl FirmwareRecord {
    pub fn data(address: u16, data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: RecordKind::Data,
            address,
            data: data.into(),
        }
    }

    pub fn end_of_file() -> Self {
        Self {
            kind: RecordKind::EndOfFile,
            address: 0,
            data: Vec::new(),
        }
    }

    /// Payload length as sent in `wLength`.
    pub fn len(&self) -> u16 {
        self.data.len() as u16
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Parsed firmware image.
#[derive(Debug, Clone, Default)]
pub struct FirmwareImage {
    records: Vec<FirmwareRecord>,
}

impl FirmwareImage {
    /// Build an image from records already in memory.
    ///
    /// No end-of-file record is required here; iteration simply stops at the
    /// first one if present.
    pub fn from_records(records: Vec<FirmwareRecord>) -> Self {
        Self { records }
    }

    /// Parse an Intel HEX document.
    pub fn from_hex_str(text: &str) -> Result<Self, FirmwareError> {
        let mut records = Vec::new();
        let mut saw_eof = false;

        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let record = hex::parse_line(line, idx + 1)?;
            if record.kind == RecordKind::EndOfFile {
                saw_eof = true;
            }
            records.push(record);
        }

        if !saw_eof {
            return Err(FirmwareError::MissingEndOfFile);
        }

        Ok(Self { records })
    }

    /// Load and parse an Intel HEX file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, FirmwareError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let image = Self::from_hex_str(&text)?;
        info!(
            path = %path.display(),
            records = image.data_records().count(),
            bytes = image.payload_size(),
            "Loaded firmware image"
        );
        Ok(image)
    }

    /// Data records in download order, up to the first end-of-file record.
    pub fn data_records(&self) -> impl Iterator<Item = &FirmwareRecord> {
        self.records
            .iter()
            .take_while(|r| r.kind == RecordKind::Data)
    }

    /// Total payload bytes that will be downloaded.
    pub fn payload_size(&self) -> usize {
        self.data_records().map(|r| r.data.len()).sum()
    }

    /// All records, including any after the end-of-file marker.
    pub fn records(&self) -> &[FirmwareRecord] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.data_records().next().is_none()
    }
}
