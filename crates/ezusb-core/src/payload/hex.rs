//! Intel HEX line decoding.
//!
//! Only the record types the EZ-USB loader understands are accepted:
//! data (`00`) and end of file (`01`). Segment and linear address records
//! would address memory the 8051 cannot reach through the load request.

use byteorder::{BigEndian, ByteOrder};

use super::firmware::{FirmwareError, FirmwareRecord, RecordKind};

const RECORD_DATA: u8 = 0x00;
const RECORD_EOF: u8 = 0x01;

/// Decode one `:LLAAAATT...CC` line into a record.
pub fn parse_line(line: &str, line_no: usize) -> Result<FirmwareRecord, FirmwareError> {
    let body = line
        .strip_prefix(':')
        .ok_or(FirmwareError::MissingStartCode { line: line_no })?;

    if body.len() % 2 != 0 || body.len() < 10 {
        return Err(FirmwareError::MalformedRecord { line: line_no });
    }

    let bytes = decode_hex(body).ok_or(FirmwareError::MalformedRecord { line: line_no })?;

    let length = bytes[0] as usize;
    if bytes.len() != length + 5 {
        return Err(FirmwareError::LengthMismatch {
            line: line_no,
            declared: length,
            actual: bytes.len().saturating_sub(5),
        });
    }

    let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    if sum != 0 {
        return Err(FirmwareError::ChecksumMismatch {
            line: line_no,
            expected: bytes[bytes.len() - 1],
            actual: checksum(&bytes[..bytes.len() - 1]),
        });
    }

    let address = BigEndian::read_u16(&bytes[1..3]);
    let kind = match bytes[3] {
        RECORD_DATA => RecordKind::Data,
        RECORD_EOF => RecordKind::EndOfFile,
        other => {
            return Err(FirmwareError::UnsupportedRecordType {
                line: line_no,
                record_type: other,
            });
        }
    };

    Ok(FirmwareRecord {
        kind,
        address,
        data: bytes[4..4 + length].to_vec(),
    })
}

/// Two's-complement checksum over the record bytes preceding the checksum.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b))
        .wrapping_neg()
}

fn decode_hex(text: &str) -> Option<Vec<u8>> {
    text.as_bytes()
        .chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            Some(((hi << 4) | lo) as u8)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_data_record() {
        let rec = parse_line(":0300300002337A1E", 1).unwrap();
        assert_eq!(rec.kind, RecordKind::Data);
        assert_eq!(rec.address, 0x0030);
        assert_eq!(rec.data, vec![0x02, 0x33, 0x7A]);
    }

    #[test]
    fn test_parse_eof_record() {
        let rec = parse_line(":00000001FF", 7).unwrap();
        assert_eq!(rec.kind, RecordKind::EndOfFile);
        assert!(rec.data.is_empty());
    }

    #[test]
    fn test_bad_checksum() {
        let err = parse_line(":0300300002337A1F", 3).unwrap_err();
        assert!(matches!(
            err,
            FirmwareError::ChecksumMismatch {
                line: 3,
                expected: 0x1F,
                actual: 0x1E
            }
        ));
    }

    #[test]
    fn test_rejects_extended_address_record() {
        let err = parse_line(":020000040000FA", 1).unwrap_err();
        assert!(matches!(
            err,
            FirmwareError::UnsupportedRecordType { record_type: 4, .. }
        ));
    }

    #[test]
    fn test_malformed_lines() {
        assert!(matches!(
            parse_line("0300300002337A1E", 2),
            Err(FirmwareError::MissingStartCode { line: 2 })
        ));
        assert!(matches!(
            parse_line(":03003000ZZ337A1E", 2),
            Err(FirmwareError::MalformedRecord { .. })
        ));
        assert!(matches!(
            parse_line(":0400300002337A1D", 2),
            Err(FirmwareError::LengthMismatch { declared: 4, .. })
        ));
    }

    #[test]
    fn test_checksum() {
        assert_eq!(checksum(&[0x03, 0x00, 0x30, 0x00, 0x02, 0x33, 0x7A]), 0x1E);
        assert_eq!(checksum(&[0x00, 0x00, 0x00, 0x01]), 0xFF);
    }
}
