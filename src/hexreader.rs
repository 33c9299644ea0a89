//! Intel HEX parsing: turns `:LLAAAATT[DD..]CC` lines into a stream of
//! [`Record`]s, verifying the two's-complement checksum on each line.

use std::io::BufRead;

use crate::error::{PigroError, Result};

/// Record type byte (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Data,
    EndOfFile,
    ExtendedSegmentAddress,
    ExtendedLinearAddress,
    Other(u8),
}

impl From<u8> for RecordType {
    fn from(b: u8) -> Self {
        match b {
            0x00 => RecordType::Data,
            0x01 => RecordType::EndOfFile,
            0x02 => RecordType::ExtendedSegmentAddress,
            0x04 => RecordType::ExtendedLinearAddress,
            other => RecordType::Other(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Record {
    pub addr16: u16,
    pub record_type: RecordType,
    pub data: Vec<u8>,
}

fn parse_hex_byte(bytes: &[u8], i: usize) -> Result<u8> {
    let s = std::str::from_utf8(&bytes[i * 2..i * 2 + 2]).map_err(|_| {
        PigroError::HexMalformed("non-UTF8 byte in hex digit pair".into())
    })?;
    u8::from_str_radix(s, 16).map_err(|_| PigroError::HexMalformed(format!("bad hex digit pair '{s}'")))
}

/// Parses one Intel HEX line (without its trailing newline) into a [`Record`].
fn parse_line(line: &str, line_no: usize) -> Result<Record> {
    if line.len() < 11 {
        return Err(PigroError::HexMalformed(format!(
            "line {line_no}: too short ({} chars)",
            line.len()
        )));
    }
    if !line.starts_with(':') {
        return Err(PigroError::HexMalformed(format!(
            "line {line_no}: does not start with ':'"
        )));
    }
    let hexpart = line[1..].as_bytes();
    let len = parse_hex_byte(hexpart, 0)? as usize;
    let bytelen = len + 5;
    if hexpart.len() < bytelen * 2 {
        return Err(PigroError::HexMalformed(format!("line {line_no}: line too short for declared length")));
    }

    let mut bytes = Vec::with_capacity(bytelen);
    for i in 0..bytelen {
        bytes.push(parse_hex_byte(hexpart, i)?);
    }

    let mut sum: u8 = 0;
    for b in &bytes[..bytelen - 1] {
        sum = sum.wrapping_sub(*b);
    }
    let checksum = bytes[bytelen - 1];
    if checksum != sum {
        return Err(PigroError::HexBadChecksum { line: line_no });
    }

    let addr16 = ((bytes[1] as u16) << 8) | bytes[2] as u16;
    let record_type = RecordType::from(bytes[3]);
    let data = bytes[4..4 + len].to_vec();

    Ok(Record { addr16, record_type, data })
}

/// Reads every record out of an Intel HEX file, stopping at the first
/// `EndOfFile` record. Fails if the file ends without one.
pub fn read_all(reader: impl BufRead) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line.map_err(PigroError::Io)?;
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let record = parse_line(line, i + 1)?;
        let is_eof = record.record_type == RecordType::EndOfFile;
        records.push(record);
        if is_eof {
            return Ok(records);
        }
    }
    Err(PigroError::HexMalformed("unexpected end of file (no EOF record)".into()))
}

pub fn read_str(text: &str) -> Result<Vec<Record>> {
    read_all(std::io::Cursor::new(text.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_data_record() {
        let rec = parse_line(":10000000DEADBEEF00112233445566778899AABB56", 1).unwrap();
        assert_eq!(rec.record_type, RecordType::Data);
        assert_eq!(rec.addr16, 0);
        assert_eq!(
            rec.data,
            vec![0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB]
        );
    }

    #[test]
    fn known_good_line_roundtrips() {
        // :02000004000000FA -> extended linear address record, base=0x0000
        let rec = parse_line(":02000004000000FA", 1).unwrap();
        assert_eq!(rec.record_type, RecordType::ExtendedLinearAddress);
        assert_eq!(rec.data, vec![0x00, 0x00]);
    }

    #[test]
    fn eof_record() {
        let rec = parse_line(":00000001FF", 1).unwrap();
        assert_eq!(rec.record_type, RecordType::EndOfFile);
        assert!(rec.data.is_empty());
    }

    #[test]
    fn bad_checksum_rejected() {
        let err = parse_line(":00000001FE", 1).unwrap_err();
        assert!(matches!(err, PigroError::HexBadChecksum { line: 1 }));
    }

    #[test]
    fn too_short_line_rejected() {
        let err = parse_line(":00", 1).unwrap_err();
        assert!(matches!(err, PigroError::HexMalformed(_)));
    }

    #[test]
    fn missing_colon_rejected() {
        let err = parse_line("00000001FF", 1).unwrap_err();
        assert!(matches!(err, PigroError::HexMalformed(_)));
    }

    #[test]
    fn stream_requires_eof_record() {
        let text = ":02000004000000FA\n";
        let err = read_str(text).unwrap_err();
        assert!(matches!(err, PigroError::HexMalformed(_)));
    }

    #[test]
    fn full_stream_with_data() {
        let text = ":020000040000FA\n:00000001FF\n";
        let records = read_str(text).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].record_type, RecordType::EndOfFile);
    }
}
