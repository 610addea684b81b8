//! Intel-HEX record parsing and emission.
//!
//! Line layout: `:LLAAAATT<data>CC` where LL is the data byte count, AAAA the
//! 16-bit record address, TT the record type, and CC a checksum chosen so the
//! sum of every decoded byte on the line is 0 mod 256.

use std::fmt::Write as _;

use super::HexError;

/// Record types, including the universal-container extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Data,
    EndOfFile,
    ExtSegmentAddress,
    StartSegmentAddress,
    ExtLinearAddress,
    StartLinearAddress,
    /// Universal container: opens a hardware-targeted block; the first two
    /// data bytes are the big-endian block id.
    BlockStart,
    /// Universal container: closes the current block.
    BlockEnd,
    /// Universal container: data padded to align the block; not part of the
    /// application image.
    PaddedData,
    /// Universal container: block-local data, equivalent to `Data` once the
    /// block is selected.
    CustomData,
    Other(u8),
}

impl RecordKind {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => RecordKind::Data,
            0x01 => RecordKind::EndOfFile,
            0x02 => RecordKind::ExtSegmentAddress,
            0x03 => RecordKind::StartSegmentAddress,
            0x04 => RecordKind::ExtLinearAddress,
            0x05 => RecordKind::StartLinearAddress,
            0x0A => RecordKind::BlockStart,
            0x0B => RecordKind::BlockEnd,
            0x0C => RecordKind::PaddedData,
            0x0D => RecordKind::CustomData,
            other => RecordKind::Other(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            RecordKind::Data => 0x00,
            RecordKind::EndOfFile => 0x01,
            RecordKind::ExtSegmentAddress => 0x02,
            RecordKind::StartSegmentAddress => 0x03,
            RecordKind::ExtLinearAddress => 0x04,
            RecordKind::StartLinearAddress => 0x05,
            RecordKind::BlockStart => 0x0A,
            RecordKind::BlockEnd => 0x0B,
            RecordKind::PaddedData => 0x0C,
            RecordKind::CustomData => 0x0D,
            RecordKind::Other(code) => *code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexRecord {
    pub address: u16,
    pub kind: RecordKind,
    pub data: Vec<u8>,
}

impl HexRecord {
    pub fn data_record(address: u16, data: Vec<u8>) -> Self {
        Self {
            address,
            kind: RecordKind::Data,
            data,
        }
    }

    pub fn ext_linear(high: u16) -> Self {
        Self {
            address: 0,
            kind: RecordKind::ExtLinearAddress,
            data: high.to_be_bytes().to_vec(),
        }
    }

    pub fn end_of_file() -> Self {
        Self {
            address: 0,
            kind: RecordKind::EndOfFile,
            data: Vec::new(),
        }
    }

    /// Parse one line. `line_no` is 1-based, for diagnostics only.
    pub fn parse(line: &str, line_no: usize) -> Result<Self, HexError> {
        let line = line.trim();
        let rest = line
            .strip_prefix(':')
            .ok_or(HexError::NotARecord { line: line_no })?;
        if rest.len() < 10 || rest.len() % 2 != 0 {
            return Err(HexError::Truncated { line: line_no });
        }

        let mut bytes = Vec::with_capacity(rest.len() / 2);
        for i in (0..rest.len()).step_by(2) {
            let byte = u8::from_str_radix(&rest[i..i + 2], 16)
                .map_err(|_| HexError::BadDigits { line: line_no })?;
            bytes.push(byte);
        }

        let count = bytes[0] as usize;
        if bytes.len() != count + 5 {
            return Err(HexError::Truncated { line: line_no });
        }

        // The checksum byte is chosen so the whole line sums to zero.
        let sum: u8 = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        if sum != 0 {
            return Err(HexError::Checksum { line: line_no });
        }

        let address = u16::from_be_bytes([bytes[1], bytes[2]]);
        let kind = RecordKind::from_code(bytes[3]);
        let data = bytes[4..4 + count].to_vec();
        Ok(Self { address, kind, data })
    }

    /// Emit the record as a hex line with a freshly computed checksum.
    pub fn emit(&self) -> String {
        let mut sum = (self.data.len() as u8)
            .wrapping_add((self.address >> 8) as u8)
            .wrapping_add(self.address as u8)
            .wrapping_add(self.kind.code());
        for &b in &self.data {
            sum = sum.wrapping_add(b);
        }
        let checksum = sum.wrapping_neg();

        let mut out = String::with_capacity(11 + self.data.len() * 2);
        out.push(':');
        let _ = write!(
            out,
            "{:02X}{:04X}{:02X}",
            self.data.len(),
            self.address,
            self.kind.code()
        );
        for &b in &self.data {
            let _ = write!(out, "{:02X}", b);
        }
        let _ = write!(out, "{:02X}", checksum);
        out
    }
}
