//! Region selection from universal (multi-target) hex containers.

use tracing::debug;

use super::record::{HexRecord, RecordKind};
use super::HexError;
use crate::device::HardwareVersion;

/// Upper bound on the span of a selected region. No supported device has
/// this much flash; a sparse block exceeding it would otherwise zero-fill an
/// arbitrarily large buffer.
const MAX_REGION_BYTES: u64 = 16 * 1024 * 1024;

/// Application flash region scanned when a container carries no block
/// markers (plain application hex).
fn app_region(hardware: HardwareVersion) -> (u32, u32) {
    match hardware {
        HardwareVersion::V1 => (0x18000, 0x3C000),
        // V2 and unknown share the larger window; unknown never gets here
        // because callers fail on a missing block id first.
        _ => (0x1C000, 0x77000),
    }
}

/// Result of selecting one hardware region out of a container.
#[derive(Debug, Clone)]
pub struct ApplicationImage {
    /// The region re-emitted as a standalone linear hex stream.
    pub hex: String,
    /// Flat binary image: records applied at `address - base` into a
    /// zero-filled buffer.
    pub binary: Vec<u8>,
    /// Lowest absolute address covered by the region.
    pub base: u32,
}

impl ApplicationImage {
    pub fn binary_size(&self) -> u32 {
        self.binary.len() as u32
    }
}

/// List the block ids present in a container, in order of appearance.
/// Empty for a plain application hex.
pub fn container_block_ids(container: &[u8]) -> Result<Vec<u16>, HexError> {
    let mut ids = Vec::new();
    for (record, _) in records(container)? {
        if record.kind == RecordKind::BlockStart && record.data.len() >= 2 {
            ids.push(u16::from_be_bytes([record.data[0], record.data[1]]));
        }
    }
    Ok(ids)
}

/// Extract the region matching `hardware` from a container.
///
/// Containers with block markers yield the records between the matching
/// block-start and its block-end; containers without markers are filtered to
/// the hardware's application flash region. Either way an empty selection is
/// an incompatibility, never an empty image.
pub fn select_region(
    container: &[u8],
    hardware: HardwareVersion,
) -> Result<ApplicationImage, HexError> {
    let wanted = hardware
        .hex_block_id()
        .ok_or(HexError::NoRegion(hardware))?;

    let parsed = records(container)?;
    let is_universal = parsed
        .iter()
        .any(|(r, _)| r.kind == RecordKind::BlockStart);

    let selected = if is_universal {
        select_by_block(&parsed, wanted)
    } else {
        select_by_address_range(&parsed, app_region(hardware))
    };

    if selected.is_empty() {
        return Err(HexError::NoRegion(hardware));
    }
    debug!(
        %hardware,
        records = selected.len(),
        universal = is_universal,
        "region selected"
    );
    build_image(&selected)
}

fn records(container: &[u8]) -> Result<Vec<(HexRecord, usize)>, HexError> {
    let text = std::str::from_utf8(container).map_err(|_| HexError::NotText)?;
    let mut parsed = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        parsed.push((HexRecord::parse(line, idx + 1)?, idx + 1));
    }
    Ok(parsed)
}

/// Selected data, as (absolute address, bytes) pairs in file order.
type Selection = Vec<(u32, Vec<u8>)>;

fn select_by_block(parsed: &[(HexRecord, usize)], wanted: u16) -> Selection {
    let mut selected = Selection::new();
    let mut high: u32 = 0;
    // None = outside any block, Some(m) = inside a block, matching or not.
    let mut in_block: Option<bool> = None;

    for (record, _) in parsed {
        match record.kind {
            RecordKind::ExtLinearAddress => {
                if record.data.len() >= 2 {
                    high = u32::from(u16::from_be_bytes([record.data[0], record.data[1]])) << 16;
                }
            }
            RecordKind::BlockStart => {
                let id = if record.data.len() >= 2 {
                    u16::from_be_bytes([record.data[0], record.data[1]])
                } else {
                    0
                };
                in_block = Some(id == wanted);
            }
            RecordKind::BlockEnd => {
                in_block = None;
            }
            RecordKind::Data | RecordKind::CustomData => {
                if in_block == Some(true) && !record.data.is_empty() {
                    selected.push((high + u32::from(record.address), record.data.clone()));
                }
            }
            // Alignment padding carries no image bytes.
            RecordKind::PaddedData => {}
            RecordKind::EndOfFile => break,
            _ => {}
        }
    }
    selected
}

fn select_by_address_range(parsed: &[(HexRecord, usize)], range: (u32, u32)) -> Selection {
    let (lo, hi) = range;
    let mut selected = Selection::new();
    let mut high: u32 = 0;

    for (record, _) in parsed {
        match record.kind {
            RecordKind::ExtLinearAddress => {
                if record.data.len() >= 2 {
                    high = u32::from(u16::from_be_bytes([record.data[0], record.data[1]])) << 16;
                }
            }
            RecordKind::Data => {
                // Widen before adding the length; a record at the top of the
                // 32-bit space must not wrap.
                let start = u64::from(high) + u64::from(record.address);
                let end = start + record.data.len() as u64;
                let (lo, hi) = (u64::from(lo), u64::from(hi));
                if end <= lo || start >= hi {
                    continue;
                }
                // Trim records straddling the region boundary.
                let first = lo.saturating_sub(start) as usize;
                let last = (hi.min(end) - start) as usize;
                if last > first {
                    selected.push((
                        (start + first as u64) as u32,
                        record.data[first..last].to_vec(),
                    ));
                }
            }
            RecordKind::EndOfFile => break,
            _ => {}
        }
    }
    selected
}

fn build_image(selected: &Selection) -> Result<ApplicationImage, HexError> {
    let base = selected.iter().map(|(addr, _)| *addr).min().unwrap_or(0);
    let end = selected
        .iter()
        .map(|(addr, data)| u64::from(*addr) + data.len() as u64)
        .max()
        .unwrap_or(0);

    let span = end - u64::from(base);
    if span > MAX_REGION_BYTES {
        return Err(HexError::RegionTooLarge { span });
    }

    let mut binary = vec![0u8; span as usize];
    for (addr, data) in selected {
        let offset = (addr - base) as usize;
        binary[offset..offset + data.len()].copy_from_slice(data);
    }

    // Re-emit as a plain linear hex stream, inserting extended linear
    // address records whenever the upper 16 bits change.
    let mut hex = String::new();
    let mut current_high: Option<u16> = None;
    for (addr, data) in selected {
        let high = (addr >> 16) as u16;
        if current_high != Some(high) {
            hex.push_str(&HexRecord::ext_linear(high).emit());
            hex.push('\n');
            current_high = Some(high);
        }
        hex.push_str(&HexRecord::data_record(*addr as u16, data.clone()).emit());
        hex.push('\n');
    }
    hex.push_str(&HexRecord::end_of_file().emit());
    hex.push('\n');

    Ok(ApplicationImage { hex, binary, base })
}
