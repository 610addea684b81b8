//! Intel-HEX transcoding for multi-target firmware containers.
//!
//! A universal container embeds one region per hardware revision, delimited
//! by block-start/block-end records whose first two data bytes carry the
//! target's block id. [`select_region`] extracts the region for one hardware
//! version and re-emits it as a plain application hex stream plus the flat
//! binary image the bootloader consumes.

pub mod record;
pub mod universal;

use thiserror::Error;

use crate::device::HardwareVersion;

pub use record::{HexRecord, RecordKind};
pub use universal::{ApplicationImage, container_block_ids, select_region};

#[derive(Error, Debug)]
pub enum HexError {
    #[error("container is not valid text")]
    NotText,
    #[error("line {line}: not a hex record")]
    NotARecord { line: usize },
    #[error("line {line}: truncated record")]
    Truncated { line: usize },
    #[error("line {line}: invalid hex digits")]
    BadDigits { line: usize },
    #[error("line {line}: checksum mismatch")]
    Checksum { line: usize },
    #[error("container holds no region for {0} hardware")]
    NoRegion(HardwareVersion),
    #[error("selected region spans {span} bytes, beyond any supported flash")]
    RegionTooLarge { span: u64 },
}
