//! Protocol constants for the utility download service.
//!
//! Wire structures are derived from the peripheral's utility service:
//! a single 20-byte control characteristic carrying job-tagged request and
//! reply frames.

use uuid::Uuid;

// ============================================================================
// GATT identifiers
// ============================================================================

/// Utility service exposing the log download protocol.
pub const UTILITY_SERVICE: Uuid = Uuid::from_u128(0xE95D0001_251D_470A_A062_FA1922DFA9A8);

/// Control characteristic: requests are written here, replies arrive as
/// notifications on the same characteristic.
pub const UTILITY_CONTROL: Uuid = Uuid::from_u128(0xE95D0002_251D_470A_A062_FA1922DFA9A8);

/// Secure DFU service; present on V2 hardware only, which makes it double as
/// the hardware generation probe.
pub const SECURE_DFU_SERVICE: Uuid = Uuid::from_u128(0x0000FE59_0000_1000_8000_00805F9B34FB);

/// Client Characteristic Configuration descriptor.
pub const CLIENT_CHARACTERISTIC_CONFIG: Uuid =
    Uuid::from_u128(0x00002902_0000_1000_8000_00805F9B34FB);

// ============================================================================
// Frame layout
// ============================================================================

/// Maximum PDU carried by the control characteristic.
pub const PDU_SIZE: usize = 20;

/// Reply payload capacity: PDU minus the job byte.
pub const REPLY_PAYLOAD_MAX: usize = PDU_SIZE - 1;

/// Length-query request frame size.
pub const REQUEST_LENGTH_SIZE: usize = 3;

/// Batched-read request frame size.
pub const REQUEST_READ_SIZE: usize = 16;

// ============================================================================
// Request types (byte 1 of a request frame)
// ============================================================================

pub const REQUEST_TYPE_NONE: u8 = 0;
/// Reply payload = u32 LE total data length.
pub const REQUEST_TYPE_LENGTH: u8 = 1;
/// Reply payload = up to 19 bytes of data.
pub const REQUEST_TYPE_READ: u8 = 2;

// ============================================================================
// Log formats (byte 2 of a request frame)
// ============================================================================

pub const FORMAT_HTML_HEADER: u8 = 0;
pub const FORMAT_HTML: u8 = 1;
pub const FORMAT_CSV: u8 = 2;

// ============================================================================
// Job byte nibbles
// ============================================================================

/// Highest valid sequence nibble; the counter wraps back to 0 after this.
pub const SEQUENCE_MAX: u8 = 0x0E;

/// Reserved low nibble signalling a peer-reported error; the payload is a
/// 4-byte signed error code.
pub const SEQUENCE_ERROR: u8 = 0x0F;
