//! Device identity and the currently-associated-device repository.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// Hardware generation of the peripheral, detected during pairing from the
/// presence of the version-specific GATT service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HardwareVersion {
    #[default]
    Unknown,
    V1,
    V2,
}

impl HardwareVersion {
    /// Universal hex block id carried in block-start records for this target.
    pub fn hex_block_id(&self) -> Option<u16> {
        match self {
            HardwareVersion::Unknown => None,
            HardwareVersion::V1 => Some(0x9900),
            HardwareVersion::V2 => Some(0x9903),
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, HardwareVersion::Unknown)
    }
}

impl fmt::Display for HardwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HardwareVersion::Unknown => write!(f, "unknown"),
            HardwareVersion::V1 => write!(f, "V1"),
            HardwareVersion::V2 => write!(f, "V2"),
        }
    }
}

/// Identity of a scanned or paired peripheral.
///
/// Created when a device matching the expected name pattern is seen during a
/// scan; `hardware` and `bonded` are filled in as pairing progresses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Advertised device name, e.g. `BBC micro:bit [zotig]`.
    pub name: String,
    /// Display code used to match the device, lowercase with colons stripped.
    pub short_code: String,
    /// Opaque transport address of the peripheral.
    pub address: String,
    pub hardware: HardwareVersion,
    pub bonded: bool,
}

impl DeviceInfo {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        let name = name.into();
        let short_code = derive_short_code(&name);
        Self {
            name,
            short_code,
            address: address.into(),
            hardware: HardwareVersion::Unknown,
            bonded: false,
        }
    }
}

/// Case-insensitive match key for a device name: colons stripped, lowercased.
pub fn derive_short_code(name: &str) -> String {
    name.replace(':', "").to_lowercase()
}

/// Repository for the currently associated device.
///
/// Injected wherever the original kept a global singleton; the UI layer
/// supplies a persistent implementation, tests use [`MemoryStore`].
pub trait DeviceStore: Send + Sync {
    fn current(&self) -> Option<DeviceInfo>;
    fn set_current(&self, device: DeviceInfo);
    fn clear(&self);
}

/// In-memory store, also the test double.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Option<DeviceInfo>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeviceStore for MemoryStore {
    fn current(&self) -> Option<DeviceInfo> {
        self.inner.lock().unwrap().clone()
    }

    fn set_current(&self, device: DeviceInfo) {
        *self.inner.lock().unwrap() = Some(device);
    }

    fn clear(&self) {
        *self.inner.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_code_strips_colons_and_case() {
        assert_eq!(derive_short_code("BBC micro:bit [zotig]"), "bbc microbit [zotig]");
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.current().is_none());

        let mut dev = DeviceInfo::new("BBC micro:bit [patev]", "D3:14:15:92:65:35");
        dev.hardware = HardwareVersion::V2;
        store.set_current(dev);

        let got = store.current().unwrap();
        assert_eq!(got.hardware, HardwareVersion::V2);
        assert_eq!(got.short_code, "bbc microbit [patev]");

        store.clear();
        assert!(store.current().is_none());
    }

    #[test]
    fn test_hex_block_ids() {
        assert_eq!(HardwareVersion::V1.hex_block_id(), Some(0x9900));
        assert_eq!(HardwareVersion::V2.hex_block_id(), Some(0x9903));
        assert_eq!(HardwareVersion::Unknown.hex_block_id(), None);
    }
}
