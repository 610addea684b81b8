//! Platform GATT capability traits.
//!
//! The sessions never talk to a BLE stack directly; the host injects these
//! capabilities at construction and delivers [`LinkEvent`]s — connection
//! changes, notifications, bond broadcasts, timer expirations — as discrete
//! events on one scheduling context.

use thiserror::Error;
use uuid::Uuid;

use crate::timer::TimerId;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("adapter unavailable")]
    AdapterUnavailable,
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("not connected")]
    NotConnected,
    #[error("scan failed: {0}")]
    ScanFailed(String),
    #[error("service {service} missing characteristic {characteristic}")]
    NoCharacteristic { service: Uuid, characteristic: Uuid },
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("bond request failed")]
    BondFailed,
}

/// Completion status reported by the platform for an async GATT operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    /// Platform-specific failure code.
    Error(u16),
}

impl GattStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, GattStatus::Success)
    }
}

/// Bond state of the remote device as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BondState {
    #[default]
    None,
    Bonding,
    Bonded,
}

/// One GATT connection to the associated device.
///
/// All operations are fire-and-forget: the call returns once the request is
/// queued and the outcome arrives later as a [`LinkEvent`].
pub trait GattLink {
    /// Open a connection to the associated device.
    fn connect(&mut self) -> Result<(), LinkError>;

    /// Tear down the connection. Safe to call when already disconnected.
    fn disconnect(&mut self);

    /// Begin service discovery on the open connection.
    fn discover_services(&mut self) -> Result<(), LinkError>;

    /// Whether a discovered service is present.
    fn has_service(&self, service: Uuid) -> bool;

    /// Whether a discovered characteristic is present.
    fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool;

    /// Enable or disable notifications on a characteristic (CCC write).
    fn set_notify(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        enable: bool,
    ) -> Result<(), LinkError>;

    /// Write bytes to a characteristic without response.
    fn write(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), LinkError>;

    /// Current bond state of the remote device.
    fn bond_state(&self) -> BondState;

    /// Ask the platform to start bonding.
    fn request_bond(&mut self) -> Result<(), LinkError>;
}

/// BLE scan capability used by the pairing session.
pub trait Scanner {
    fn start_scan(&mut self) -> Result<(), LinkError>;
    fn stop_scan(&mut self);
}

/// Discrete platform events delivered to a session.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Connection state changed.
    ConnectionState { connected: bool, status: GattStatus },
    /// Service discovery completed.
    ServicesDiscovered { status: GattStatus },
    /// The CCC descriptor write completed.
    NotifyEnabled { status: GattStatus },
    /// A characteristic write completed.
    WriteConfirmed { status: GattStatus },
    /// A notification arrived.
    Notification {
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    /// Platform bond-state broadcast for the named device.
    BondChanged {
        name: String,
        state: BondState,
        previous: BondState,
    },
    /// A scan reported an advertising device.
    DeviceFound { name: String, address: String },
    /// A timer armed via [`crate::timer::TimerHost`] expired.
    Timer(TimerId),
}
