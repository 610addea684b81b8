//! Event system for UI decoupling.
//!
//! Lets a CLI or GUI host subscribe to session progress without tight
//! coupling to the state machines.

use crate::device::DeviceInfo;
use crate::fetch::FetchResult;
use crate::flash::FlashStatus;
use crate::pair::PairResult;

/// Events emitted by the pairing and fetch sessions.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Pairing reached a new outcome.
    PairState { result: PairResult },
    /// Pairing found or finished with a device.
    DeviceAssociated { device: DeviceInfo },
    /// Fetch reached a new outcome.
    FetchState { result: FetchResult },
    /// Download progress, 0..=100.
    FetchProgress { percent: u8 },
    /// The download completed; the data is handed over whole.
    FetchData { format: u8, data: Vec<u8> },
    /// Platform flasher progress passthrough.
    Flash(FlashStatus),
}

/// Observer trait for receiving session events.
///
/// Implement this in the UI layer to receive updates.
pub trait SessionObserver: Send + Sync {
    fn on_event(&self, event: &SessionEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl SessionObserver for NullObserver {
    fn on_event(&self, _event: &SessionEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl SessionObserver for TracingObserver {
    fn on_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::PairState { result } => {
                tracing::info!(result = ?result, "pairing state");
            }
            SessionEvent::DeviceAssociated { device } => {
                tracing::info!(
                    name = %device.name,
                    hardware = %device.hardware,
                    bonded = device.bonded,
                    "device associated"
                );
            }
            SessionEvent::FetchState { result } => {
                tracing::info!(result = ?result, "fetch state");
            }
            SessionEvent::FetchProgress { percent } => {
                tracing::debug!(percent = percent, "fetch progress");
            }
            SessionEvent::FetchData { format, data } => {
                tracing::info!(format = format, len = data.len(), "fetch complete");
            }
            SessionEvent::Flash(status) => match status {
                FlashStatus::Failed(code) => {
                    tracing::error!(code = code, "flash failed");
                }
                other => {
                    tracing::info!(status = ?other, "flash status");
                }
            },
        }
    }
}
