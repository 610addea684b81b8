//! Bitlink-Core: BLE companion protocol for micro:bit-class peripherals.
//!
//! This crate implements the host side of the peripheral's utility service:
//! pairing, chunked log download, and flash artifact preparation.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Constants and the chunked download engine
//! - **Transport**: BLE capability abstraction (platform traits, mock)
//! - **Pair / Fetch**: Event-driven session state machines
//! - **Hex**: Universal container parsing and region selection
//! - **Flash**: DFU artifact preparation (init packet, bundle)
//! - **Events**: Observer pattern for UI decoupling
//!
//! The sessions own no threads and no BLE stack: the host injects
//! [`transport::GattLink`], [`transport::Scanner`] and [`timer::TimerHost`]
//! capabilities, then delivers [`transport::LinkEvent`]s on one scheduling
//! context.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use bitlink_core::config::FetchConfig;
//! use bitlink_core::events::TracingObserver;
//! use bitlink_core::fetch::FetchSession;
//! use bitlink_core::transport::{MockLink, MockTimers};
//!
//! let link = MockLink::new();
//! let timers = MockTimers::new();
//! let mut session = FetchSession::new(
//!     link,
//!     timers,
//!     Arc::new(TracingObserver),
//!     FetchConfig::default(),
//! );
//! session.start().expect("fetch failed to start");
//! ```

pub mod config;
pub mod device;
pub mod events;
pub mod fetch;
pub mod flash;
pub mod hex;
pub mod pair;
pub mod protocol;
pub mod timer;
pub mod transport;

// Re-exports for convenience
pub use config::{Config, FetchConfig, PairConfig};
pub use device::{DeviceInfo, DeviceStore, HardwareVersion, MemoryStore};
pub use events::{NullObserver, SessionEvent, SessionObserver, TracingObserver};
pub use fetch::{FetchResult, FetchSession};
pub use flash::{FlashMethod, FlashRequest, FlashStatus};
pub use hex::{ApplicationImage, HexError};
pub use pair::{PairResult, PairSession};
pub use protocol::{DownloadEngine, DownloadError, DownloadState};
pub use timer::{TimerHost, TimerId};
pub use transport::{GattLink, LinkError, LinkEvent, MockLink, MockTimers, Scanner};
