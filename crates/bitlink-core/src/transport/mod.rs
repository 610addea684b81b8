//! Platform BLE capability abstraction.
//!
//! Defines the `GattLink` and `Scanner` traits supplied by the host platform,
//! allowing the sessions to run against a real stack or the mock.

pub mod mock;
pub mod traits;

pub use mock::{MockLink, MockTimers};
pub use traits::{BondState, GattLink, GattStatus, LinkError, LinkEvent, Scanner};
