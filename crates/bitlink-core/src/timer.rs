//! Single-shot named timers.
//!
//! Sessions never spawn their own threads; they ask the host scheduler to arm
//! a timer and receive a `LinkEvent::Timer` back on the same scheduling
//! context as every other platform event.

use std::time::Duration;

/// Identifies a timer purpose. At most one timer per id is ever pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Scan window expiry (pairing).
    Scan,
    /// Connect timeout; doubles as the retry delay trigger.
    Connect,
    /// Per-step work timeout (fetch), re-armed on every fragment.
    Work,
    /// Service-changed grace before calling discover on a bonded device.
    Discover,
    /// Settle time after enabling notifications, before the first request.
    Subscribe,
    /// Grace before requesting a bond, to let automatic bonding UIs win.
    Bond,
    /// Periodic poll for bonded-and-version-known (pairing).
    PairCheck,
    /// Window in which the peer is expected to disconnect itself after
    /// bonding.
    DisconnectWait,
    /// Short settle before delivering a terminal result to the caller.
    SignalResult,
}

/// Host-provided timer scheduling capability.
pub trait TimerHost {
    /// Arm a single-shot timer. Arming an id that is already pending replaces
    /// it; there is never more than one in-flight timer per id.
    fn arm(&mut self, id: TimerId, after: Duration);

    /// Cancel a pending timer; a no-op if none is pending.
    fn cancel(&mut self, id: TimerId);

    /// Cancel every pending timer.
    fn cancel_all(&mut self);
}
