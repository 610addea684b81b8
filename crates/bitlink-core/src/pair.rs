//! Pairing session: scan, connect, probe hardware, bond, disconnect.
//!
//! The peripheral advertises under a name carrying its display code; the
//! session scans for it, connects, detects the hardware generation from the
//! GATT table, and waits for the platform bond to complete. The bond itself
//! belongs to the platform; this session only requests it and watches the
//! state, both by broadcast and by polling.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::PairConfig;
use crate::device::{derive_short_code, DeviceInfo, DeviceStore, HardwareVersion};
use crate::events::{SessionEvent, SessionObserver};
use crate::protocol::constants::SECURE_DFU_SERVICE;
use crate::timer::{TimerHost, TimerId};
use crate::transport::{BondState, GattLink, LinkError, LinkEvent, Scanner};

/// Final (or latest) outcome of a pairing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PairResult {
    #[default]
    None,
    Found,
    Connected,
    /// The device was already bonded; no bond request was made.
    AlreadyPaired,
    Paired,
    TimeoutScan,
    TimeoutConnect,
    /// Bonding never completed within the polling budget.
    TimeoutPair,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum PairPhase {
    #[default]
    Idle,
    Scanning,
    Connecting,
    Discovering,
    /// Post-discovery grace before requesting the bond.
    BondGrace,
    WaitingBond,
    /// Bonded; waiting for the disconnect to complete.
    Disconnecting,
    /// Disconnected; letting the platform settle before reporting.
    Settling,
    Done,
}

pub struct PairSession<L, T, O> {
    link: L,
    timers: T,
    observer: Arc<O>,
    store: Arc<dyn DeviceStore>,
    config: PairConfig,
    /// Name pattern the advertising device must match.
    expected: String,
    phase: PairPhase,
    result: PairResult,
    device: Option<DeviceInfo>,
    connect_attempts: u32,
    /// Set while sitting out the inter-retry delay; the next Connect timer
    /// expiry starts the attempt instead of timing one out.
    retry_wait: bool,
    bond_checks: u32,
    /// Result to report once the disconnect settles.
    pending_result: PairResult,
    stopped: bool,
}

impl<L, T, O> PairSession<L, T, O>
where
    L: GattLink + Scanner,
    T: TimerHost,
    O: SessionObserver,
{
    pub fn new(
        link: L,
        timers: T,
        observer: Arc<O>,
        store: Arc<dyn DeviceStore>,
        config: PairConfig,
        expected: impl Into<String>,
    ) -> Self {
        Self {
            link,
            timers,
            observer,
            store,
            config,
            expected: expected.into(),
            phase: PairPhase::Idle,
            result: PairResult::None,
            device: None,
            connect_attempts: 0,
            retry_wait: false,
            bond_checks: 0,
            pending_result: PairResult::None,
            stopped: false,
        }
    }

    pub fn result(&self) -> PairResult {
        self.result
    }

    pub fn device(&self) -> Option<&DeviceInfo> {
        self.device.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.stopped
    }

    /// Begin scanning for the expected device.
    pub fn start(&mut self) -> Result<(), LinkError> {
        self.phase = PairPhase::Scanning;
        self.timers.arm(
            TimerId::Scan,
            Duration::from_millis(self.config.scan_timeout_ms),
        );
        self.link.start_scan()
    }

    /// Tear the session down without a result change. Safe to call twice.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.phase = PairPhase::Done;
        self.timers.cancel_all();
        self.link.stop_scan();
        self.link.disconnect();
    }

    fn finish(&mut self, result: PairResult) {
        self.result = result;
        info!(result = ?result, "pairing finished");
        self.stop();
        self.observer.on_event(&SessionEvent::PairState { result });
        if matches!(result, PairResult::Paired | PairResult::AlreadyPaired) {
            if let Some(device) = &self.device {
                self.observer.on_event(&SessionEvent::DeviceAssociated {
                    device: device.clone(),
                });
            }
        }
    }

    fn set_result(&mut self, result: PairResult) {
        self.result = result;
        self.observer.on_event(&SessionEvent::PairState { result });
    }

    /// Advertised names can arrive truncated, so the expected name must
    /// start with what was actually seen, not the other way around.
    fn name_matches(&self, name: &str) -> bool {
        let found = derive_short_code(name);
        let want = derive_short_code(&self.expected);
        !found.is_empty() && want.starts_with(&found)
    }

    pub fn on_event(&mut self, event: LinkEvent) {
        if self.stopped {
            return;
        }
        match event {
            LinkEvent::DeviceFound { name, address } => self.on_device_found(name, address),
            LinkEvent::ConnectionState { connected, status } => {
                if connected && status.is_success() {
                    self.on_connected();
                } else {
                    self.on_disconnected();
                }
            }
            LinkEvent::ServicesDiscovered { status } => {
                if !status.is_success() {
                    self.finish(PairResult::Error);
                    return;
                }
                self.on_discovered();
            }
            LinkEvent::BondChanged { name, state, .. } => {
                if self.phase == PairPhase::WaitingBond
                    && self.name_matches(&name)
                    && state == BondState::Bonded
                {
                    self.on_bonded();
                }
            }
            LinkEvent::Timer(id) => self.on_timer(id),
            // Utility notifications belong to the fetch session.
            _ => {}
        }
    }

    fn on_device_found(&mut self, name: String, address: String) {
        if self.phase != PairPhase::Scanning || !self.name_matches(&name) {
            return;
        }
        info!(name = %name, "expected device found");
        self.timers.cancel(TimerId::Scan);
        self.link.stop_scan();
        self.device = Some(DeviceInfo::new(name, address));
        self.set_result(PairResult::Found);

        self.connect_attempts = 0;
        self.connect();
    }

    fn connect(&mut self) {
        self.phase = PairPhase::Connecting;
        self.timers.arm(
            TimerId::Connect,
            Duration::from_millis(self.config.connect_timeout_ms),
        );
        if self.link.connect().is_err() {
            self.retry_connect();
        }
    }

    fn retry_connect(&mut self) {
        self.connect_attempts += 1;
        if self.connect_attempts > self.config.pair_retries {
            self.finish(PairResult::TimeoutConnect);
            return;
        }
        debug!(attempt = self.connect_attempts, "reconnecting after delay");
        self.link.disconnect();
        self.retry_wait = true;
        self.phase = PairPhase::Connecting;
        self.timers.arm(
            TimerId::Connect,
            Duration::from_millis(self.config.retry_delay_ms),
        );
    }

    fn on_connected(&mut self) {
        if self.phase != PairPhase::Connecting {
            return;
        }
        self.set_result(PairResult::Connected);

        // The Connect timer stays armed through discovery: a peripheral
        // that never reports its services must not hang the session.
        self.phase = PairPhase::Discovering;
        if self.link.discover_services().is_err() {
            self.finish(PairResult::Error);
        }
    }

    fn on_discovered(&mut self) {
        if self.phase != PairPhase::Discovering {
            return;
        }
        self.timers.cancel(TimerId::Connect);
        // The secure DFU service only exists on V2 hardware, which makes its
        // presence the generation probe.
        let hardware = if self.link.has_service(SECURE_DFU_SERVICE) {
            HardwareVersion::V2
        } else {
            HardwareVersion::V1
        };
        if let Some(device) = self.device.as_mut() {
            device.hardware = hardware;
        }
        debug!(%hardware, "hardware detected");

        if self.link.bond_state() == BondState::Bonded {
            // Nothing to do; report without ever requesting a bond.
            if let Some(device) = self.device.as_mut() {
                device.bonded = true;
            }
            if let Some(device) = &self.device {
                self.store.set_current(device.clone());
            }
            self.begin_disconnect(PairResult::AlreadyPaired);
            return;
        }

        // Let the platform finish its own security exchange before asking.
        self.phase = PairPhase::BondGrace;
        self.timers.arm(
            TimerId::Bond,
            Duration::from_millis(self.config.bond_grace_ms),
        );
    }

    fn request_bond(&mut self) {
        self.phase = PairPhase::WaitingBond;
        self.bond_checks = 0;
        if self.link.request_bond().is_err() {
            self.finish(PairResult::Error);
            return;
        }
        self.timers.arm(
            TimerId::PairCheck,
            Duration::from_millis(self.config.check_interval_ms),
        );
    }

    fn on_bonded(&mut self) {
        if let Some(device) = self.device.as_mut() {
            device.bonded = true;
        }
        if let Some(device) = &self.device {
            self.store.set_current(device.clone());
        }
        self.timers.cancel(TimerId::PairCheck);
        self.begin_disconnect(PairResult::Paired);
    }

    fn begin_disconnect(&mut self, result: PairResult) {
        self.pending_result = result;
        self.phase = PairPhase::Disconnecting;
        self.timers.arm(
            TimerId::DisconnectWait,
            Duration::from_millis(self.config.disconnect_wait_ms),
        );
        self.link.disconnect();
    }

    fn on_disconnect_settled(&mut self) {
        self.timers.cancel(TimerId::DisconnectWait);
        self.phase = PairPhase::Settling;
        self.timers.arm(
            TimerId::SignalResult,
            Duration::from_millis(self.config.result_settle_ms),
        );
    }

    fn on_disconnected(&mut self) {
        match self.phase {
            PairPhase::Connecting => {
                // Our own teardown during the retry delay confirms here.
                if !self.retry_wait {
                    self.retry_connect();
                }
            }
            PairPhase::Disconnecting => self.on_disconnect_settled(),
            PairPhase::Done | PairPhase::Settling => {}
            _ => {
                warn!(phase = ?self.phase, "connection lost mid-pairing");
                self.finish(PairResult::Error);
            }
        }
    }

    fn on_timer(&mut self, id: TimerId) {
        match id {
            TimerId::Scan => {
                if self.phase == PairPhase::Scanning {
                    self.finish(PairResult::TimeoutScan);
                }
            }
            TimerId::Connect => match self.phase {
                PairPhase::Connecting => {
                    if self.retry_wait {
                        // Retry delay elapsed; start the next attempt.
                        self.retry_wait = false;
                        self.connect();
                    } else {
                        self.retry_connect();
                    }
                }
                // Stalled discovery burns a retry like a failed connect.
                PairPhase::Discovering => self.retry_connect(),
                _ => {}
            },
            TimerId::Bond => {
                if self.phase == PairPhase::BondGrace {
                    self.request_bond();
                }
            }
            TimerId::PairCheck => {
                if self.phase != PairPhase::WaitingBond {
                    return;
                }
                if self.link.bond_state() == BondState::Bonded {
                    self.on_bonded();
                    return;
                }
                self.bond_checks += 1;
                if self.bond_checks >= self.config.pair_checks {
                    self.finish(PairResult::TimeoutPair);
                    return;
                }
                self.timers.arm(
                    TimerId::PairCheck,
                    Duration::from_millis(self.config.check_interval_ms),
                );
            }
            TimerId::DisconnectWait => {
                // The platform never confirmed the disconnect; proceed anyway.
                if self.phase == PairPhase::Disconnecting {
                    self.on_disconnect_settled();
                }
            }
            TimerId::SignalResult => {
                if self.phase == PairPhase::Settling {
                    let result = self.pending_result;
                    self.finish(result);
                }
            }
            _ => {}
        }
    }
}
