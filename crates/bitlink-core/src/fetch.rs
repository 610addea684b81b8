//! Log fetch session: connect, discover, subscribe, download, disconnect.
//!
//! Event-driven: the host delivers [`LinkEvent`]s on one scheduling context
//! and the session drives the GATT link and the download engine in response.
//! Every step is covered by either the connect timer or the inactivity work
//! timer, so a stalled peripheral always surfaces as a timeout result.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::FetchConfig;
use crate::events::{SessionEvent, SessionObserver};
use crate::protocol::constants::{SECURE_DFU_SERVICE, UTILITY_CONTROL, UTILITY_SERVICE};
use crate::protocol::{ControlWrite, DownloadEngine, ReplyOutcome};
use crate::timer::{TimerHost, TimerId};
use crate::transport::{BondState, GattLink, LinkError, LinkEvent};

/// Final (or latest) outcome of a fetch session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchResult {
    #[default]
    None,
    Connected,
    Discovered,
    /// The device is not bonded; bonding is a precondition, not something
    /// this session performs.
    NotBonded,
    /// Wrong hardware generation: the utility service needs newer hardware.
    V2Only,
    /// Right hardware, but the firmware lacks the utility feature.
    NoService,
    /// The device never became connectable.
    ConnectTimeout,
    /// The connection came up but a protocol step stalled.
    WorkTimeout,
    /// A GATT step failed or the connection dropped mid-session.
    Error,
    Success,
}

/// Where the session is in the GATT bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum GattState {
    #[default]
    Idle,
    Connecting,
    Discovering,
    /// Post-discovery grace, absorbing a possible service-changed push.
    Settling,
    Subscribing,
    Downloading,
    Done,
}

/// Routes engine writes to the utility control characteristic.
struct ControlPort<'a, L: GattLink>(&'a mut L);

impl<L: GattLink> ControlWrite for ControlPort<'_, L> {
    fn write_control(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        self.0.write(UTILITY_SERVICE, UTILITY_CONTROL, frame)
    }
}

pub struct FetchSession<L, T, O> {
    link: L,
    timers: T,
    observer: Arc<O>,
    config: FetchConfig,
    engine: DownloadEngine,
    state: GattState,
    result: FetchResult,
    connect_attempts: u32,
    /// Set while sitting out the inter-retry delay; the next Connect timer
    /// expiry starts the attempt instead of timing one out.
    retry_wait: bool,
    last_percent: u8,
    subscribed: bool,
    stopped: bool,
}

impl<L, T, O> FetchSession<L, T, O>
where
    L: GattLink,
    T: TimerHost,
    O: SessionObserver,
{
    pub fn new(link: L, timers: T, observer: Arc<O>, config: FetchConfig) -> Self {
        let mut engine = DownloadEngine::with_batch_factor(config.batch_factor);
        engine.set_format(crate::protocol::constants::FORMAT_HTML);
        Self {
            link,
            timers,
            observer,
            config,
            engine,
            state: GattState::Idle,
            result: FetchResult::None,
            connect_attempts: 0,
            retry_wait: false,
            last_percent: 0,
            subscribed: false,
            stopped: false,
        }
    }

    /// Log format to download (`FORMAT_*`). Must be set before `start`.
    pub fn set_format(&mut self, format: u8) {
        self.engine.set_format(format);
    }

    pub fn result(&self) -> FetchResult {
        self.result
    }

    pub fn is_finished(&self) -> bool {
        self.stopped
    }

    /// Begin the fetch by connecting to the associated device.
    pub fn start(&mut self) -> Result<(), LinkError> {
        self.connect_attempts = 0;
        self.connect()
    }

    fn connect(&mut self) -> Result<(), LinkError> {
        self.state = GattState::Connecting;
        self.timers.arm(
            TimerId::Connect,
            Duration::from_millis(self.config.connect_timeout_ms),
        );
        self.link.connect()
    }

    /// Tear the session down without a result change. Safe to call twice.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.state = GattState::Done;
        self.timers.cancel_all();
        if self.subscribed {
            self.subscribed = false;
            let _ = self
                .link
                .set_notify(UTILITY_SERVICE, UTILITY_CONTROL, false);
        }
        self.link.disconnect();
    }

    fn finish(&mut self, result: FetchResult) {
        self.result = result;
        info!(result = ?result, "fetch finished");
        self.stop();
        self.observer.on_event(&SessionEvent::FetchState { result });
    }

    fn touch_work_timer(&mut self) {
        self.timers.arm(
            TimerId::Work,
            Duration::from_millis(self.config.work_timeout_ms),
        );
    }

    pub fn on_event(&mut self, event: LinkEvent) {
        if self.stopped {
            return;
        }
        match event {
            LinkEvent::ConnectionState { connected, status } => {
                if connected && status.is_success() {
                    self.on_connected();
                } else {
                    self.on_disconnected();
                }
            }
            LinkEvent::ServicesDiscovered { status } => {
                if !status.is_success() {
                    self.finish(FetchResult::Error);
                    return;
                }
                self.on_discovered();
            }
            LinkEvent::NotifyEnabled { status } => {
                if !status.is_success() {
                    self.finish(FetchResult::Error);
                    return;
                }
                // Give the peripheral a moment before the first request; some
                // firmware drops writes arriving right behind the CCC write.
                self.state = GattState::Subscribing;
                self.timers.arm(
                    TimerId::Subscribe,
                    Duration::from_millis(self.config.subscribe_settle_ms),
                );
                self.touch_work_timer();
            }
            LinkEvent::WriteConfirmed { status } => {
                if !status.is_success() {
                    warn!("control write rejected");
                    self.finish(FetchResult::Error);
                    return;
                }
                self.touch_work_timer();
            }
            LinkEvent::Notification {
                service,
                characteristic,
                value,
            } => {
                if service == UTILITY_SERVICE && characteristic == UTILITY_CONTROL {
                    self.on_reply(&value);
                }
            }
            LinkEvent::Timer(id) => self.on_timer(id),
            // Bond broadcasts and scan results belong to the pairing session.
            LinkEvent::BondChanged { .. } | LinkEvent::DeviceFound { .. } => {}
        }
    }

    fn on_connected(&mut self) {
        self.timers.cancel(TimerId::Connect);

        // Bonding is a precondition, not something this session performs;
        // the utility service refuses unbonded readers.
        if self.link.bond_state() != BondState::Bonded {
            warn!("fetch refused: device not bonded");
            self.finish(FetchResult::NotBonded);
            return;
        }

        self.result = FetchResult::Connected;
        self.observer.on_event(&SessionEvent::FetchState {
            result: FetchResult::Connected,
        });

        self.state = GattState::Discovering;
        self.touch_work_timer();
        if self.link.discover_services().is_err() {
            self.finish(FetchResult::Error);
        }
    }

    fn on_disconnected(&mut self) {
        match self.state {
            GattState::Connecting => {
                // Our own teardown during the retry delay confirms here.
                if self.retry_wait {
                    return;
                }
                // An unbonded device refuses the connection outright; that
                // is a pairing problem, not an unreachable device.
                if self.link.bond_state() != BondState::Bonded {
                    warn!("connect failed on unbonded device");
                    self.finish(FetchResult::NotBonded);
                    return;
                }
                // A drop while connecting counts against the retry budget.
                self.retry_connect();
            }
            GattState::Done => {}
            _ => {
                warn!(state = ?self.state, "connection lost mid-fetch");
                self.finish(FetchResult::Error);
            }
        }
    }

    fn retry_connect(&mut self) {
        self.connect_attempts += 1;
        if self.connect_attempts > self.config.connect_retries {
            self.finish(FetchResult::ConnectTimeout);
            return;
        }
        debug!(attempt = self.connect_attempts, "reconnecting after delay");
        self.link.disconnect();
        self.retry_wait = true;
        self.state = GattState::Connecting;
        self.timers.arm(
            TimerId::Connect,
            Duration::from_millis(self.config.retry_delay_ms),
        );
    }

    fn on_discovered(&mut self) {
        self.result = FetchResult::Discovered;
        self.observer.on_event(&SessionEvent::FetchState {
            result: FetchResult::Discovered,
        });

        // Bonded peers may push a service-changed indication right after
        // discovery; touching the GATT table during it loses the exchange.
        self.state = GattState::Settling;
        self.timers.arm(
            TimerId::Discover,
            Duration::from_millis(self.config.discover_grace_ms),
        );
        self.touch_work_timer();
    }

    fn subscribe(&mut self) {
        if !self.link.has_characteristic(UTILITY_SERVICE, UTILITY_CONTROL) {
            // Tell "wrong hardware generation" apart from "firmware lacks
            // the feature" via the version probe service.
            if !self.link.has_service(SECURE_DFU_SERVICE) {
                warn!("utility service absent on V1 hardware");
                self.finish(FetchResult::V2Only);
            } else {
                warn!("firmware lacks the utility service");
                self.finish(FetchResult::NoService);
            }
            return;
        }
        if self
            .link
            .set_notify(UTILITY_SERVICE, UTILITY_CONTROL, true)
            .is_err()
        {
            self.finish(FetchResult::Error);
            return;
        }
        self.subscribed = true;
        self.touch_work_timer();
    }

    fn begin_download(&mut self) {
        self.state = GattState::Downloading;
        let mut port = ControlPort(&mut self.link);
        if let Err(err) = self.engine.start(&mut port) {
            warn!(error = %err, "download start failed");
            self.finish(FetchResult::Error);
            return;
        }
        self.touch_work_timer();
    }

    fn on_reply(&mut self, reply: &[u8]) {
        if self.state != GattState::Downloading {
            return;
        }
        let mut port = ControlPort(&mut self.link);
        match self.engine.on_reply(reply, &mut port) {
            Ok(ReplyOutcome::Ignored) => {}
            Ok(ReplyOutcome::Progress) => {
                self.touch_work_timer();
                let percent = (self.engine.progress() * 100.0) as u8;
                if percent != self.last_percent {
                    self.last_percent = percent;
                    self.observer
                        .on_event(&SessionEvent::FetchProgress { percent });
                }
            }
            Ok(ReplyOutcome::NoData) => {
                self.observer.on_event(&SessionEvent::FetchData {
                    format: self.engine.format(),
                    data: Vec::new(),
                });
                self.finish(FetchResult::Success);
            }
            Ok(ReplyOutcome::Finished) => {
                let data = self.engine.data().unwrap_or_default().to_vec();
                self.observer.on_event(&SessionEvent::FetchProgress { percent: 100 });
                self.observer.on_event(&SessionEvent::FetchData {
                    format: self.engine.format(),
                    data,
                });
                self.finish(FetchResult::Success);
            }
            Err(err) => {
                warn!(error = %err, "download failed");
                self.finish(FetchResult::Error);
            }
        }
    }

    fn on_timer(&mut self, id: TimerId) {
        match id {
            TimerId::Connect => {
                if self.state != GattState::Connecting {
                    return;
                }
                if self.retry_wait {
                    // Retry delay elapsed; start the next attempt.
                    self.retry_wait = false;
                    if self.connect().is_err() {
                        self.finish(FetchResult::ConnectTimeout);
                    }
                } else {
                    self.retry_connect();
                }
            }
            TimerId::Discover => {
                if self.state == GattState::Settling {
                    self.subscribe();
                }
            }
            TimerId::Subscribe => {
                if self.state == GattState::Subscribing {
                    self.begin_download();
                }
            }
            TimerId::Work => {
                warn!(state = ?self.state, "fetch stalled");
                self.finish(FetchResult::WorkTimeout);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::protocol::constants::REPLY_PAYLOAD_MAX;
    use crate::transport::{GattStatus, MockLink, MockTimers};

    /// Captures every emitted event for inspection.
    #[derive(Default)]
    struct Capture {
        events: Mutex<Vec<SessionEvent>>,
    }

    impl SessionObserver for Capture {
        fn on_event(&self, event: &SessionEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    impl Capture {
        fn fetched_data(&self) -> Option<Vec<u8>> {
            self.events.lock().unwrap().iter().find_map(|e| match e {
                SessionEvent::FetchData { data, .. } => Some(data.clone()),
                _ => None,
            })
        }
    }

    fn bonded_link() -> MockLink {
        let link = MockLink::with_gatt(
            &[UTILITY_SERVICE],
            &[(UTILITY_SERVICE, UTILITY_CONTROL)],
        );
        link.set_bond_state(BondState::Bonded);
        link
    }

    fn session(
        link: &MockLink,
        timers: &MockTimers,
    ) -> (FetchSession<MockLink, MockTimers, Capture>, Arc<Capture>) {
        let observer = Arc::new(Capture::default());
        let session = FetchSession::new(
            link.clone(),
            timers.clone(),
            observer.clone(),
            FetchConfig::default(),
        );
        (session, observer)
    }

    /// Drives the GATT bring-up to the point where the length query is out.
    fn bring_up(session: &mut FetchSession<MockLink, MockTimers, Capture>) {
        session.start().unwrap();
        session.on_event(LinkEvent::ConnectionState {
            connected: true,
            status: GattStatus::Success,
        });
        session.on_event(LinkEvent::ServicesDiscovered {
            status: GattStatus::Success,
        });
        session.on_event(LinkEvent::Timer(TimerId::Discover));
        session.on_event(LinkEvent::NotifyEnabled {
            status: GattStatus::Success,
        });
        session.on_event(LinkEvent::Timer(TimerId::Subscribe));
    }

    fn last_job(link: &MockLink) -> u8 {
        link.writes().last().expect("no control write").2[0] & 0xF0
    }

    fn notify(value: Vec<u8>) -> LinkEvent {
        LinkEvent::Notification {
            service: UTILITY_SERVICE,
            characteristic: UTILITY_CONTROL,
            value,
        }
    }

    #[test]
    fn test_unbonded_device_is_refused_after_connect() {
        let link = MockLink::new();
        let timers = MockTimers::new();
        let (mut session, _) = session(&link, &timers);

        session.start().unwrap();
        session.on_event(LinkEvent::ConnectionState {
            connected: true,
            status: GattStatus::Success,
        });
        assert_eq!(session.result(), FetchResult::NotBonded);
        assert!(!link.is_connected());
        assert!(timers.pending().is_empty());
    }

    #[test]
    fn test_successful_download_end_to_end() {
        let link = bonded_link();
        let timers = MockTimers::new();
        let (mut session, observer) = session(&link, &timers);

        bring_up(&mut session);
        // CCC was written before the first request.
        assert_eq!(link.notify_log(), vec![(UTILITY_SERVICE, UTILITY_CONTROL, true)]);

        // Length reply: 30 bytes, fits in one batch.
        let mut reply = vec![last_job(&link)];
        reply.extend_from_slice(&30u32.to_le_bytes());
        session.on_event(notify(reply));

        let job = last_job(&link);
        let mut sent = 0u8;
        for seq in 0..2u8 {
            let n = (30 - sent as usize).min(REPLY_PAYLOAD_MAX);
            let mut reply = vec![job | seq];
            reply.extend((0..n).map(|i| sent + i as u8));
            session.on_event(notify(reply));
            sent += n as u8;
        }

        assert_eq!(session.result(), FetchResult::Success);
        assert!(!link.is_connected());
        // Teardown disabled notifications again.
        assert_eq!(link.notify_log().last().unwrap().2, false);
        let data = observer.fetched_data().unwrap();
        assert_eq!(data, (0..30).collect::<Vec<u8>>());
    }

    #[test]
    fn test_zero_length_log_succeeds_with_empty_data() {
        let link = bonded_link();
        let timers = MockTimers::new();
        let (mut session, observer) = session(&link, &timers);

        bring_up(&mut session);
        let mut reply = vec![last_job(&link)];
        reply.extend_from_slice(&0u32.to_le_bytes());
        session.on_event(notify(reply));

        assert_eq!(session.result(), FetchResult::Success);
        assert_eq!(observer.fetched_data().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_connect_timeout_retries_then_gives_up() {
        let link = bonded_link();
        let timers = MockTimers::new();
        let (mut session, _) = session(&link, &timers);
        let config = FetchConfig::default();

        session.start().unwrap();
        assert_eq!(
            timers.armed_duration(TimerId::Connect),
            Some(Duration::from_millis(config.connect_timeout_ms))
        );

        // First expiry burns the single default retry and sits out the
        // inter-retry delay before reconnecting.
        session.on_event(LinkEvent::Timer(TimerId::Connect));
        assert_eq!(session.result(), FetchResult::None);
        assert!(!link.is_connected());
        assert_eq!(
            timers.armed_duration(TimerId::Connect),
            Some(Duration::from_millis(config.retry_delay_ms))
        );

        // Delay elapsed: the retry attempt goes out with a fresh timeout.
        session.on_event(LinkEvent::Timer(TimerId::Connect));
        assert!(link.is_connected());
        assert_eq!(
            timers.armed_duration(TimerId::Connect),
            Some(Duration::from_millis(config.connect_timeout_ms))
        );

        session.on_event(LinkEvent::Timer(TimerId::Connect));
        assert_eq!(session.result(), FetchResult::ConnectTimeout);
        assert!(!link.is_connected());
    }

    #[test]
    fn test_connect_failure_on_unbonded_device_reports_not_bonded() {
        let link = MockLink::new();
        let timers = MockTimers::new();
        let (mut session, _) = session(&link, &timers);

        session.start().unwrap();
        session.on_event(LinkEvent::ConnectionState {
            connected: false,
            status: GattStatus::Error(133),
        });

        assert_eq!(session.result(), FetchResult::NotBonded);
        assert!(!link.is_connected());
        assert!(timers.pending().is_empty());
    }

    #[test]
    fn test_work_timeout_mid_download() {
        let link = bonded_link();
        let timers = MockTimers::new();
        let (mut session, _) = session(&link, &timers);

        bring_up(&mut session);
        session.on_event(LinkEvent::Timer(TimerId::Work));
        assert_eq!(session.result(), FetchResult::WorkTimeout);
        assert!(!link.is_connected());
    }

    fn discover_against(link: &MockLink) -> FetchResult {
        link.set_bond_state(BondState::Bonded);
        let timers = MockTimers::new();
        let (mut session, _) = session(link, &timers);

        session.start().unwrap();
        session.on_event(LinkEvent::ConnectionState {
            connected: true,
            status: GattStatus::Success,
        });
        session.on_event(LinkEvent::ServicesDiscovered {
            status: GattStatus::Success,
        });
        session.on_event(LinkEvent::Timer(TimerId::Discover));
        session.result()
    }

    #[test]
    fn test_missing_service_on_old_hardware_is_v2only() {
        // No utility control and no DFU service: a V1 device.
        let link = MockLink::new();
        assert_eq!(discover_against(&link), FetchResult::V2Only);
    }

    #[test]
    fn test_missing_service_on_v2_hardware_is_noservice() {
        use crate::protocol::constants::SECURE_DFU_SERVICE;
        let link = MockLink::with_gatt(&[SECURE_DFU_SERVICE], &[]);
        assert_eq!(discover_against(&link), FetchResult::NoService);
    }

    #[test]
    fn test_disconnect_mid_download_is_an_error() {
        let link = bonded_link();
        let timers = MockTimers::new();
        let (mut session, _) = session(&link, &timers);

        bring_up(&mut session);
        session.on_event(LinkEvent::ConnectionState {
            connected: false,
            status: GattStatus::Error(8),
        });
        assert_eq!(session.result(), FetchResult::Error);
    }

    #[test]
    fn test_stop_is_idempotent_and_releases_everything() {
        let link = bonded_link();
        let timers = MockTimers::new();
        let (mut session, _) = session(&link, &timers);

        bring_up(&mut session);
        session.stop();
        session.stop();
        assert!(!link.is_connected());
        assert!(timers.pending().is_empty());

        // Late events after stop are inert.
        session.on_event(LinkEvent::Timer(TimerId::Work));
        assert_eq!(session.result(), FetchResult::Discovered);
    }
}
