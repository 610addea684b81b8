//! Mock platform capabilities for testing the session state machines.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use super::traits::{BondState, GattLink, LinkError, Scanner};
use crate::timer::{TimerHost, TimerId};

#[derive(Default)]
struct LinkInner {
    connected: bool,
    /// Connections currently held open; tracks leaks across restarts.
    open_connections: usize,
    max_open_connections: usize,
    bond: BondState,
    services: Vec<Uuid>,
    characteristics: Vec<(Uuid, Uuid)>,
    /// Captured characteristic writes.
    writes: Vec<(Uuid, Uuid, Vec<u8>)>,
    /// Captured CCC changes.
    notify_log: Vec<(Uuid, Uuid, bool)>,
    bond_requests: usize,
    scanning: bool,
    scan_starts: usize,
    fail_connect: bool,
}

/// Mock GATT link + scanner. Clones share state, so a test can hand one
/// handle to the session and keep another for inspection.
#[derive(Clone, Default)]
pub struct MockLink {
    inner: Arc<Mutex<LinkInner>>,
}

impl MockLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A link whose device already exposes the given services and
    /// characteristics after discovery.
    pub fn with_gatt(services: &[Uuid], characteristics: &[(Uuid, Uuid)]) -> Self {
        let link = Self::new();
        {
            let mut inner = link.inner.lock().unwrap();
            inner.services = services.to_vec();
            inner.characteristics = characteristics.to_vec();
        }
        link
    }

    pub fn set_bond_state(&self, bond: BondState) {
        self.inner.lock().unwrap().bond = bond;
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.inner.lock().unwrap().fail_connect = fail;
    }

    pub fn writes(&self) -> Vec<(Uuid, Uuid, Vec<u8>)> {
        self.inner.lock().unwrap().writes.clone()
    }

    pub fn notify_log(&self) -> Vec<(Uuid, Uuid, bool)> {
        self.inner.lock().unwrap().notify_log.clone()
    }

    pub fn bond_requests(&self) -> usize {
        self.inner.lock().unwrap().bond_requests
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().connected
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.lock().unwrap().scanning
    }

    pub fn scan_starts(&self) -> usize {
        self.inner.lock().unwrap().scan_starts
    }

    pub fn open_connections(&self) -> usize {
        self.inner.lock().unwrap().open_connections
    }

    /// Most connections ever open at once.
    pub fn max_open_connections(&self) -> usize {
        self.inner.lock().unwrap().max_open_connections
    }
}

impl GattLink for MockLink {
    fn connect(&mut self) -> Result<(), LinkError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_connect {
            return Err(LinkError::ConnectFailed("mock".into()));
        }
        inner.connected = true;
        inner.open_connections += 1;
        inner.max_open_connections = inner.max_open_connections.max(inner.open_connections);
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.connected {
            inner.connected = false;
            inner.open_connections -= 1;
        }
    }

    fn discover_services(&mut self) -> Result<(), LinkError> {
        if !self.inner.lock().unwrap().connected {
            return Err(LinkError::NotConnected);
        }
        Ok(())
    }

    fn has_service(&self, service: Uuid) -> bool {
        self.inner.lock().unwrap().services.contains(&service)
    }

    fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool {
        self.inner
            .lock()
            .unwrap()
            .characteristics
            .contains(&(service, characteristic))
    }

    fn set_notify(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        enable: bool,
    ) -> Result<(), LinkError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.connected {
            return Err(LinkError::NotConnected);
        }
        inner.notify_log.push((service, characteristic, enable));
        Ok(())
    }

    fn write(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), LinkError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.connected {
            return Err(LinkError::NotConnected);
        }
        if !inner.characteristics.contains(&(service, characteristic)) {
            return Err(LinkError::NoCharacteristic { service, characteristic });
        }
        inner.writes.push((service, characteristic, data.to_vec()));
        Ok(())
    }

    fn bond_state(&self) -> BondState {
        self.inner.lock().unwrap().bond
    }

    fn request_bond(&mut self) -> Result<(), LinkError> {
        let mut inner = self.inner.lock().unwrap();
        inner.bond_requests += 1;
        inner.bond = BondState::Bonding;
        Ok(())
    }
}

impl Scanner for MockLink {
    fn start_scan(&mut self) -> Result<(), LinkError> {
        let mut inner = self.inner.lock().unwrap();
        inner.scanning = true;
        inner.scan_starts += 1;
        Ok(())
    }

    fn stop_scan(&mut self) {
        self.inner.lock().unwrap().scanning = false;
    }
}

/// Records armed timers instead of scheduling them; tests fire them by
/// feeding `LinkEvent::Timer` to the session.
#[derive(Clone, Default)]
pub struct MockTimers {
    pending: Arc<Mutex<Vec<(TimerId, Duration)>>>,
}

impl MockTimers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_armed(&self, id: TimerId) -> bool {
        self.pending.lock().unwrap().iter().any(|(p, _)| *p == id)
    }

    pub fn armed_duration(&self, id: TimerId) -> Option<Duration> {
        self.pending
            .lock()
            .unwrap()
            .iter()
            .find(|(p, _)| *p == id)
            .map(|(_, d)| *d)
    }

    pub fn pending(&self) -> Vec<TimerId> {
        self.pending.lock().unwrap().iter().map(|(p, _)| *p).collect()
    }
}

impl TimerHost for MockTimers {
    fn arm(&mut self, id: TimerId, after: Duration) {
        let mut pending = self.pending.lock().unwrap();
        pending.retain(|(p, _)| *p != id);
        pending.push((id, after));
    }

    fn cancel(&mut self, id: TimerId) {
        self.pending.lock().unwrap().retain(|(p, _)| *p != id);
    }

    fn cancel_all(&mut self) {
        self.pending.lock().unwrap().clear();
    }
}
