//! Scripted transport for exercising the session without a radio.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::core::bluetooth::catalog;
use crate::core::bluetooth::transport::{NotificationSink, SensorLink, SensorTransport};
use crate::core::bluetooth::types::{DiscoveredSensor, ScanFilter, TransmitterIdentity};
use crate::error::ConnectionError;

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct MockInner {
    advertising: Vec<String>,
    failing_connects: u32,
    hang_discovery: bool,
    hang_subscribe: bool,
    drop_on_write: bool,
    on_write: Vec<(Uuid, Vec<u8>)>,
    hidden: HashSet<Uuid>,
    link_id: u64,
    sink: Option<NotificationSink>,
    subscribed: HashSet<Uuid>,
    writes: Vec<(Uuid, Vec<u8>)>,
    last_connected: Option<TransmitterIdentity>,
    scans: usize,
    connects: usize,
    disconnects: usize,
}

/// Transport whose peripherals are scripted by the test.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockInner>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts advertising a peripheral with this name.
    pub fn advertise(&self, name: &str) {
        self.lock().advertising.push(name.to_string());
    }

    pub fn stop_advertising(&self) {
        self.lock().advertising.clear();
    }

    /// The next `count` connects fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.lock().failing_connects = count;
    }

    /// Discovery never completes while set.
    pub fn hang_discovery(&self, hang: bool) {
        self.lock().hang_discovery = hang;
    }

    /// Subscriptions never complete while set.
    pub fn hang_subscribe(&self, hang: bool) {
        self.lock().hang_subscribe = hang;
    }

    /// The next write loses the link instead of reaching the sensor.
    pub fn drop_link_on_next_write(&self) {
        self.lock().drop_on_write = true;
    }

    /// Queues a value the sensor pushes while the next write is in progress.
    pub fn notify_on_next_write(&self, characteristic: Uuid, bytes: Vec<u8>) {
        self.lock().on_write.push((characteristic, bytes));
    }

    /// Leaves `characteristic` out of discovery results.
    pub fn hide_endpoint(&self, characteristic: Uuid) {
        self.lock().hidden.insert(characteristic);
    }

    /// Pushes a value from a subscribed characteristic of the live link.
    /// Returns false if there is no such subscription.
    pub fn notify(&self, characteristic: Uuid, bytes: Vec<u8>) -> bool {
        let sink = {
            let inner = self.lock();
            if !inner.subscribed.contains(&characteristic) {
                return false;
            }
            inner.sink.clone()
        };
        sink.is_some_and(|sink| sink.deliver(characteristic, bytes))
    }

    /// Drops the live link as if the sensor went out of range.
    pub fn drop_link(&self) {
        let sink = {
            let mut inner = self.lock();
            inner.subscribed.clear();
            inner.sink.take()
        };
        if let Some(sink) = sink {
            sink.link_lost();
        }
    }

    pub fn is_linked(&self) -> bool {
        self.lock().sink.is_some()
    }

    pub fn subscribed(&self) -> HashSet<Uuid> {
        self.lock().subscribed.clone()
    }

    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.lock().writes.clone()
    }

    pub fn last_connected(&self) -> Option<TransmitterIdentity> {
        self.lock().last_connected.clone()
    }

    pub fn scan_count(&self) -> usize {
        self.lock().scans
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    pub fn disconnect_count(&self) -> usize {
        self.lock().disconnects
    }
}

#[async_trait]
impl SensorTransport for MockTransport {
    async fn scan(&self, filter: &ScanFilter) -> Result<DiscoveredSensor, ConnectionError> {
        self.lock().scans += 1;
        loop {
            let found = self
                .lock()
                .advertising
                .iter()
                .find(|name| filter.matches(name))
                .cloned();
            if let Some(name) = found {
                return Ok(DiscoveredSensor {
                    peripheral_id: format!("mock-{name}"),
                    identity: TransmitterIdentity::new(name),
                    rssi: Some(-60),
                });
            }
            tokio::time::sleep(SCAN_POLL_INTERVAL).await;
        }
    }

    async fn connect(
        &self,
        sensor: &DiscoveredSensor,
        sink: NotificationSink,
    ) -> Result<Box<dyn SensorLink>, ConnectionError> {
        let mut inner = self.lock();
        inner.connects += 1;
        if inner.failing_connects > 0 {
            inner.failing_connects -= 1;
            return Err(ConnectionError::Transport("simulated connect failure".into()));
        }
        inner.link_id += 1;
        inner.sink = Some(sink);
        inner.subscribed.clear();
        inner.last_connected = Some(sensor.identity.clone());
        Ok(Box::new(MockLink {
            id: inner.link_id,
            transport: self.clone(),
        }))
    }
}

struct MockLink {
    id: u64,
    transport: MockTransport,
}

impl MockLink {
    fn is_current(&self, inner: &MockInner) -> bool {
        inner.link_id == self.id && inner.sink.is_some()
    }
}

#[async_trait]
impl SensorLink for MockLink {
    async fn discover(&self, service: Uuid) -> Result<Vec<Uuid>, ConnectionError> {
        let hang = self.transport.lock().hang_discovery;
        if hang {
            std::future::pending::<()>().await;
        }
        let inner = self.transport.lock();
        Ok(catalog::endpoints_for(service)
            .into_iter()
            .map(|descriptor| descriptor.characteristic_id())
            .filter(|uuid| !inner.hidden.contains(uuid))
            .collect())
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<(), ConnectionError> {
        let hang = self.transport.lock().hang_subscribe;
        if hang {
            std::future::pending::<()>().await;
        }
        let mut inner = self.transport.lock();
        if !self.is_current(&inner) {
            return Err(ConnectionError::LinkLost);
        }
        inner.subscribed.insert(characteristic);
        Ok(())
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<(), ConnectionError> {
        let (sink, pushed) = {
            let mut inner = self.transport.lock();
            if !self.is_current(&inner) {
                return Err(ConnectionError::LinkLost);
            }
            if inner.drop_on_write {
                inner.drop_on_write = false;
                drop(inner);
                self.transport.drop_link();
                return Err(ConnectionError::LinkLost);
            }
            inner.writes.push((characteristic, data.to_vec()));
            let pushed = std::mem::take(&mut inner.on_write);
            (inner.sink.clone(), pushed)
        };
        if let Some(sink) = sink {
            for (source, bytes) in pushed {
                sink.deliver(source, bytes);
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ConnectionError> {
        let mut inner = self.transport.lock();
        inner.disconnects += 1;
        if self.is_current(&inner) {
            inner.sink = None;
            inner.subscribed.clear();
        }
        Ok(())
    }
}
