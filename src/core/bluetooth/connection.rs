//! Bluetooth connection handling for the G7 transmitter
//! This module runs one connection attempt (scan, connect, discover,
//! subscribe, setup) and provides the `bluest` implementation of the
//! transport.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bluest::{Adapter, Characteristic, ConnectionEvent, Device};
use futures_util::StreamExt;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::catalog;
use crate::core::bluetooth::commands::{CommandExecutor, CommandSender};
use crate::core::bluetooth::constants::UUID_CGM_SERVICE;
use crate::core::bluetooth::notification::NotificationHandler;
use crate::core::bluetooth::scanner::BluetoothScanner;
use crate::core::bluetooth::transport::{NotificationSink, SensorLink, SensorTransport};
use crate::core::bluetooth::types::{ConnectionStatus, DiscoveredSensor, ScanFilter};
use crate::core::messages::OutgoingCommand;
use crate::error::{ConnectionError, ConnectionStage};

/// Upper bound for each stage of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub scan: Duration,
    pub connect: Duration,
    pub discovery: Duration,
    pub subscribe: Duration,
    pub write: Duration,
}

/// Exponential reconnect delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub multiplier: u32,
    pub max: Duration,
}

impl Backoff {
    /// Delay after `failures` consecutive failed attempts.
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(failures);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Everything one attempt needs, fixed when it starts.
#[derive(Debug, Clone)]
pub(crate) struct AttemptPlan {
    pub filter: ScanFilter,
    pub timeouts: Timeouts,
    pub setup: Vec<OutgoingCommand>,
}

/// A link that finished setup.
pub(crate) struct EstablishedLink {
    pub link: Box<dyn SensorLink>,
    pub sensor: DiscoveredSensor,
}

/// Runs `future` unless it outlives `limit` or `token` is cancelled.
pub(crate) async fn bounded<F, T>(
    token: &CancellationToken,
    stage: ConnectionStage,
    limit: Duration,
    future: F,
) -> Result<T, ConnectionError>
where
    F: Future<Output = Result<T, ConnectionError>>,
{
    tokio::select! {
        _ = token.cancelled() => Err(ConnectionError::Cancelled),
        result = tokio::time::timeout(limit, future) => match result {
            Ok(inner) => inner,
            Err(_) => Err(ConnectionError::Timeout { stage, timeout: limit }),
        },
    }
}

/// One connection attempt. `report` receives the intermediate statuses.
/// On failure after connecting, the link is released before returning.
pub(crate) async fn establish(
    transport: &dyn SensorTransport,
    plan: &AttemptPlan,
    sink: NotificationSink,
    token: &CancellationToken,
    report: impl Fn(ConnectionStatus),
) -> Result<EstablishedLink, ConnectionError> {
    let timeouts = plan.timeouts;
    let sensor = bounded(token, ConnectionStage::Scan, timeouts.scan, transport.scan(&plan.filter)).await?;
    info!("Found sensor {} ({})", sensor.identity, sensor.peripheral_id);

    report(ConnectionStatus::Connecting);
    let link = bounded(
        token,
        ConnectionStage::Connect,
        timeouts.connect,
        transport.connect(&sensor, sink),
    )
    .await?;

    report(ConnectionStatus::Discovering);
    match prepare(link.as_ref(), plan, token).await {
        Ok(()) => {
            info!("Connection and setup process completed successfully");
            Ok(EstablishedLink { link, sensor })
        }
        Err(e) => {
            release(link.as_ref(), timeouts.write).await;
            Err(e)
        }
    }
}

/// Discovery, subscription and setup commands on a fresh link.
async fn prepare(
    link: &dyn SensorLink,
    plan: &AttemptPlan,
    token: &CancellationToken,
) -> Result<(), ConnectionError> {
    let timeouts = plan.timeouts;
    info!("Connection successful, discovering services...");
    let present = bounded(
        token,
        ConnectionStage::Discovery,
        timeouts.discovery,
        link.discover(UUID_CGM_SERVICE),
    )
    .await?;

    for descriptor in catalog::endpoints_for(UUID_CGM_SERVICE) {
        if !present.contains(&descriptor.characteristic_id()) {
            return Err(ConnectionError::MissingEndpoint {
                service: descriptor.service_id(),
                endpoint: descriptor.characteristic_id(),
            });
        }
    }

    info!("Setting up notifications...");
    for descriptor in catalog::subscribable(UUID_CGM_SERVICE) {
        let characteristic = descriptor.characteristic_id();
        bounded(
            token,
            ConnectionStage::Subscribe,
            timeouts.subscribe,
            link.subscribe(characteristic),
        )
        .await?;
        debug!("Subscribed to {:?}", descriptor.endpoint);
    }

    let executor = CommandExecutor::new(LinkCommandSender {
        link,
        timeout: timeouts.write,
        token,
    });
    match executor.initialize_session(&plan.setup).await {
        Err(e @ (ConnectionError::Cancelled | ConnectionError::LinkLost)) => Err(e),
        Err(e) => {
            warn!("Session setup incomplete: {}", e);
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}

/// Disconnects, logging instead of failing.
pub(crate) async fn release(link: &dyn SensorLink, limit: Duration) {
    match tokio::time::timeout(limit, link.disconnect()).await {
        Ok(Ok(())) => info!("Successfully disconnected"),
        Ok(Err(e)) => warn!("Failed to disconnect cleanly: {}", e),
        Err(_) => warn!("Disconnect did not complete within {:?}", limit),
    }
}

/// Writes commands to the endpoint each one belongs to.
struct LinkCommandSender<'a> {
    link: &'a dyn SensorLink,
    timeout: Duration,
    token: &'a CancellationToken,
}

#[async_trait]
impl CommandSender for LinkCommandSender<'_> {
    async fn send_command(&self, command: OutgoingCommand) -> Result<(), ConnectionError> {
        let data = command.to_bytes();
        let characteristic = command.endpoint().uuid();
        bounded(
            self.token,
            ConnectionStage::Write,
            self.timeout,
            self.link.write(characteristic, &data),
        )
        .await
    }
}

/// `bluest` implementation of the transport.
#[derive(Clone)]
pub struct BluestTransport {
    adapter: Adapter,
    scanner: BluetoothScanner,
}

impl BluestTransport {
    /// Uses the default adapter once it reports itself available.
    pub async fn new(min_rssi_threshold: i16) -> Result<Self, ConnectionError> {
        let adapter = Adapter::default()
            .await
            .ok_or(ConnectionError::AdapterUnavailable)?;
        adapter.wait_available().await?;
        info!("Bluetooth adapter is available");
        Ok(Self::with_adapter(adapter, min_rssi_threshold))
    }

    pub fn with_adapter(adapter: Adapter, min_rssi_threshold: i16) -> Self {
        let scanner = BluetoothScanner::new(adapter.clone(), min_rssi_threshold);
        Self { adapter, scanner }
    }
}

#[async_trait]
impl SensorTransport for BluestTransport {
    async fn scan(&self, filter: &ScanFilter) -> Result<DiscoveredSensor, ConnectionError> {
        self.scanner.find(filter).await
    }

    async fn connect(
        &self,
        sensor: &DiscoveredSensor,
        sink: NotificationSink,
    ) -> Result<Box<dyn SensorLink>, ConnectionError> {
        let device = self
            .scanner
            .device(&sensor.peripheral_id)
            .ok_or_else(|| ConnectionError::UnknownPeripheral(sensor.peripheral_id.clone()))?;

        if !device.is_connected().await {
            info!("Initiating connection to {}...", sensor.peripheral_id);
            self.adapter.connect_device(&device).await?;
        }

        let token = CancellationToken::new();
        watch_connection(self.adapter.clone(), device.clone(), sink.clone(), token.clone());

        Ok(Box::new(BluestLink {
            adapter: self.adapter.clone(),
            device,
            sink,
            characteristics: Mutex::new(HashMap::new()),
            token,
        }))
    }
}

/// Reports the link as lost when the adapter sees the device disconnect.
fn watch_connection(adapter: Adapter, device: Device, sink: NotificationSink, token: CancellationToken) {
    tokio::spawn(async move {
        let mut events = match adapter.device_connection_events(&device).await {
            Ok(events) => events,
            Err(e) => {
                warn!("Cannot watch connection events for {}: {}", device.id(), e);
                return;
            }
        };
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = events.next() => match event {
                    Some(ConnectionEvent::Disconnected) | None => {
                        info!("Device {} disconnected", device.id());
                        sink.link_lost();
                        break;
                    }
                    Some(ConnectionEvent::Connected) => debug!("Device {} connected", device.id()),
                }
            }
        }
    });
}

/// An open `bluest` connection.
pub struct BluestLink {
    adapter: Adapter,
    device: Device,
    sink: NotificationSink,
    characteristics: Mutex<HashMap<Uuid, Characteristic>>,
    token: CancellationToken,
}

impl BluestLink {
    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, ConnectionError> {
        self.characteristics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&uuid)
            .cloned()
            .ok_or_else(|| ConnectionError::MissingEndpoint {
                service: catalog::lookup(uuid)
                    .map(|descriptor| descriptor.service_id())
                    .unwrap_or_default(),
                endpoint: uuid,
            })
    }
}

#[async_trait]
impl SensorLink for BluestLink {
    async fn discover(&self, service: Uuid) -> Result<Vec<Uuid>, ConnectionError> {
        let services = self.device.services().await?;
        let Some(found) = services.into_iter().find(|s| s.uuid() == service) else {
            warn!("Service {} not found on {}", service, self.device.id());
            return Ok(Vec::new());
        };
        info!("Found service: {}", found.uuid());

        let characteristics = found.characteristics().await?;
        let mut known = self
            .characteristics
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut uuids = Vec::with_capacity(characteristics.len());
        for characteristic in characteristics {
            let uuid = characteristic.uuid();
            debug!("Found characteristic: {}", uuid);
            uuids.push(uuid);
            known.insert(uuid, characteristic);
        }
        Ok(uuids)
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<(), ConnectionError> {
        let characteristic = self.characteristic(characteristic)?;
        NotificationHandler::subscribe(characteristic, self.sink.clone(), self.token.child_token()).await
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<(), ConnectionError> {
        let characteristic = self.characteristic(characteristic)?;
        characteristic.write(data).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ConnectionError> {
        self.token.cancel();
        if self.device.is_connected().await {
            info!("Disconnecting from device {}", self.device.id());
            self.adapter.disconnect_device(&self.device).await?;
        } else {
            info!("Device {} not connected", self.device.id());
        }
        Ok(())
    }
}

impl Drop for BluestLink {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_then_caps() {
        let backoff = Backoff {
            initial: Duration::from_secs(1),
            multiplier: 2,
            max: Duration::from_secs(10),
        };
        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_secs(2));
        assert_eq!(backoff.delay(3), Duration::from_secs(8));
        assert_eq!(backoff.delay(4), Duration::from_secs(10));
        assert_eq!(backoff.delay(60), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_reports_the_stage_that_timed_out() {
        let token = CancellationToken::new();
        let result: Result<(), _> = bounded(
            &token,
            ConnectionStage::Discovery,
            Duration::from_secs(5),
            std::future::pending(),
        )
        .await;
        assert_eq!(
            result,
            Err(ConnectionError::Timeout {
                stage: ConnectionStage::Discovery,
                timeout: Duration::from_secs(5),
            })
        );
    }

    #[tokio::test]
    async fn bounded_stops_on_cancel() {
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<(), _> = bounded(
            &token,
            ConnectionStage::Scan,
            Duration::from_secs(5),
            std::future::pending(),
        )
        .await;
        assert_eq!(result, Err(ConnectionError::Cancelled));
    }
}
