//! Session manager for one G7 transmitter
//! A single task owns the snapshot, the connection status and the live link.
//! Commands, attempt progress and link traffic arrive on one queue and are
//! handled one at a time. Every attempt carries a generation number; traffic
//! from an older generation is discarded.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, error, info, warn};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::config::SessionConfig;
use crate::core::bluetooth::catalog::Endpoint;
use crate::core::bluetooth::commands;
use crate::core::bluetooth::connection::{self, AttemptPlan, EstablishedLink};
use crate::core::bluetooth::observer::{ObserverRegistry, SensorEvent, StateObserver, SubscriptionId};
use crate::core::bluetooth::transport::{NotificationSink, SensorLink, SensorTransport};
use crate::core::bluetooth::types::{
    BindPolicy, ConnectionStatus, RawNotification, ScanFilter, TransmitterIdentity,
};
use crate::core::codec;
use crate::core::manager_state::ManagerState;
use crate::core::messages::{DecodedMessage, GlucoseMessage, SensorFault};
use crate::core::sensor::{self, LifecycleStatus, SensorTimings};
use crate::error::{CodecError, ConnectionError, LifecycleError, SessionError};

/// Notifications kept while an attempt is still writing its setup commands.
const MAX_EARLY_NOTIFICATIONS: usize = 32;

/// Everything the session task reacts to.
pub(crate) enum SessionCommand {
    Scan {
        reply: oneshot::Sender<ConnectionStatus>,
    },
    Pair {
        identity: TransmitterIdentity,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Delete {
        reply: oneshot::Sender<()>,
    },
    Attempt {
        generation: u64,
        progress: AttemptProgress,
    },
    Retry {
        generation: u64,
    },
    Notification {
        generation: u64,
        notification: RawNotification,
    },
    LinkLost {
        generation: u64,
    },
}

pub(crate) enum AttemptProgress {
    Status(ConnectionStatus),
    Ready(EstablishedLink),
    Failed(ConnectionError),
}

/// The operations a host application needs from a CGM session.
#[async_trait]
pub trait CgmManager: Send + Sync {
    /// Starts looking for the sensor. Returns the status after the request.
    async fn scan_for_new_sensor(&self) -> Result<ConnectionStatus, SessionError>;

    /// Forgets the sensor and releases the link.
    async fn delete_sensor(&self) -> Result<(), SessionError>;

    fn state(&self) -> ManagerState;

    fn connection_status(&self) -> ConnectionStatus;

    fn lifecycle(&self, now: DateTime<Utc>) -> LifecycleStatus;

    fn add_state_observer(&self, observer: Arc<dyn StateObserver>, context: &Handle) -> SubscriptionId;

    fn remove_observer(&self, id: SubscriptionId) -> bool;
}

struct Shared {
    commands: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Receiver<ManagerState>,
    status: watch::Receiver<ConnectionStatus>,
    observers: Arc<ObserverRegistry>,
    timings: SensorTimings,
    shutdown: CancellationToken,
    actor: Mutex<Option<JoinHandle<()>>>,
    _guard: DropGuard,
}

/// Handle to a running session. Clones share the session; dropping the last
/// one stops it.
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

impl SessionManager {
    /// Starts the session task on the current runtime. A stored identity is
    /// reconnected straight away unless the sensor has failed.
    pub fn spawn<T: SensorTransport>(
        transport: T,
        config: SessionConfig,
        timings: SensorTimings,
        initial: ManagerState,
    ) -> Self {
        Self::launch(transport, config, timings, initial, ObserverRegistry::default())
    }

    /// Like `spawn`, plus a subscription that sees every event from the
    /// first one, including those of the reconnect on start.
    pub fn spawn_with_events<T: SensorTransport>(
        transport: T,
        config: SessionConfig,
        timings: SensorTimings,
        initial: ManagerState,
    ) -> (Self, SubscriptionId, mpsc::UnboundedReceiver<SensorEvent>) {
        let observers = ObserverRegistry::default();
        let (id, events) = observers.subscribe();
        (Self::launch(transport, config, timings, initial, observers), id, events)
    }

    fn launch<T: SensorTransport>(
        transport: T,
        config: SessionConfig,
        timings: SensorTimings,
        initial: ManagerState,
        observers: ObserverRegistry,
    ) -> Self {
        let (commands, queue) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(initial.clone());
        let (status_tx, status) = watch::channel(ConnectionStatus::Disconnected);
        let observers = Arc::new(observers);
        let shutdown = CancellationToken::new();

        let actor = SessionActor {
            transport: Arc::new(transport),
            config,
            state: initial,
            status: ConnectionStatus::Disconnected,
            state_tx,
            status_tx,
            observers: Arc::clone(&observers),
            commands: commands.clone(),
            shutdown: shutdown.clone(),
            generation: 0,
            failures: 0,
            pending: None,
            link: None,
            early: Vec::new(),
        };
        let handle = tokio::spawn(actor.run(queue));

        Self {
            shared: Arc::new(Shared {
                commands,
                state,
                status,
                observers,
                timings,
                _guard: shutdown.clone().drop_guard(),
                shutdown,
                actor: Mutex::new(Some(handle)),
            }),
        }
    }

    async fn request<R>(
        &self,
        command: impl FnOnce(oneshot::Sender<R>) -> SessionCommand,
    ) -> Result<R, SessionError> {
        let (reply, response) = oneshot::channel();
        self.shared
            .commands
            .send(command(reply))
            .map_err(|_| SessionError::Stopped)?;
        response.await.map_err(|_| SessionError::Stopped)
    }

    /// Starts looking for the sensor. While a search or link is already
    /// active this only replays the current status to observers.
    pub async fn scan_for_new_sensor(&self) -> Result<ConnectionStatus, SessionError> {
        self.request(|reply| SessionCommand::Scan { reply }).await
    }

    /// Stores `identity` before any contact, so only that transmitter is
    /// accepted.
    pub async fn pair_sensor(&self, identity: TransmitterIdentity) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Pair { identity, reply })
            .await?
    }

    /// Pairs `identity` unless it is already stored, then connects to it.
    pub async fn connect(&self, identity: TransmitterIdentity) -> Result<ConnectionStatus, SessionError> {
        self.pair_sensor(identity).await?;
        self.scan_for_new_sensor().await
    }

    /// Cancels any attempt or retry, releases the link and clears the snapshot.
    pub async fn delete_sensor(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Delete { reply }).await
    }

    /// Stops the session and waits for the link to be released.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let actor = self
            .shared
            .actor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(actor) = actor {
            if let Err(e) = actor.await {
                error!("Sensor session task failed: {}", e);
            }
        }
    }

    pub fn state(&self) -> ManagerState {
        self.shared.state.borrow().clone()
    }

    /// Receiver that always holds the latest snapshot.
    pub fn watch_state(&self) -> watch::Receiver<ManagerState> {
        self.shared.state.clone()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    pub fn is_scanning(&self) -> bool {
        self.connection_status().is_scanning()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_status().is_connected()
    }

    pub fn sensor_name(&self) -> Option<String> {
        self.shared
            .state
            .borrow()
            .sensor_id
            .as_ref()
            .map(ToString::to_string)
    }

    pub fn timings(&self) -> SensorTimings {
        self.shared.timings
    }

    pub fn lifecycle(&self, now: DateTime<Utc>) -> LifecycleStatus {
        sensor::lifecycle(&self.shared.state.borrow(), now, &self.shared.timings)
    }

    pub fn subscribe(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<SensorEvent>) {
        self.shared.observers.subscribe()
    }

    pub fn add_state_observer(&self, observer: Arc<dyn StateObserver>, context: &Handle) -> SubscriptionId {
        self.shared.observers.attach(observer, context)
    }

    pub fn remove_observer(&self, id: SubscriptionId) -> bool {
        self.shared.observers.unsubscribe(id)
    }
}

#[async_trait]
impl CgmManager for SessionManager {
    async fn scan_for_new_sensor(&self) -> Result<ConnectionStatus, SessionError> {
        SessionManager::scan_for_new_sensor(self).await
    }

    async fn delete_sensor(&self) -> Result<(), SessionError> {
        SessionManager::delete_sensor(self).await
    }

    fn state(&self) -> ManagerState {
        SessionManager::state(self)
    }

    fn connection_status(&self) -> ConnectionStatus {
        SessionManager::connection_status(self)
    }

    fn lifecycle(&self, now: DateTime<Utc>) -> LifecycleStatus {
        SessionManager::lifecycle(self, now)
    }

    fn add_state_observer(&self, observer: Arc<dyn StateObserver>, context: &Handle) -> SubscriptionId {
        SessionManager::add_state_observer(self, observer, context)
    }

    fn remove_observer(&self, id: SubscriptionId) -> bool {
        SessionManager::remove_observer(self, id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    Attempt,
    Retry,
}

/// The in-flight attempt or the armed retry timer.
struct Pending {
    kind: PendingKind,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct SessionActor {
    transport: Arc<dyn SensorTransport>,
    config: SessionConfig,
    state: ManagerState,
    status: ConnectionStatus,
    state_tx: watch::Sender<ManagerState>,
    status_tx: watch::Sender<ConnectionStatus>,
    observers: Arc<ObserverRegistry>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    shutdown: CancellationToken,
    generation: u64,
    /// Consecutive failed attempts.
    failures: u32,
    pending: Option<Pending>,
    link: Option<Box<dyn SensorLink>>,
    /// Current-generation notifications that arrived before the link was ready.
    early: Vec<RawNotification>,
}

impl SessionActor {
    async fn run(mut self, mut queue: mpsc::UnboundedReceiver<SessionCommand>) {
        info!("Sensor session started");
        if let Some(identity) = &self.state.sensor_id {
            if self.state.is_failed() {
                warn!("Sensor {} has failed; not reconnecting", identity);
            } else {
                info!("Reconnecting to stored sensor {}", identity);
                self.start_attempt();
            }
        }

        let shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = queue.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
            }
        }

        self.teardown().await;
        queue.close();
        let released = release_unclaimed(&mut queue, self.config.timeouts().write).await;
        if released > 0 {
            debug!("Released {} link(s) that finished after shutdown", released);
        }
        info!("Sensor session stopped");
    }

    async fn handle(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Scan { reply } => {
                let status = self.scan_for_new_sensor();
                let _ = reply.send(status);
            }
            SessionCommand::Pair { identity, reply } => {
                let _ = reply.send(self.pair(identity));
            }
            SessionCommand::Delete { reply } => {
                self.delete().await;
                let _ = reply.send(());
            }
            SessionCommand::Attempt { generation, progress } => self.on_attempt(generation, progress),
            SessionCommand::Retry { generation } => {
                if generation == self.generation && self.link.is_none() {
                    self.pending = None;
                    self.start_attempt();
                }
            }
            SessionCommand::Notification {
                generation,
                notification,
            } => self.on_link_notification(generation, notification),
            SessionCommand::LinkLost { generation } => self.on_link_lost(generation),
        }
    }

    fn scan_for_new_sensor(&mut self) -> ConnectionStatus {
        let refusal = if self.link.is_some() || self.attempt_in_flight() {
            Some("a search or link is already active")
        } else if self.state.is_failed() {
            Some("the sensor has failed and must be deleted first")
        } else if self.state.sensor_id.is_none() && self.config.bind_policy == BindPolicy::RequireStored {
            Some("no sensor is paired")
        } else {
            None
        };

        match refusal {
            Some(reason) => {
                if self.link.is_some() || self.attempt_in_flight() {
                    debug!("Scan requested while {:?}: {}", self.status, reason);
                } else {
                    warn!("Not scanning: {}", reason);
                }
                self.observers.broadcast(SensorEvent::StatusReplayed(self.status));
            }
            None => self.start_attempt(),
        }
        self.status
    }

    fn pair(&mut self, identity: TransmitterIdentity) -> Result<(), SessionError> {
        if let Some(existing) = &self.state.sensor_id {
            if *existing != identity {
                warn!("Refusing to pair {}: already paired with {}", identity, existing);
                return Err(SessionError::AlreadyPaired(existing.to_string()));
            }
            return Ok(());
        }

        info!("Paired with sensor {}", identity);
        self.state.sensor_id = Some(identity);
        self.publish_state();
        if self.attempt_in_flight() {
            // the running attempt still accepts any sensor
            self.start_attempt();
        }
        Ok(())
    }

    fn scan_filter(&self) -> ScanFilter {
        match &self.state.sensor_id {
            Some(identity) => ScanFilter::Identity(identity.clone()),
            None => ScanFilter::AnySensor,
        }
    }

    fn attempt_in_flight(&self) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|pending| pending.kind == PendingKind::Attempt)
    }

    /// Moves to a new generation. Traffic tagged with an older one is ignored.
    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.early.clear();
        self.generation
    }

    fn start_attempt(&mut self) {
        self.cancel_pending();
        let generation = self.next_generation();

        let plan = AttemptPlan {
            filter: self.scan_filter(),
            timeouts: self.config.timeouts(),
            setup: commands::setup_commands(&self.config, &self.state, Utc::now()),
        };
        let sink = NotificationSink::new(self.commands.clone(), generation);
        let queue = self.commands.clone();
        let transport = Arc::clone(&self.transport);
        let token = self.shutdown.child_token();
        let attempt_token = token.clone();

        info!("Starting connection attempt {} ({:?})", generation, plan.filter);
        let handle = tokio::spawn(async move {
            let report = |status| {
                let _ = queue.send(SessionCommand::Attempt {
                    generation,
                    progress: AttemptProgress::Status(status),
                });
            };
            let result = connection::establish(transport.as_ref(), &plan, sink, &attempt_token, report).await;
            let progress = match result {
                Ok(established) => AttemptProgress::Ready(established),
                Err(e) => AttemptProgress::Failed(e),
            };
            let sent = queue.send(SessionCommand::Attempt { generation, progress });
            if let Err(mpsc::error::SendError(SessionCommand::Attempt {
                progress: AttemptProgress::Ready(established),
                ..
            })) = sent
            {
                debug!("Session stopped before attempt {} finished", generation);
                connection::release(established.link.as_ref(), plan.timeouts.write).await;
            }
        });

        self.pending = Some(Pending {
            kind: PendingKind::Attempt,
            token,
            handle,
        });
        self.set_attempt_status(ConnectionStatus::Scanning);
    }

    fn schedule_retry(&mut self) {
        self.cancel_pending();
        let delay = self.config.backoff().delay(self.failures);
        let unreachable = self.failures > 0 && self.failures >= self.config.max_retries;
        if unreachable && self.status != ConnectionStatus::Unreachable {
            error!(
                "Sensor unreachable after {} failed attempts; retrying every {:?}",
                self.failures,
                self.config.backoff().max
            );
        }
        self.set_status(if unreachable {
            ConnectionStatus::Unreachable
        } else {
            ConnectionStatus::Disconnected
        });

        let generation = self.next_generation();
        let queue = self.commands.clone();
        let token = self.shutdown.child_token();
        let timer_token = token.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = timer_token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = queue.send(SessionCommand::Retry { generation });
                }
            }
        });

        info!("Retrying connection in {:?}", delay);
        self.pending = Some(Pending {
            kind: PendingKind::Retry,
            token,
            handle,
        });
    }

    /// Cancels the pending attempt or timer without waiting for it.
    fn cancel_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.token.cancel();
        }
    }

    /// Cancels the pending attempt or timer and waits until it has finished.
    async fn stop_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.token.cancel();
            if let Err(e) = pending.handle.await {
                error!("Connection task failed: {}", e);
            }
        }
    }

    fn on_attempt(&mut self, generation: u64, progress: AttemptProgress) {
        if generation != self.generation {
            if let AttemptProgress::Ready(established) = progress {
                debug!("Releasing link from superseded attempt {}", generation);
                self.release_link(established.link);
            }
            return;
        }

        match progress {
            AttemptProgress::Status(status) => self.set_attempt_status(status),
            AttemptProgress::Ready(established) => self.on_connected(established),
            AttemptProgress::Failed(error) => self.on_attempt_failed(error),
        }
    }

    fn on_connected(&mut self, established: EstablishedLink) {
        let EstablishedLink { link, sensor } = established;
        self.pending = None;
        self.failures = 0;

        if self.state.sensor_id.is_none() {
            info!("Binding to sensor {} on first contact", sensor.identity);
            self.state.sensor_id = Some(sensor.identity.clone());
            self.observers.broadcast(SensorEvent::SensorBound(sensor.identity.clone()));
        }
        self.state.last_connect = Some(Utc::now());
        self.link = Some(link);

        info!("Connected to sensor {}", sensor.identity);
        self.publish_state();
        self.set_status(ConnectionStatus::Ready);

        let early = std::mem::take(&mut self.early);
        if !early.is_empty() {
            debug!("Handling {} notification(s) received during setup", early.len());
        }
        for notification in early {
            // a fault in an earlier one drops the link
            if self.link.is_none() {
                break;
            }
            self.on_notification(notification);
        }
    }

    fn on_attempt_failed(&mut self, error: ConnectionError) {
        self.pending = None;
        if error == ConnectionError::Cancelled {
            return;
        }
        self.failures = self.failures.saturating_add(1);
        warn!("Connection attempt failed ({} in a row): {}", self.failures, error);
        self.observers.broadcast(SensorEvent::ConnectionError(error));
        self.schedule_retry();
    }

    fn on_link_lost(&mut self, generation: u64) {
        if generation != self.generation {
            return;
        }
        if let Some(link) = self.link.take() {
            warn!("Link to sensor lost");
            self.release_link(link);
            self.observers
                .broadcast(SensorEvent::ConnectionError(ConnectionError::LinkLost));
            self.schedule_retry();
        } else if self.attempt_in_flight() {
            warn!("Link to sensor lost during setup");
            // the attempt releases its link once cancelled
            self.cancel_pending();
            self.on_attempt_failed(ConnectionError::LinkLost);
        }
    }

    fn on_link_notification(&mut self, generation: u64, notification: RawNotification) {
        if generation != self.generation {
            debug!("Dropping notification from a previous link");
        } else if self.link.is_some() {
            self.on_notification(notification);
        } else if !self.attempt_in_flight() {
            debug!("Dropping notification without a link");
        } else if self.early.len() < MAX_EARLY_NOTIFICATIONS {
            self.early.push(notification);
        } else {
            warn!("Dropping notification: too many received during setup");
        }
    }

    fn on_notification(&mut self, notification: RawNotification) {
        let Some(endpoint) = Endpoint::from_uuid(notification.characteristic) else {
            debug!(
                "Ignoring notification from unknown characteristic {}",
                notification.characteristic
            );
            return;
        };

        match codec::decode(endpoint, &notification.bytes) {
            Ok(message) => self.on_message(message, notification.received_at),
            Err(error) => {
                warn!("Dropping notification: {}", error);
                let CodecError::Malformed { endpoint, len, .. } = error;
                self.observers
                    .broadcast(SensorEvent::MalformedData { endpoint, len });
            }
        }
    }

    fn on_message(&mut self, message: DecodedMessage, received_at: DateTime<Utc>) {
        if let Some(fault) = message.response_fault() {
            self.record_fault(fault, received_at);
            self.publish_state();
            return;
        }

        match message {
            DecodedMessage::Glucose(reading) => self.on_glucose(reading, received_at),
            DecodedMessage::Backfill(record) => {
                debug!("Backfill record {} at {}", record.sequence, record.timestamp);
                self.observers.broadcast(SensorEvent::BackfillReceived(record));
            }
            DecodedMessage::AuthChallenge(_) => debug!("Received authentication challenge"),
            DecodedMessage::AuthStatus(status) => info!(
                "Authentication status: authenticated={}, bonded={}",
                status.authenticated, status.bonded
            ),
            DecodedMessage::TimeSync(response) => info!(
                "Time sync {:?}, sensor time {}s",
                response.status, response.sensor_time
            ),
            DecodedMessage::BackfillComplete(response) => info!(
                "Backfill {:?} with {} records",
                response.status, response.record_count
            ),
            DecodedMessage::ManufacturerName(name) => info!("Manufacturer: {}", name),
            DecodedMessage::Unrecognized {
                endpoint,
                opcode,
                version,
                body,
            } => debug!(
                "Unrecognized message {:#04x} v{} on {:?} ({} bytes)",
                opcode,
                version,
                endpoint,
                body.len()
            ),
        }
    }

    fn on_glucose(&mut self, reading: GlucoseMessage, received_at: DateTime<Utc>) {
        let duplicate = self.state.latest_reading.as_ref().is_some_and(|latest| {
            latest.sequence == reading.sequence && latest.message_timestamp == reading.message_timestamp
        });
        if duplicate {
            debug!("Ignoring repeated reading {}", reading.sequence);
            return;
        }

        if self.state.activated_at.is_none() {
            let activated_at = received_at - TimeDelta::seconds(i64::from(reading.message_timestamp));
            info!("Sensor activated at {}", activated_at);
            self.state.activated_at = Some(activated_at);
        }

        debug!(
            "Reading {}: {:?}, trend {:?}",
            reading.sequence, reading.glucose, reading.trend
        );
        self.state.latest_reading = Some(reading);
        self.state.latest_reading_received_at = Some(received_at);
        if let Some(fault) = reading.fault() {
            self.record_fault(fault, received_at);
        }
        self.publish_state();
        self.observers.broadcast(SensorEvent::ReadingReceived(reading));
    }

    /// Latches the failure and drops the link. Only `delete` clears it.
    fn record_fault(&mut self, fault: SensorFault, at: DateTime<Utc>) {
        if self.state.failed_at.is_some() {
            return;
        }
        error!("Sensor failed: {}", fault);
        self.state.failed_at = Some(at);
        self.observers
            .broadcast(SensorEvent::SensorFailed(LifecycleError::Fault(fault)));

        self.next_generation();
        self.cancel_pending();
        if let Some(link) = self.link.take() {
            self.release_link(link);
        }
        self.set_status(ConnectionStatus::Disconnected);
    }

    async fn delete(&mut self) {
        match &self.state.sensor_id {
            Some(identity) => info!("Deleting sensor {}", identity),
            None => info!("Resetting sensor session"),
        }
        self.release_all().await;
        self.failures = 0;
        self.state = ManagerState::default();
        self.publish_state();
        self.set_status(ConnectionStatus::Disconnected);
    }

    async fn teardown(&mut self) {
        self.release_all().await;
        self.set_status(ConnectionStatus::Disconnected);
    }

    async fn release_all(&mut self) {
        self.next_generation();
        self.stop_pending().await;
        if let Some(link) = self.link.take() {
            connection::release(link.as_ref(), self.config.timeouts().write).await;
        }
    }

    fn release_link(&self, link: Box<dyn SensorLink>) {
        let limit = self.config.timeouts().write;
        tokio::spawn(async move {
            connection::release(link.as_ref(), limit).await;
        });
    }

    /// Statuses reported by a running attempt. Suppressed while unreachable so
    /// observers only see the next real change.
    fn set_attempt_status(&mut self, status: ConnectionStatus) {
        if self.status == ConnectionStatus::Unreachable {
            debug!("Still unreachable, attempt is {:?}", status);
            return;
        }
        self.set_status(status);
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if status == self.status {
            return;
        }
        info!("Connection status: {:?} -> {:?}", self.status, status);
        self.status = status;
        self.status_tx.send_replace(status);
        self.observers.broadcast(SensorEvent::StatusChanged(status));
    }

    fn publish_state(&self) {
        self.state_tx.send_replace(self.state.clone());
        self.observers
            .broadcast(SensorEvent::StateUpdated(self.state.clone()));
    }
}

/// Releases links from attempts that finished after the session stopped.
async fn release_unclaimed(queue: &mut mpsc::UnboundedReceiver<SessionCommand>, limit: Duration) -> usize {
    let mut released = 0;
    while let Ok(command) = queue.try_recv() {
        if let SessionCommand::Attempt {
            progress: AttemptProgress::Ready(established),
            ..
        } = command
        {
            connection::release(established.link.as_ref(), limit).await;
            released += 1;
        }
    }
    released
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::core::bluetooth::constants::{
        UUID_AUTHENTICATION_CHAR, UUID_BACKFILL_CHAR, UUID_COMMUNICATION_CHAR, UUID_CONTROL_CHAR,
    };
    use crate::core::bluetooth::mock::MockTransport;
    use crate::core::bluetooth::types::DiscoveredSensor;
    use crate::core::codec::{self, OPCODE_AUTH_REQUEST, OPCODE_TIME_SYNC_RESPONSE};
    use crate::core::messages::{
        AlgorithmState, Concentration, GlucoseValue, SensorState, StatusFlags, TrendRate,
    };
    use crate::core::sensor::LifecycleState;
    use crate::error::ConnectionStage;

    type Events = mpsc::UnboundedReceiver<SensorEvent>;

    fn config() -> SessionConfig {
        SessionConfig::default()
    }

    fn reading(sequence: u16, message_timestamp: u32) -> GlucoseMessage {
        GlucoseMessage {
            sequence,
            message_timestamp,
            age: 2,
            algorithm_state: AlgorithmState::Known(SensorState::Ok),
            glucose: GlucoseValue::Measured(Concentration::from_tenths(1234).unwrap()),
            trend: TrendRate::from_tenths(-3),
            predicted: None,
            flags: StatusFlags::default(),
        }
    }

    fn start(mock: &MockTransport, config: SessionConfig, initial: ManagerState) -> (SessionManager, Events) {
        let (manager, _, events) =
            SessionManager::spawn_with_events(mock.clone(), config, SensorTimings::default(), initial);
        (manager, events)
    }

    async fn next_event(events: &mut Events) -> SensorEvent {
        tokio::time::timeout(Duration::from_secs(3600), events.recv())
            .await
            .expect("no event within an hour")
            .expect("event channel closed")
    }

    /// Collects events up to and including the first one matching `last`.
    async fn collect_until(events: &mut Events, last: impl Fn(&SensorEvent) -> bool) -> Vec<SensorEvent> {
        let mut seen = Vec::new();
        loop {
            let event = next_event(events).await;
            let done = last(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    fn statuses(events: &[SensorEvent]) -> Vec<ConnectionStatus> {
        events
            .iter()
            .filter_map(|event| match event {
                SensorEvent::StatusChanged(status) => Some(*status),
                _ => None,
            })
            .collect()
    }

    fn is_ready(event: &SensorEvent) -> bool {
        *event == SensorEvent::StatusChanged(ConnectionStatus::Ready)
    }

    async fn connected() -> (MockTransport, SessionManager, Events) {
        let mock = MockTransport::new();
        mock.advertise("DXCMA1");
        let (manager, mut events) = start(&mock, config(), ManagerState::default());
        manager.scan_for_new_sensor().await.unwrap();
        collect_until(&mut events, is_ready).await;
        (mock, manager, events)
    }

    #[tokio::test(start_paused = true)]
    async fn scanning_twice_starts_one_search() {
        let mock = MockTransport::new();
        let (manager, mut events) = start(&mock, config(), ManagerState::default());

        assert_eq!(manager.scan_for_new_sensor().await, Ok(ConnectionStatus::Scanning));
        assert_eq!(manager.scan_for_new_sensor().await, Ok(ConnectionStatus::Scanning));

        assert_eq!(
            next_event(&mut events).await,
            SensorEvent::StatusChanged(ConnectionStatus::Scanning)
        );
        assert_eq!(
            next_event(&mut events).await,
            SensorEvent::StatusReplayed(ConnectionStatus::Scanning)
        );
        assert!(events.try_recv().is_err());
        assert!(manager.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn first_contact_binds_and_sets_up_the_link() {
        let mock = MockTransport::new();
        mock.advertise("Other device");
        mock.advertise("DXCMA1");
        let (manager, mut events) = start(&mock, config(), ManagerState::default());

        manager.scan_for_new_sensor().await.unwrap();
        let seen = collect_until(&mut events, is_ready).await;

        assert_eq!(
            statuses(&seen),
            vec![
                ConnectionStatus::Scanning,
                ConnectionStatus::Connecting,
                ConnectionStatus::Discovering,
                ConnectionStatus::Ready,
            ]
        );
        assert!(seen.contains(&SensorEvent::SensorBound(TransmitterIdentity::new("DXCMA1"))));

        let state = manager.state();
        assert_eq!(state.sensor_id, Some(TransmitterIdentity::new("DXCMA1")));
        assert!(state.last_connect.is_some());
        assert_eq!(manager.sensor_name().as_deref(), Some("DXCMA1"));
        assert!(manager.is_connected());

        let subscribed = mock.subscribed();
        for characteristic in [
            UUID_COMMUNICATION_CHAR,
            UUID_CONTROL_CHAR,
            UUID_AUTHENTICATION_CHAR,
            UUID_BACKFILL_CHAR,
        ] {
            assert!(subscribed.contains(&characteristic));
        }

        let writes = mock.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, UUID_AUTHENTICATION_CHAR);
        assert_eq!(writes[0].1[0], OPCODE_AUTH_REQUEST);
    }

    #[tokio::test(start_paused = true)]
    async fn bound_identity_is_kept() {
        let (mock, manager, mut events) = connected().await;
        mock.drop_link();
        mock.stop_advertising();
        mock.advertise("DXCMB2");
        mock.advertise("DXCMA1");

        collect_until(&mut events, is_ready).await;
        assert_eq!(mock.last_connected(), Some(TransmitterIdentity::new("DXCMA1")));
        assert_eq!(manager.state().sensor_id, Some(TransmitterIdentity::new("DXCMA1")));
    }

    #[tokio::test(start_paused = true)]
    async fn stored_identity_reconnects_on_start() {
        let mock = MockTransport::new();
        mock.advertise("DXCMB2");
        mock.advertise("DXCMA1");
        let initial = ManagerState {
            sensor_id: Some(TransmitterIdentity::new("DXCMA1")),
            ..ManagerState::default()
        };
        let (manager, mut events) = start(&mock, config(), initial);

        let seen = collect_until(&mut events, is_ready).await;
        assert!(!seen.iter().any(|e| matches!(e, SensorEvent::SensorBound(_))));
        assert_eq!(mock.last_connected(), Some(TransmitterIdentity::new("DXCMA1")));
        assert_eq!(
            manager.scan_for_new_sensor().await,
            Ok(ConnectionStatus::Ready)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unpaired_session_waits_for_pairing_when_required() {
        let mock = MockTransport::new();
        mock.advertise("DXCMA1");
        let config = SessionConfig {
            bind_policy: BindPolicy::RequireStored,
            ..config()
        };
        let (manager, mut events) = start(&mock, config, ManagerState::default());

        assert_eq!(
            manager.scan_for_new_sensor().await,
            Ok(ConnectionStatus::Disconnected)
        );
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(mock.scan_count(), 0);

        manager
            .pair_sensor(TransmitterIdentity::new("DXCMA1"))
            .await
            .unwrap();
        assert_eq!(
            manager
                .pair_sensor(TransmitterIdentity::new("DXCMB2"))
                .await,
            Err(SessionError::AlreadyPaired("DXCMA1".into()))
        );

        manager.scan_for_new_sensor().await.unwrap();
        let seen = collect_until(&mut events, is_ready).await;
        assert!(!seen.iter().any(|e| matches!(e, SensorEvent::SensorBound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_targets_one_identity() {
        let mock = MockTransport::new();
        mock.advertise("DXCMB2");
        mock.advertise("DXCMA1");
        let (manager, mut events) = start(&mock, config(), ManagerState::default());

        let status = manager.connect(TransmitterIdentity::new("DXCMA1")).await;
        assert_eq!(status, Ok(ConnectionStatus::Scanning));
        collect_until(&mut events, is_ready).await;
        assert_eq!(mock.last_connected(), Some(TransmitterIdentity::new("DXCMA1")));

        assert_eq!(
            manager.connect(TransmitterIdentity::new("DXCMB2")).await,
            Err(SessionError::AlreadyPaired("DXCMA1".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_notification_is_dropped() {
        let (mock, manager, mut events) = connected().await;

        assert!(mock.notify(UUID_COMMUNICATION_CHAR, vec![0x4e]));
        let seen = collect_until(&mut events, |e| matches!(e, SensorEvent::MalformedData { .. })).await;
        assert_eq!(
            seen.last(),
            Some(&SensorEvent::MalformedData {
                endpoint: Endpoint::Communication,
                len: 1,
            })
        );
        assert_eq!(manager.state().latest_reading, None);
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn first_reading_infers_activation() {
        let (mock, manager, mut events) = connected().await;
        let first = reading(1, 3_600);

        assert!(mock.notify(UUID_COMMUNICATION_CHAR, first.to_bytes()));
        collect_until(&mut events, |e| *e == SensorEvent::ReadingReceived(first)).await;

        let state = manager.state();
        assert_eq!(state.latest_reading, Some(first));
        let received_at = state.latest_reading_received_at.unwrap();
        assert_eq!(state.activated_at, Some(received_at - TimeDelta::hours(1)));
        assert_eq!(
            manager.lifecycle(received_at).state,
            LifecycleState::Ok
        );

        // activation is only inferred once
        let second = reading(2, 3_900);
        assert!(mock.notify(UUID_CONTROL_CHAR, second.to_bytes()));
        collect_until(&mut events, |e| *e == SensorEvent::ReadingReceived(second)).await;
        assert_eq!(manager.state().activated_at, state.activated_at);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_readings_are_ignored() {
        let (mock, manager, mut events) = connected().await;
        let first = reading(7, 600);
        let next = reading(8, 900);

        mock.notify(UUID_COMMUNICATION_CHAR, first.to_bytes());
        mock.notify(UUID_COMMUNICATION_CHAR, first.to_bytes());
        mock.notify(UUID_COMMUNICATION_CHAR, next.to_bytes());
        let seen = collect_until(&mut events, |e| *e == SensorEvent::ReadingReceived(next)).await;

        let readings = seen
            .iter()
            .filter(|e| matches!(e, SensorEvent::ReadingReceived(_)))
            .count();
        assert_eq!(readings, 2);
        assert_eq!(manager.state().latest_reading, Some(next));
    }

    #[tokio::test(start_paused = true)]
    async fn link_loss_reconnects_and_keeps_readings() {
        let (mock, manager, mut events) = connected().await;
        let latest = reading(3, 1_200);
        mock.notify(UUID_COMMUNICATION_CHAR, latest.to_bytes());
        collect_until(&mut events, |e| *e == SensorEvent::ReadingReceived(latest)).await;
        let before = manager.state();

        mock.drop_link();
        let seen = collect_until(&mut events, is_ready).await;

        let changes = statuses(&seen);
        let count = |status| changes.iter().filter(|s| **s == status).count();
        assert_eq!(changes.first(), Some(&ConnectionStatus::Disconnected));
        assert_eq!(count(ConnectionStatus::Disconnected), 1);
        assert_eq!(count(ConnectionStatus::Ready), 1);
        assert!(seen.contains(&SensorEvent::ConnectionError(ConnectionError::LinkLost)));

        let after = manager.state();
        assert_eq!(after.activated_at, before.activated_at);
        assert_eq!(after.latest_reading, before.latest_reading);
        assert_eq!(after.latest_reading_received_at, before.latest_reading_received_at);
        assert!(after.last_connect >= before.last_connect);
        assert_eq!(mock.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn link_loss_during_setup_is_retried() {
        let mock = MockTransport::new();
        mock.advertise("DXCMA1");
        mock.drop_link_on_next_write();
        let (manager, mut events) = start(&mock, config(), ManagerState::default());

        manager.scan_for_new_sensor().await.unwrap();
        let seen = collect_until(&mut events, is_ready).await;

        use ConnectionStatus::*;
        assert_eq!(
            statuses(&seen),
            vec![
                Scanning, Connecting, Discovering, Disconnected,
                Scanning, Connecting, Discovering, Ready,
            ]
        );
        let lost = seen
            .iter()
            .filter(|e| **e == SensorEvent::ConnectionError(ConnectionError::LinkLost))
            .count();
        assert_eq!(lost, 1);
        assert_eq!(mock.connect_count(), 2);
        assert!(mock.is_linked());
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn reading_during_setup_is_kept() {
        let mock = MockTransport::new();
        mock.advertise("DXCMA1");
        let first = reading(5, 1_800);
        mock.notify_on_next_write(UUID_COMMUNICATION_CHAR, first.to_bytes());
        let (manager, mut events) = start(&mock, config(), ManagerState::default());

        manager.scan_for_new_sensor().await.unwrap();
        let seen = collect_until(&mut events, |e| *e == SensorEvent::ReadingReceived(first)).await;

        let bound = seen.iter().position(|e| matches!(e, SensorEvent::SensorBound(_)));
        let ready = seen.iter().position(is_ready);
        assert!(bound.is_some() && ready.is_some());
        assert!(bound < ready);

        let state = manager.state();
        assert_eq!(state.latest_reading, Some(first));
        assert!(state.activated_at.is_some());
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn fault_response_during_setup_latches_failure() {
        let mock = MockTransport::new();
        mock.advertise("DXCMA1");
        let fault = codec::seal_frame(OPCODE_TIME_SYNC_RESPONSE, &[0xff, 0, 0, 0, 0]);
        mock.notify_on_next_write(UUID_CONTROL_CHAR, fault);
        let (manager, mut events) = start(&mock, config(), ManagerState::default());

        manager.scan_for_new_sensor().await.unwrap();
        collect_until(&mut events, |e| matches!(e, SensorEvent::SensorFailed(_))).await;
        tokio::time::sleep(Duration::from_secs(600)).await;

        assert!(manager.state().failed_at.is_some());
        assert_eq!(manager.lifecycle(Utc::now()).state, LifecycleState::Failed);
        assert_eq!(manager.connection_status(), ConnectionStatus::Disconnected);
        assert!(!mock.is_linked());
        assert_eq!(mock.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unrecognized_frame_keeps_the_session() {
        let (mock, manager, mut events) = connected().await;
        let after = reading(9, 2_400);

        assert!(mock.notify(UUID_COMMUNICATION_CHAR, codec::seal_frame(0x7b, &[1, 2, 3])));
        assert!(mock.notify(UUID_COMMUNICATION_CHAR, after.to_bytes()));
        let seen = collect_until(&mut events, |e| *e == SensorEvent::ReadingReceived(after)).await;

        assert!(!seen.iter().any(|e| matches!(
            e,
            SensorEvent::MalformedData { .. } | SensorEvent::StatusChanged(_) | SensorEvent::ConnectionError(_)
        )));
        assert_eq!(manager.state().latest_reading, Some(after));
        assert!(manager.is_connected());
        assert_eq!(mock.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn scan_skips_the_retry_wait() {
        let mock = MockTransport::new();
        mock.advertise("DXCMA1");
        mock.fail_next_connects(1);
        let (manager, mut events) = start(&mock, config(), ManagerState::default());

        manager.scan_for_new_sensor().await.unwrap();
        collect_until(&mut events, |e| matches!(e, SensorEvent::ConnectionError(_))).await;
        assert_eq!(manager.connection_status(), ConnectionStatus::Disconnected);

        let asked = tokio::time::Instant::now();
        assert_eq!(
            manager.scan_for_new_sensor().await,
            Ok(ConnectionStatus::Scanning)
        );
        collect_until(&mut events, is_ready).await;
        assert!(asked.elapsed() < config().backoff().delay(1));
        assert_eq!(mock.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_failures_become_unreachable() {
        let mock = MockTransport::new();
        mock.advertise("DXCMA1");
        mock.fail_next_connects(5);
        let config = SessionConfig {
            max_retries: 3,
            ..config()
        };
        let (manager, mut events) = start(&mock, config, ManagerState::default());

        manager.scan_for_new_sensor().await.unwrap();
        let seen = collect_until(&mut events, is_ready).await;

        use ConnectionStatus::*;
        assert_eq!(
            statuses(&seen),
            vec![
                Scanning, Connecting, Disconnected,
                Scanning, Connecting, Disconnected,
                Scanning, Connecting, Unreachable,
                Ready,
            ]
        );
        let failures = seen
            .iter()
            .filter(|e| matches!(e, SensorEvent::ConnectionError(_)))
            .count();
        assert_eq!(failures, 5);
        assert_eq!(mock.connect_count(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_endpoint_fails_the_attempt() {
        let mock = MockTransport::new();
        mock.advertise("DXCMA1");
        mock.hide_endpoint(UUID_BACKFILL_CHAR);
        let (manager, mut events) = start(&mock, config(), ManagerState::default());

        manager.scan_for_new_sensor().await.unwrap();
        let seen = collect_until(&mut events, |e| matches!(e, SensorEvent::ConnectionError(_))).await;
        assert!(matches!(
            seen.last(),
            Some(SensorEvent::ConnectionError(ConnectionError::MissingEndpoint { endpoint, .. }))
                if *endpoint == UUID_BACKFILL_CHAR
        ));
        assert_eq!(mock.disconnect_count(), 1);
        assert!(!mock.is_linked());
        assert_eq!(manager.state().sensor_id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_discovery_times_out() {
        let mock = MockTransport::new();
        mock.advertise("DXCMA1");
        mock.hang_discovery(true);
        let (manager, mut events) = start(&mock, config(), ManagerState::default());

        manager.scan_for_new_sensor().await.unwrap();
        let seen = collect_until(&mut events, |e| matches!(e, SensorEvent::ConnectionError(_))).await;
        assert_eq!(
            seen.last(),
            Some(&SensorEvent::ConnectionError(ConnectionError::Timeout {
                stage: ConnectionStage::Discovery,
                timeout: config().timeouts().discovery,
            }))
        );
        assert_eq!(manager.connection_status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_subscription_times_out() {
        let mock = MockTransport::new();
        mock.advertise("DXCMA1");
        mock.hang_subscribe(true);
        let (manager, mut events) = start(&mock, config(), ManagerState::default());

        manager.scan_for_new_sensor().await.unwrap();
        let seen = collect_until(&mut events, |e| matches!(e, SensorEvent::ConnectionError(_))).await;
        assert_eq!(
            seen.last(),
            Some(&SensorEvent::ConnectionError(ConnectionError::Timeout {
                stage: ConnectionStage::Subscribe,
                timeout: config().timeouts().subscribe,
            }))
        );
        assert_eq!(mock.disconnect_count(), 1);
        assert!(!manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn delete_cancels_retries_and_clears_state() {
        let mock = MockTransport::new();
        mock.advertise("DXCMA1");
        mock.fail_next_connects(100);
        let (manager, mut events) = start(&mock, config(), ManagerState::default());

        manager.scan_for_new_sensor().await.unwrap();
        collect_until(&mut events, |e| matches!(e, SensorEvent::ConnectionError(_))).await;
        manager.delete_sensor().await.unwrap();
        let attempts = mock.connect_count();

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(mock.connect_count(), attempts);
        assert_eq!(manager.state(), ManagerState::default());
        assert_eq!(manager.connection_status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_releases_the_link() {
        let (mock, manager, _events) = connected().await;
        mock.notify(UUID_COMMUNICATION_CHAR, reading(1, 600).to_bytes());

        manager.delete_sensor().await.unwrap();
        assert!(!mock.is_linked());
        assert_eq!(mock.disconnect_count(), 1);
        assert_eq!(manager.state(), ManagerState::default());
        assert_eq!(
            manager.lifecycle(Utc::now()).state,
            LifecycleState::Searching
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fault_reading_latches_failure() {
        let (mock, manager, mut events) = connected().await;
        let mut faulty = reading(4, 7_200);
        faulty.flags = StatusFlags::from_bits(StatusFlags::FAULT);

        mock.notify(UUID_COMMUNICATION_CHAR, faulty.to_bytes());
        collect_until(&mut events, |e| matches!(e, SensorEvent::SensorFailed(_))).await;

        let now = Utc::now();
        assert_eq!(manager.lifecycle(now).state, LifecycleState::Failed);
        assert!(manager.state().failed_at.is_some());
        assert_eq!(manager.connection_status(), ConnectionStatus::Disconnected);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(
            manager.scan_for_new_sensor().await,
            Ok(ConnectionStatus::Disconnected)
        );
        assert_eq!(mock.connect_count(), 1);

        manager.delete_sensor().await.unwrap();
        assert_eq!(manager.lifecycle(now).state, LifecycleState::Searching);
    }

    #[tokio::test(start_paused = true)]
    async fn callback_observers_follow_the_session() {
        #[derive(Default)]
        struct Recorder {
            statuses: Mutex<Vec<ConnectionStatus>>,
        }

        impl StateObserver for Recorder {
            fn on_state_update(&self, _state: &ManagerState) {}

            fn on_connection_status_change(&self, status: ConnectionStatus) {
                self.statuses.lock().unwrap().push(status);
            }
        }

        let mock = MockTransport::new();
        mock.advertise("DXCMA1");
        let (manager, mut events) = start(&mock, config(), ManagerState::default());
        let recorder = Arc::new(Recorder::default());
        let id = manager.add_state_observer(recorder.clone(), &Handle::current());
        let (second, mut second_events) = manager.subscribe();

        manager.scan_for_new_sensor().await.unwrap();
        collect_until(&mut events, is_ready).await;
        collect_until(&mut second_events, is_ready).await;
        assert!(manager.remove_observer(second));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(
            recorder.statuses.lock().unwrap().last(),
            Some(&ConnectionStatus::Ready)
        );
        assert!(manager.remove_observer(id));
        assert!(!manager.remove_observer(id));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_releases_the_link_and_stops_commands() {
        let (mock, manager, _events) = connected().await;

        manager.shutdown().await;
        assert!(!mock.is_linked());
        assert_eq!(manager.connection_status(), ConnectionStatus::Disconnected);
        assert_eq!(
            manager.scan_for_new_sensor().await,
            Err(SessionError::Stopped)
        );
        assert_eq!(
            manager.state().sensor_id,
            Some(TransmitterIdentity::new("DXCMA1"))
        );
    }

    #[tokio::test]
    async fn links_finished_after_shutdown_are_released() {
        let mock = MockTransport::new();
        let (commands, mut queue) = mpsc::unbounded_channel();
        let sensor = DiscoveredSensor {
            peripheral_id: "mock-DXCMA1".into(),
            identity: TransmitterIdentity::new("DXCMA1"),
            rssi: None,
        };
        let link = mock
            .connect(&sensor, NotificationSink::new(commands.clone(), 1))
            .await
            .unwrap();
        let ready = SessionCommand::Attempt {
            generation: 1,
            progress: AttemptProgress::Ready(EstablishedLink { link, sensor }),
        };
        assert!(commands.send(ready).is_ok());
        assert!(commands.send(SessionCommand::Retry { generation: 2 }).is_ok());
        assert!(mock.is_linked());

        queue.close();
        assert_eq!(release_unclaimed(&mut queue, Duration::from_secs(1)).await, 1);
        assert!(!mock.is_linked());
        assert_eq!(mock.disconnect_count(), 1);
    }
}
