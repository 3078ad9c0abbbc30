//! Observer registry for session events
//! Every subscriber owns an unbounded channel, so a slow observer never
//! holds up the session and events reach each subscriber in emission order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::debug;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::core::bluetooth::catalog::Endpoint;
use crate::core::bluetooth::types::{ConnectionStatus, TransmitterIdentity};
use crate::core::manager_state::ManagerState;
use crate::core::messages::{BackfillRecord, GlucoseMessage};
use crate::error::{ConnectionError, LifecycleError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorEvent {
    StatusChanged(ConnectionStatus),
    /// Answer to a scan request while a search or link was already active.
    StatusReplayed(ConnectionStatus),
    StateUpdated(ManagerState),
    ReadingReceived(GlucoseMessage),
    BackfillReceived(BackfillRecord),
    SensorBound(TransmitterIdentity),
    MalformedData { endpoint: Endpoint, len: usize },
    ConnectionError(ConnectionError),
    SensorFailed(LifecycleError),
}

/// Callback style observer.
pub trait StateObserver: Send + Sync + 'static {
    fn on_state_update(&self, state: &ManagerState);

    fn on_connection_status_change(&self, status: ConnectionStatus);

    fn on_event(&self, _event: &SensorEvent) {}
}

#[derive(Debug, Default)]
pub struct ObserverRegistry {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<SubscriptionId, mpsc::UnboundedSender<SensorEvent>>>,
}

impl ObserverRegistry {
    pub fn subscribe(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<SensorEvent>) {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        (id, rx)
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    /// Sends `event` to every subscriber, dropping those whose receiver is gone.
    pub fn broadcast(&self, event: SensorEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|id, tx| {
            let delivered = tx.send(event.clone()).is_ok();
            if !delivered {
                debug!("Dropping closed subscription {:?}", id);
            }
            delivered
        });
    }

    pub fn len(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drives `observer` from a task on `context` until it is unsubscribed.
    pub fn attach(&self, observer: Arc<dyn StateObserver>, context: &Handle) -> SubscriptionId {
        let (id, mut events) = self.subscribe();
        context.spawn(async move {
            while let Some(event) = events.recv().await {
                match &event {
                    SensorEvent::StateUpdated(state) => observer.on_state_update(state),
                    SensorEvent::StatusChanged(status) | SensorEvent::StatusReplayed(status) => {
                        observer.on_connection_status_change(*status)
                    }
                    _ => {}
                }
                observer.on_event(&event);
            }
        });
        id
    }
}
