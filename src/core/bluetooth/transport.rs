//! Transport seam between the session and the Bluetooth stack
//! The session only talks to a transmitter through these traits, so the
//! same state machine drives `bluest` in production and a scripted
//! transport in tests.

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::manager::SessionCommand;
use crate::core::bluetooth::types::{DiscoveredSensor, RawNotification, ScanFilter};
use crate::error::ConnectionError;

/// Finds and connects transmitters.
#[async_trait]
pub trait SensorTransport: Send + Sync + 'static {
    /// Waits until a peripheral matching `filter` advertises.
    async fn scan(&self, filter: &ScanFilter) -> Result<DiscoveredSensor, ConnectionError>;

    /// Opens a link. Values from subscribed characteristics, and the loss of
    /// the link, are reported through `sink`.
    async fn connect(
        &self,
        sensor: &DiscoveredSensor,
        sink: NotificationSink,
    ) -> Result<Box<dyn SensorLink>, ConnectionError>;
}

/// An open link to one transmitter.
#[async_trait]
pub trait SensorLink: Send + Sync {
    /// Characteristics present in `service`. Empty if the service is absent.
    async fn discover(&self, service: Uuid) -> Result<Vec<Uuid>, ConnectionError>;

    /// Resolves once the peripheral acknowledged the subscription.
    async fn subscribe(&self, characteristic: Uuid) -> Result<(), ConnectionError>;

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<(), ConnectionError>;

    /// Stops forwarding and releases the link.
    async fn disconnect(&self) -> Result<(), ConnectionError>;
}

/// Hands link traffic to the session queue, tagged with the attempt it
/// belongs to.
#[derive(Debug, Clone)]
pub struct NotificationSink {
    commands: mpsc::UnboundedSender<SessionCommand>,
    generation: u64,
}

impl NotificationSink {
    pub(crate) fn new(commands: mpsc::UnboundedSender<SessionCommand>, generation: u64) -> Self {
        Self {
            commands,
            generation,
        }
    }

    /// Returns false once the session is gone.
    pub fn deliver(&self, characteristic: Uuid, bytes: Vec<u8>) -> bool {
        let notification = RawNotification {
            characteristic,
            bytes,
            received_at: Utc::now(),
        };
        self.commands
            .send(SessionCommand::Notification {
                generation: self.generation,
                notification,
            })
            .is_ok()
    }

    pub fn link_lost(&self) {
        let _ = self.commands.send(SessionCommand::LinkLost {
            generation: self.generation,
        });
    }
}
