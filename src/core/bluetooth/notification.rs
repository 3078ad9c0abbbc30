//! Notification handling for the G7 transmitter
//! This module sets up notifications on a characteristic and forwards every
//! value into the session queue.

use bluest::Characteristic;
use futures_util::StreamExt;
use log::{debug, error, info};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::transport::NotificationSink;
use crate::error::ConnectionError;

/// Forwards characteristic values to the session
pub struct NotificationHandler;

impl NotificationHandler {
    /// Subscribes to `characteristic`. Returns once notifications are enabled;
    /// forwarding continues until `token` is cancelled or the stream ends.
    pub async fn subscribe(
        characteristic: Characteristic,
        sink: NotificationSink,
        token: CancellationToken,
    ) -> Result<(), ConnectionError> {
        info!("Subscribing to notifications on {}...", characteristic.uuid());
        let (ack_tx, ack_rx) = oneshot::channel();

        tokio::spawn(async move {
            Self::process_notifications(characteristic, sink, token, ack_tx).await;
        });

        ack_rx.await.map_err(|_| ConnectionError::LinkLost)?
    }

    /// Process notifications from one characteristic
    async fn process_notifications(
        characteristic: Characteristic,
        sink: NotificationSink,
        token: CancellationToken,
        ack: oneshot::Sender<Result<(), ConnectionError>>,
    ) {
        let uuid = characteristic.uuid();
        let subscription = tokio::select! {
            _ = token.cancelled() => return,
            subscription = characteristic.notify() => subscription,
        };

        let mut notification_stream = match subscription {
            Ok(stream) => {
                let _ = ack.send(Ok(()));
                stream
            }
            Err(e) => {
                error!("Failed to subscribe to notifications on {}: {}", uuid, e);
                let _ = ack.send(Err(e.into()));
                return;
            }
        };

        info!("Listening for notifications on {}...", uuid);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                result = notification_stream.next() => match result {
                    Some(Ok(value)) => {
                        debug!("Received {} bytes on {}: {:02x?}", value.len(), uuid, value);
                        if !sink.deliver(uuid, value) {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        error!("Error in notification stream on {}: {}", uuid, e);
                        sink.link_lost();
                        break;
                    }
                    None => {
                        info!("Notification stream on {} ended", uuid);
                        sink.link_lost();
                        break;
                    }
                }
            }
        }
    }
}
