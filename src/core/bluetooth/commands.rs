//! Session setup commands for the G7 transmitter
//! This module decides which commands follow a successful subscription and
//! sends them through a `CommandSender`.

use chrono::{DateTime, Utc};
use log::{debug, info};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::core::manager_state::ManagerState;
use crate::core::messages::OutgoingCommand;
use crate::error::ConnectionError;

/// App slot announced in the authentication request.
pub const AUTH_SLOT: u8 = 0x02;

/// Command sender trait
#[async_trait::async_trait]
pub trait CommandSender {
    /// Send a command to the transmitter
    async fn send_command(&self, command: OutgoingCommand) -> Result<(), ConnectionError>;
}

/// Command executor for the transmitter
pub struct CommandExecutor<T: CommandSender> {
    command_sender: T,
}

impl<T: CommandSender> CommandExecutor<T> {
    /// Create a new CommandExecutor
    pub fn new(command_sender: T) -> Self {
        Self { command_sender }
    }

    /// Sends the setup sequence in order. Stops at the first failed write.
    pub async fn initialize_session(&self, commands: &[OutgoingCommand]) -> Result<(), ConnectionError> {
        for command in commands {
            info!("Sending command: {:?}", command);
            self.command_sender.send_command(*command).await?;
        }
        debug!("Session setup sent {} commands", commands.len());
        Ok(())
    }
}

/// Commands to send once a link is subscribed.
pub fn setup_commands(
    config: &SessionConfig,
    state: &ManagerState,
    now: DateTime<Utc>,
) -> Vec<OutgoingCommand> {
    let mut commands = Vec::new();

    if config.authenticate {
        commands.push(OutgoingCommand::AuthRequest {
            token: auth_token(),
            slot: AUTH_SLOT,
        });
    }

    if config.time_sync {
        commands.push(OutgoingCommand::TimeSyncRequest {
            host_time: now.timestamp().clamp(0, i64::from(u32::MAX)) as u32,
        });
    }

    if let Some(request) = backfill_request(config, state, now) {
        commands.push(request);
    }

    commands
}

/// Requests the readings missed since the latest one, when the gap is wide
/// enough to matter.
fn backfill_request(
    config: &SessionConfig,
    state: &ManagerState,
    now: DateTime<Utc>,
) -> Option<OutgoingCommand> {
    let latest = state.latest_reading.as_ref()?;
    let received_at = state.latest_reading_received_at?;
    let gap = (now - received_at).num_seconds();
    if gap < 0 || gap as u64 <= config.backfill_gap_secs {
        return None;
    }
    let start = latest.message_timestamp;
    let end = start.saturating_add(u32::try_from(gap).unwrap_or(u32::MAX));
    Some(OutgoingCommand::BackfillRequest { start, end })
}

fn auth_token() -> [u8; 8] {
    let random = Uuid::new_v4();
    let mut token = [0u8; 8];
    token.copy_from_slice(&random.as_bytes()[..8]);
    token
}
