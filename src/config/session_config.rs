use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::bluetooth::connection::{Backoff, Timeouts};
use crate::core::bluetooth::constants::{
    BACKFILL_GAP_SECS, BLUETOOTH_OPERATION_TIMEOUT_SECS, CONNECT_RETRY_DELAY_MS,
    CONNECT_RETRY_MULTIPLIER, DEFAULT_SCAN_DURATION_SECS, MAX_CONNECT_RETRIES,
    MAX_CONNECT_RETRY_DELAY_MS, MIN_RSSI_THRESHOLD,
};
use crate::core::bluetooth::types::BindPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Whether an unpaired session binds to the first G7 it sees.
    pub bind_policy: BindPolicy,

    /// How long one scan waits for the sensor to advertise.
    pub scan_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub discovery_timeout_secs: u64,
    pub subscribe_timeout_secs: u64,
    /// Also bounds the disconnect on teardown.
    pub write_timeout_secs: u64,

    /// Reconnect backoff.
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub retry_multiplier: u32,
    /// Consecutive failures before the sensor is reported unreachable.
    pub max_retries: u32,

    /// Send an authentication request after subscribing.
    pub authenticate: bool,
    /// Send the host clock after subscribing.
    pub time_sync: bool,
    /// Request a backfill when the latest reading is older than this.
    pub backfill_gap_secs: u64,

    /// Advertisements weaker than this (dBm) are ignored.
    pub min_rssi: i16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bind_policy: BindPolicy::default(),
            scan_timeout_secs: DEFAULT_SCAN_DURATION_SECS,
            connect_timeout_secs: BLUETOOTH_OPERATION_TIMEOUT_SECS,
            discovery_timeout_secs: BLUETOOTH_OPERATION_TIMEOUT_SECS,
            subscribe_timeout_secs: BLUETOOTH_OPERATION_TIMEOUT_SECS,
            write_timeout_secs: BLUETOOTH_OPERATION_TIMEOUT_SECS,
            retry_delay_ms: CONNECT_RETRY_DELAY_MS,
            max_retry_delay_ms: MAX_CONNECT_RETRY_DELAY_MS,
            retry_multiplier: CONNECT_RETRY_MULTIPLIER,
            max_retries: MAX_CONNECT_RETRIES,
            authenticate: true,
            time_sync: false,
            backfill_gap_secs: BACKFILL_GAP_SECS,
            min_rssi: MIN_RSSI_THRESHOLD,
        }
    }
}

impl SessionConfig {
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            scan: Duration::from_secs(self.scan_timeout_secs),
            connect: Duration::from_secs(self.connect_timeout_secs),
            discovery: Duration::from_secs(self.discovery_timeout_secs),
            subscribe: Duration::from_secs(self.subscribe_timeout_secs),
            write: Duration::from_secs(self.write_timeout_secs),
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            initial: Duration::from_millis(self.retry_delay_ms),
            multiplier: self.retry_multiplier,
            max: Duration::from_millis(self.max_retry_delay_ms),
        }
    }
}
