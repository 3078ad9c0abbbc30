//! Defines shared data structures for the Bluetooth module.

use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::bluetooth::constants::SENSOR_NAME_PATTERN;

/// Advertised name of one physical transmitter. Fixed once paired.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransmitterIdentity(String);

impl TransmitterIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransmitterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How the session decides which advertisement belongs to our sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindPolicy {
    /// With no stored identity, connect to the first G7 that advertises and
    /// keep its identity from then on.
    #[default]
    FirstContact,
    /// Only connect to an identity stored beforehand with `pair_sensor`.
    RequireStored,
}

/// Advertisement filter for one scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanFilter {
    /// Only this transmitter.
    Identity(TransmitterIdentity),
    /// Any transmitter whose name looks like a G7.
    AnySensor,
}

impl ScanFilter {
    pub fn matches(&self, advertised_name: &str) -> bool {
        match self {
            Self::Identity(identity) => identity.as_str() == advertised_name,
            Self::AnySensor => is_sensor_name(advertised_name),
        }
    }
}

pub fn is_sensor_name(name: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(SENSOR_NAME_PATTERN).expect("sensor name pattern is valid"))
        .is_match(name)
}

/// A peripheral that matched a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredSensor {
    pub identity: TransmitterIdentity,
    /// Platform-specific peripheral identifier (not the MAC address on macOS)
    pub peripheral_id: String,
    /// The signal strength (RSSI) of the advertisement, if available
    pub rssi: Option<i16>,
}

/// A value pushed by the transmitter, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNotification {
    pub characteristic: Uuid,
    pub bytes: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

/// Link state as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Disconnected,
    Scanning,
    Connecting,
    Discovering,
    Ready,
    /// Reconnects keep failing. Retries continue at the capped delay.
    Unreachable,
}

impl ConnectionStatus {
    /// Whether a search or an attempt is underway.
    pub fn is_scanning(self) -> bool {
        matches!(self, Self::Scanning | Self::Connecting | Self::Discovering)
    }

    pub fn is_connected(self) -> bool {
        self == Self::Ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensor_names_follow_the_g7_pattern() {
        assert!(is_sensor_name("DXCMA1"));
        assert!(is_sensor_name("DXCM9Z"));
        assert!(!is_sensor_name("DXCM"));
        assert!(!is_sensor_name("Polar H10 1A2B3C"));
        assert!(!is_sensor_name("dxcma1"));
    }

    #[test]
    fn identity_filter_is_exact() {
        let filter = ScanFilter::Identity(TransmitterIdentity::new("DXCMA1"));
        assert!(filter.matches("DXCMA1"));
        assert!(!filter.matches("DXCMA2"));
        assert!(ScanFilter::AnySensor.matches("DXCMA2"));
    }
}
