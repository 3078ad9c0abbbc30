//! Durable snapshot of the sensor session
//! The snapshot round-trips through a string-keyed map so it can be stored by
//! any key/value persistence layer. Readings are kept as their wire frames.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::core::bluetooth::types::TransmitterIdentity;
use crate::core::messages::GlucoseMessage;

const KEY_SENSOR_ID: &str = "sensorID";
const KEY_ACTIVATED_AT: &str = "activatedAt";
const KEY_LATEST_READING: &str = "latestReading";
const KEY_LATEST_READING_RECEIVED_AT: &str = "latestReadingReceivedAt";
const KEY_LAST_CONNECT: &str = "lastConnect";
const KEY_FAILED_AT: &str = "failedAt";

/// One value of the persisted map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RawValue {
    String(String),
    Date(DateTime<Utc>),
    Data(Vec<u8>),
}

pub type RawState = BTreeMap<String, RawValue>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerState {
    pub sensor_id: Option<TransmitterIdentity>,
    pub activated_at: Option<DateTime<Utc>>,
    pub latest_reading: Option<GlucoseMessage>,
    pub latest_reading_received_at: Option<DateTime<Utc>>,
    pub last_connect: Option<DateTime<Utc>>,
    /// Set when the sensor reported an unrecoverable fault.
    pub failed_at: Option<DateTime<Utc>>,
}

impl ManagerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a snapshot. Entries of the wrong type, or readings that no
    /// longer decode, are dropped.
    pub fn from_raw(raw: &RawState) -> Self {
        Self {
            sensor_id: raw_string(raw, KEY_SENSOR_ID).map(TransmitterIdentity::new),
            activated_at: raw_date(raw, KEY_ACTIVATED_AT),
            latest_reading: raw_data(raw, KEY_LATEST_READING).and_then(|data| {
                GlucoseMessage::from_bytes(data)
                    .map_err(|e| warn!("Discarding stored reading: {}", e))
                    .ok()
            }),
            latest_reading_received_at: raw_date(raw, KEY_LATEST_READING_RECEIVED_AT),
            last_connect: raw_date(raw, KEY_LAST_CONNECT),
            failed_at: raw_date(raw, KEY_FAILED_AT),
        }
    }

    pub fn to_raw(&self) -> RawState {
        let mut raw = RawState::new();
        if let Some(sensor_id) = &self.sensor_id {
            raw.insert(KEY_SENSOR_ID.into(), RawValue::String(sensor_id.as_str().to_string()));
        }
        let dates = [
            (KEY_ACTIVATED_AT, self.activated_at),
            (KEY_LATEST_READING_RECEIVED_AT, self.latest_reading_received_at),
            (KEY_LAST_CONNECT, self.last_connect),
            (KEY_FAILED_AT, self.failed_at),
        ];
        for (key, date) in dates {
            if let Some(date) = date {
                raw.insert(key.into(), RawValue::Date(date));
            }
        }
        if let Some(reading) = &self.latest_reading {
            raw.insert(KEY_LATEST_READING.into(), RawValue::Data(reading.to_bytes()));
        }
        raw
    }

    pub fn is_failed(&self) -> bool {
        self.failed_at.is_some()
            || self
                .latest_reading
                .as_ref()
                .is_some_and(|reading| reading.fault().is_some())
    }
}

fn raw_string<'a>(raw: &'a RawState, key: &str) -> Option<&'a str> {
    match raw.get(key)? {
        RawValue::String(value) => Some(value),
        other => {
            warn!("Ignoring stored {} of unexpected type: {:?}", key, other);
            None
        }
    }
}

fn raw_date(raw: &RawState, key: &str) -> Option<DateTime<Utc>> {
    match raw.get(key)? {
        RawValue::Date(value) => Some(*value),
        other => {
            warn!("Ignoring stored {} of unexpected type: {:?}", key, other);
            None
        }
    }
}

fn raw_data<'a>(raw: &'a RawState, key: &str) -> Option<&'a [u8]> {
    match raw.get(key)? {
        RawValue::Data(value) => Some(value),
        other => {
            warn!("Ignoring stored {} of unexpected type: {:?}", key, other);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::messages::{
        AlgorithmState, Concentration, GlucoseValue, SensorState, StatusFlags, TrendRate,
    };

    fn populated() -> ManagerState {
        let at = |secs| DateTime::from_timestamp(secs, 123_456_789).unwrap();
        ManagerState {
            sensor_id: Some(TransmitterIdentity::new("DXCMA1")),
            activated_at: Some(at(1_700_000_000)),
            latest_reading: Some(GlucoseMessage {
                sequence: 42,
                message_timestamp: 7_200,
                age: 3,
                algorithm_state: AlgorithmState::Known(SensorState::Ok),
                glucose: GlucoseValue::Measured(Concentration::from_tenths(1105).unwrap()),
                trend: TrendRate::from_tenths(5),
                predicted: None,
                flags: StatusFlags::default(),
            }),
            latest_reading_received_at: Some(at(1_700_007_200)),
            last_connect: Some(at(1_700_007_100)),
            failed_at: None,
        }
    }

    #[test]
    fn empty_state_round_trips_to_empty_map() {
        let raw = ManagerState::new().to_raw();
        assert!(raw.is_empty());
        assert_eq!(ManagerState::from_raw(&raw), ManagerState::new());
    }

    #[test]
    fn populated_state_round_trips() {
        let state = populated();
        let raw = state.to_raw();
        assert_eq!(raw.len(), 5);
        assert_eq!(
            raw.get(KEY_LATEST_READING),
            Some(&RawValue::Data(state.latest_reading.unwrap().to_bytes()))
        );
        assert_eq!(ManagerState::from_raw(&raw), state);
    }

    #[test]
    fn round_trips_through_json() {
        let mut state = populated();
        state.failed_at = state.last_connect;
        let json = serde_json::to_string(&state.to_raw()).unwrap();
        let raw: RawState = serde_json::from_str(&json).unwrap();
        assert_eq!(ManagerState::from_raw(&raw), state);
    }

    #[test]
    fn bad_entries_are_dropped_individually() {
        let mut raw = populated().to_raw();
        raw.insert(KEY_LATEST_READING.into(), RawValue::Data(vec![0x4e]));
        raw.insert(KEY_ACTIVATED_AT.into(), RawValue::String("yesterday".into()));
        let state = ManagerState::from_raw(&raw);
        assert_eq!(state.latest_reading, None);
        assert_eq!(state.activated_at, None);
        assert_eq!(state.sensor_id, populated().sensor_id);
    }

    #[test]
    fn failure_comes_from_latch_or_reading() {
        let mut state = populated();
        assert!(!state.is_failed());
        state.failed_at = state.last_connect;
        assert!(state.is_failed());

        let mut state = populated();
        if let Some(reading) = state.latest_reading.as_mut() {
            reading.flags = StatusFlags::from_bits(StatusFlags::FAULT);
        }
        assert!(state.is_failed());
    }
}
