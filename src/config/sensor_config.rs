use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::core::sensor::SensorTimings;

/// Phase durations of a sensor session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub warmup_minutes: i64,
    pub lifetime_hours: i64,
    pub grace_period_hours: i64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            warmup_minutes: 25,
            lifetime_hours: 10 * 24,
            grace_period_hours: 12,
        }
    }
}

impl SensorConfig {
    pub fn timings(&self) -> SensorTimings {
        SensorTimings {
            warmup: TimeDelta::minutes(self.warmup_minutes.max(0)),
            lifetime: TimeDelta::hours(self.lifetime_hours.max(0)),
            grace_period: TimeDelta::hours(self.grace_period_hours.max(0)),
        }
    }
}
