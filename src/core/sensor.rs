//! Sensor lifecycle derivation
//! The lifecycle is never stored. It is recomputed from the activation time,
//! the fault latch and the current time.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::core::manager_state::ManagerState;

/// Fixed phase durations of a sensor session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorTimings {
    pub warmup: TimeDelta,
    pub lifetime: TimeDelta,
    pub grace_period: TimeDelta,
}

impl Default for SensorTimings {
    fn default() -> Self {
        Self {
            warmup: TimeDelta::minutes(25),
            lifetime: TimeDelta::days(10),
            grace_period: TimeDelta::hours(12),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    Searching,
    Warmup,
    Ok,
    GracePeriod,
    Expired,
    Failed,
}

impl LifecycleState {
    /// States only left by deleting or re-pairing the sensor.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Expired | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleStatus {
    pub state: LifecycleState,
    /// Time left in the current state; `None` where the state has no end.
    pub remaining: Option<TimeDelta>,
}

impl LifecycleStatus {
    /// Fraction of the current phase that has elapsed, in `0.0..=1.0`.
    pub fn progress(&self, timings: &SensorTimings) -> f64 {
        let phase = match self.state {
            LifecycleState::Searching | LifecycleState::Failed => return 0.0,
            LifecycleState::Expired => return 1.0,
            LifecycleState::Warmup => timings.warmup,
            LifecycleState::Ok => timings.lifetime,
            LifecycleState::GracePeriod => timings.grace_period,
        };
        let Some(remaining) = self.remaining else {
            return 0.0;
        };
        if phase <= TimeDelta::zero() {
            return 1.0;
        }
        let fraction = 1.0 - remaining.num_milliseconds() as f64 / phase.num_milliseconds() as f64;
        fraction.clamp(0.0, 1.0)
    }
}

/// Lifecycle from elapsed time alone.
pub fn derive(
    activated_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    timings: &SensorTimings,
) -> LifecycleStatus {
    let Some(activated_at) = activated_at else {
        return LifecycleStatus {
            state: LifecycleState::Searching,
            remaining: None,
        };
    };

    let elapsed = (now - activated_at).max(TimeDelta::zero());
    let end_of_grace = timings.lifetime + timings.grace_period;
    let (state, remaining) = if elapsed < timings.warmup {
        (LifecycleState::Warmup, timings.warmup - elapsed)
    } else if elapsed < timings.lifetime {
        (LifecycleState::Ok, timings.lifetime - elapsed)
    } else if elapsed < end_of_grace {
        (LifecycleState::GracePeriod, end_of_grace - elapsed)
    } else {
        (LifecycleState::Expired, TimeDelta::zero())
    };
    LifecycleStatus {
        state,
        remaining: Some(remaining),
    }
}

/// Lifecycle of the tracked sensor. A recorded fault overrides elapsed time.
pub fn lifecycle(state: &ManagerState, now: DateTime<Utc>, timings: &SensorTimings) -> LifecycleStatus {
    if state.is_failed() {
        return LifecycleStatus {
            state: LifecycleState::Failed,
            remaining: None,
        };
    }
    derive(state.activated_at, now, timings)
}

pub fn finishes_warmup_at(state: &ManagerState, timings: &SensorTimings) -> Option<DateTime<Utc>> {
    state.activated_at.map(|at| at + timings.warmup)
}

pub fn expires_at(state: &ManagerState, timings: &SensorTimings) -> Option<DateTime<Utc>> {
    state.activated_at.map(|at| at + timings.lifetime)
}

/// End of the grace period, after which readings stop being usable.
pub fn ends_at(state: &ManagerState, timings: &SensorTimings) -> Option<DateTime<Utc>> {
    state
        .activated_at
        .map(|at| at + timings.lifetime + timings.grace_period)
}
