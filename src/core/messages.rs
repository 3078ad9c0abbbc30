//! Typed messages exchanged with a G7 transmitter
//! This module defines the decoded values the codec produces and the commands
//! it serializes. Wire layouts live in [`crate::core::codec`].

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::core::bluetooth::catalog::Endpoint;

/// mg/dL per mmol/L
const MG_DL_PER_MMOL_L: f64 = 18.0182;

/// A wire value that has no quantity meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{0:#06x} is a reserved wire code")]
pub struct ReservedCode(pub u16);

/// Glucose concentration in tenths of a mg/dL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct Concentration(u16);

impl Concentration {
    /// Largest quantity; everything above is a sentinel or reserved.
    pub const MAX_TENTHS: u16 = 0xffef;

    /// `None` for the codes the wire reserves for sentinels.
    pub const fn from_tenths(tenths: u16) -> Option<Self> {
        if tenths <= Self::MAX_TENTHS {
            Some(Self(tenths))
        } else {
            None
        }
    }

    pub const fn tenths(self) -> u16 {
        self.0
    }

    pub fn mg_dl(self) -> f64 {
        f64::from(self.0) / 10.0
    }

    pub fn mmol_l(self) -> f64 {
        self.mg_dl() / MG_DL_PER_MMOL_L
    }
}

impl TryFrom<u16> for Concentration {
    type Error = ReservedCode;

    fn try_from(tenths: u16) -> Result<Self, Self::Error> {
        Self::from_tenths(tenths).ok_or(ReservedCode(tenths))
    }
}

impl From<Concentration> for u16 {
    fn from(concentration: Concentration) -> Self {
        concentration.0
    }
}

/// A glucose field: either a measured quantity or one of the reserved
/// qualitative conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GlucoseValue {
    Measured(Concentration),
    /// No value yet, e.g. during warmup.
    NotAvailable,
    BelowRange,
    AboveRange,
    SensorFault,
}

impl GlucoseValue {
    pub fn concentration(self) -> Option<Concentration> {
        match self {
            Self::Measured(concentration) => Some(concentration),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlucoseRangeCategory {
    BelowRange,
    InRange,
    AboveRange,
}

/// Rate of change in tenths of a mg/dL per minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i8", into = "i8")]
pub struct TrendRate(i8);

impl TrendRate {
    /// Wire code for an unknown trend.
    pub const UNKNOWN: i8 = 0x7f;

    /// `None` for the unknown-trend code.
    pub const fn from_tenths(tenths: i8) -> Option<Self> {
        if tenths == Self::UNKNOWN {
            None
        } else {
            Some(Self(tenths))
        }
    }

    pub const fn tenths(self) -> i8 {
        self.0
    }

    pub fn mg_dl_per_minute(self) -> f64 {
        f64::from(self.0) / 10.0
    }
}

impl TryFrom<i8> for TrendRate {
    type Error = ReservedCode;

    fn try_from(tenths: i8) -> Result<Self, Self::Error> {
        Self::from_tenths(tenths).ok_or(ReservedCode(u16::from(tenths as u8)))
    }
}

impl From<TrendRate> for i8 {
    fn from(trend: TrendRate) -> Self {
        trend.0
    }
}

/// States reported by the on-sensor algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorState {
    Stopped,
    Warmup,
    ExcessNoise,
    Ok,
    NeedsCalibration,
    SessionExpired,
    SessionFailedDueToUnrecoverableError,
    SessionFailedDueToTransmitterError,
    TemporarySensorIssue,
    SensorFailedDueToProgressiveSensorDecline,
}

/// Algorithm state byte. Codes outside the known set are kept verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlgorithmState {
    Known(SensorState),
    Unknown(u8),
}

impl AlgorithmState {
    pub fn from_byte(code: u8) -> Self {
        let state = match code {
            0x01 => SensorState::Stopped,
            0x02 => SensorState::Warmup,
            0x03 => SensorState::ExcessNoise,
            0x06 => SensorState::Ok,
            0x07 => SensorState::NeedsCalibration,
            0x0f => SensorState::SessionExpired,
            0x10 => SensorState::SessionFailedDueToUnrecoverableError,
            0x11 => SensorState::SessionFailedDueToTransmitterError,
            0x12 => SensorState::TemporarySensorIssue,
            0x13 => SensorState::SensorFailedDueToProgressiveSensorDecline,
            other => return Self::Unknown(other),
        };
        Self::Known(state)
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Self::Unknown(code) => code,
            Self::Known(state) => match state {
                SensorState::Stopped => 0x01,
                SensorState::Warmup => 0x02,
                SensorState::ExcessNoise => 0x03,
                SensorState::Ok => 0x06,
                SensorState::NeedsCalibration => 0x07,
                SensorState::SessionExpired => 0x0f,
                SensorState::SessionFailedDueToUnrecoverableError => 0x10,
                SensorState::SessionFailedDueToTransmitterError => 0x11,
                SensorState::TemporarySensorIssue => 0x12,
                SensorState::SensorFailedDueToProgressiveSensorDecline => 0x13,
            },
        }
    }

    pub fn sensor_failed(self) -> bool {
        matches!(
            self,
            Self::Known(
                SensorState::SessionFailedDueToUnrecoverableError
                    | SensorState::SessionFailedDueToTransmitterError
                    | SensorState::SensorFailedDueToProgressiveSensorDecline
            )
        )
    }

    pub fn is_in_warmup(self) -> bool {
        self == Self::Known(SensorState::Warmup)
    }
}

/// Status flag byte carried by readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusFlags(u8);

impl StatusFlags {
    pub const DISPLAY_ONLY: u8 = 0x10;
    pub const FAULT: u8 = 0x80;

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub fn display_only(self) -> bool {
        self.0 & Self::DISPLAY_ONLY != 0
    }

    pub fn fault(self) -> bool {
        self.0 & Self::FAULT != 0
    }
}

/// Where a fault indication came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorFault {
    /// The reading's fault flag, fault sentinel or a failed algorithm state.
    Reading { algorithm_state: AlgorithmState },
    /// A control response carried the fault status.
    ControlResponse { opcode: u8 },
}

impl fmt::Display for SensorFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reading { algorithm_state } => {
                write!(f, "reading reports fault (algorithm state {:#04x})", algorithm_state.to_byte())
            }
            Self::ControlResponse { opcode } => write!(f, "control response {opcode:#04x} reports fault"),
        }
    }
}

/// A real-time glucose reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlucoseMessage {
    pub sequence: u16,
    /// Seconds since sensor activation at which the message was sent.
    pub message_timestamp: u32,
    /// Seconds elapsed between the measurement and the transmission.
    pub age: u8,
    pub algorithm_state: AlgorithmState,
    pub glucose: GlucoseValue,
    /// `None` when the sensor did not report a trend.
    pub trend: Option<TrendRate>,
    pub predicted: Option<Concentration>,
    pub flags: StatusFlags,
}

impl GlucoseMessage {
    /// Seconds since activation at which the glucose was measured.
    pub fn glucose_timestamp(&self) -> u32 {
        self.message_timestamp.saturating_sub(u32::from(self.age))
    }

    /// Wall-clock measurement time for a sensor activated at `activated_at`.
    pub fn glucose_date(&self, activated_at: DateTime<Utc>) -> DateTime<Utc> {
        activated_at + TimeDelta::seconds(i64::from(self.glucose_timestamp()))
    }

    pub fn fault(&self) -> Option<SensorFault> {
        let faulted = self.flags.fault()
            || self.algorithm_state.sensor_failed()
            || self.glucose == GlucoseValue::SensorFault;
        faulted.then_some(SensorFault::Reading {
            algorithm_state: self.algorithm_state,
        })
    }

    pub fn range_category(&self) -> Option<GlucoseRangeCategory> {
        match self.glucose {
            GlucoseValue::BelowRange => Some(GlucoseRangeCategory::BelowRange),
            GlucoseValue::AboveRange => Some(GlucoseRangeCategory::AboveRange),
            GlucoseValue::Measured(_) => Some(GlucoseRangeCategory::InRange),
            GlucoseValue::NotAvailable | GlucoseValue::SensorFault => None,
        }
    }

    /// Whether the value may be used for dosing decisions.
    pub fn has_reliable_glucose(&self) -> bool {
        self.algorithm_state == AlgorithmState::Known(SensorState::Ok)
            && !self.flags.display_only()
            && self.fault().is_none()
            && matches!(
                self.glucose,
                GlucoseValue::Measured(_) | GlucoseValue::BelowRange | GlucoseValue::AboveRange
            )
    }
}

/// A historical reading recovered after a gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillRecord {
    /// Seconds since activation of the measurement.
    pub timestamp: u32,
    pub sequence: u16,
    pub glucose: GlucoseValue,
    pub algorithm_state: AlgorithmState,
    pub flags: StatusFlags,
}

/// Result byte of control responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Ok,
    Rejected(u8),
    SensorFault,
}

impl ResponseStatus {
    pub fn from_byte(code: u8) -> Self {
        match code {
            0x00 => Self::Ok,
            0xff => Self::SensorFault,
            other => Self::Rejected(other),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Self::Ok => 0x00,
            Self::SensorFault => 0xff,
            Self::Rejected(code) => code,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthChallenge {
    pub challenge: [u8; 8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthStatus {
    pub authenticated: bool,
    pub bonded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSyncResponse {
    pub status: ResponseStatus,
    /// Seconds since activation as the sensor counts them.
    pub sensor_time: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillComplete {
    pub status: ResponseStatus,
    pub record_count: u16,
}

/// Anything the codec can produce from an inbound payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedMessage {
    Glucose(GlucoseMessage),
    Backfill(BackfillRecord),
    AuthChallenge(AuthChallenge),
    AuthStatus(AuthStatus),
    TimeSync(TimeSyncResponse),
    BackfillComplete(BackfillComplete),
    ManufacturerName(String),
    /// A structurally valid frame whose opcode or version this build does not know.
    Unrecognized {
        endpoint: Endpoint,
        opcode: u8,
        version: u8,
        body: Vec<u8>,
    },
}

impl DecodedMessage {
    /// Fault carried by a control response, if any.
    pub fn response_fault(&self) -> Option<SensorFault> {
        let (status, opcode) = match self {
            Self::TimeSync(response) => (response.status, crate::core::codec::OPCODE_TIME_SYNC_RESPONSE),
            Self::BackfillComplete(response) => {
                (response.status, crate::core::codec::OPCODE_BACKFILL)
            }
            _ => return None,
        };
        (status == ResponseStatus::SensorFault).then_some(SensorFault::ControlResponse { opcode })
    }
}

/// Commands written to the transmitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingCommand {
    AuthRequest { token: [u8; 8], slot: u8 },
    BondRequest,
    /// Host wall clock in Unix seconds.
    TimeSyncRequest { host_time: u32 },
    /// Sensor-relative range, in seconds since activation.
    BackfillRequest { start: u32, end: u32 },
}

impl OutgoingCommand {
    /// The endpoint the command is written to.
    pub fn endpoint(&self) -> Endpoint {
        match self {
            Self::AuthRequest { .. } | Self::BondRequest => Endpoint::Authentication,
            Self::TimeSyncRequest { .. } | Self::BackfillRequest { .. } => Endpoint::Control,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        crate::core::codec::encode(self)
    }
}
