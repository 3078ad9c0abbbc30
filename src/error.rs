//! Error types for the sensor session core.
//!
//! Every error here is recovered inside the session or turned into a status
//! event. None of them is allowed to escape as a process failure.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::core::bluetooth::catalog::Endpoint;
use crate::core::messages::SensorFault;

/// Why a frame was rejected by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedReason {
    /// Shorter than the smallest frame the endpoint accepts.
    TooShort,
    /// Trailing CRC does not match the frame contents.
    BadChecksum,
    /// The schema/version byte is not a valid version.
    BadVersion(u8),
    /// Body length does not match the layout its opcode declares.
    BadLength { expected: usize },
    /// A field carries a reserved value with no defined meaning.
    ReservedValue,
    /// Text payload is not valid UTF-8.
    BadEncoding,
    /// A different message type than the one expected.
    UnexpectedOpcode(u8),
}

impl fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort => write!(f, "frame too short"),
            Self::BadChecksum => write!(f, "checksum mismatch"),
            Self::BadVersion(version) => write!(f, "invalid version byte {version:#04x}"),
            Self::BadLength { expected } => write!(f, "expected a {expected}-byte body"),
            Self::ReservedValue => write!(f, "reserved field value"),
            Self::BadEncoding => write!(f, "invalid text encoding"),
            Self::UnexpectedOpcode(opcode) => write!(f, "unexpected opcode {opcode:#04x}"),
        }
    }
}

/// Failures decoding an inbound payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The payload failed structural validation and was dropped whole.
    #[error("malformed {len}-byte payload on {endpoint:?}: {reason}")]
    Malformed {
        endpoint: Endpoint,
        len: usize,
        reason: MalformedReason,
    },
}

impl CodecError {
    pub(crate) fn malformed(endpoint: Endpoint, len: usize, reason: MalformedReason) -> Self {
        Self::Malformed {
            endpoint,
            len,
            reason,
        }
    }
}

/// The suspension point a connection attempt was waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStage {
    Scan,
    Connect,
    Discovery,
    Subscribe,
    Write,
    Disconnect,
}

impl fmt::Display for ConnectionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Scan => "scan",
            Self::Connect => "connect",
            Self::Discovery => "discovery",
            Self::Subscribe => "subscribe",
            Self::Write => "write",
            Self::Disconnect => "disconnect",
        };
        f.write_str(name)
    }
}

/// Failures on the wireless link.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("No Bluetooth adapter available")]
    AdapterUnavailable,

    #[error("{stage} did not complete within {timeout:?}")]
    Timeout {
        stage: ConnectionStage,
        timeout: Duration,
    },

    #[error("Link to sensor lost")]
    LinkLost,

    #[error("Peripheral {0} is not known to the adapter")]
    UnknownPeripheral(String),

    #[error("Required endpoint {endpoint} missing from service {service}")]
    MissingEndpoint { service: Uuid, endpoint: Uuid },

    #[error("Connection attempt cancelled")]
    Cancelled,

    #[error("Bluetooth transport error: {0}")]
    Transport(String),
}

impl From<bluest::Error> for ConnectionError {
    fn from(error: bluest::Error) -> Self {
        Self::Transport(error.to_string())
    }
}

/// Lifecycle failures reported by the sensor itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    /// The sensor reported an internal fault. Only re-pairing clears it.
    #[error("Sensor fault: {0}")]
    Fault(SensorFault),
}

/// Failures of commands sent to the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Already paired with sensor {0}; delete it first")]
    AlreadyPaired(String),

    #[error("Sensor session has stopped")]
    Stopped,
}
