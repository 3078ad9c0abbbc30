//! Wire codec for G7 transmitter messages
//! Every framed message is `opcode | version | body | crc16 (LE)`. Decoding is
//! all-or-nothing: a payload either yields a complete message or a
//! [`CodecError::Malformed`].

use crate::core::bluetooth::catalog::Endpoint;
use crate::core::messages::{
    AlgorithmState, AuthChallenge, AuthStatus, BackfillComplete, BackfillRecord, Concentration,
    DecodedMessage, GlucoseMessage, GlucoseValue, OutgoingCommand, ResponseStatus, StatusFlags,
    TimeSyncResponse, TrendRate,
};
use crate::error::{CodecError, MalformedReason};

pub const PROTOCOL_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 2;
pub const CRC_LEN: usize = 2;
pub const MIN_FRAME_LEN: usize = HEADER_LEN + CRC_LEN;

pub const OPCODE_AUTH_REQUEST: u8 = 0x01;
pub const OPCODE_AUTH_CHALLENGE: u8 = 0x03;
pub const OPCODE_AUTH_STATUS: u8 = 0x05;
pub const OPCODE_BOND_REQUEST: u8 = 0x07;
pub const OPCODE_TIME_SYNC_REQUEST: u8 = 0x24;
pub const OPCODE_TIME_SYNC_RESPONSE: u8 = 0x25;
pub const OPCODE_GLUCOSE: u8 = 0x4e;
/// Backfill request on write, completion report on indicate.
pub const OPCODE_BACKFILL: u8 = 0x59;
pub const OPCODE_BACKFILL_RECORD: u8 = 0x5a;

const GLUCOSE_BODY_LEN: usize = 14;
const BACKFILL_RECORD_BODY_LEN: usize = 10;
const AUTH_CHALLENGE_BODY_LEN: usize = 8;
const AUTH_STATUS_BODY_LEN: usize = 2;
const TIME_SYNC_RESPONSE_BODY_LEN: usize = 5;
const BACKFILL_COMPLETE_BODY_LEN: usize = 3;

const GLUCOSE_NOT_AVAILABLE: u16 = 0xfffc;
const GLUCOSE_BELOW_RANGE: u16 = 0xfffd;
const GLUCOSE_ABOVE_RANGE: u16 = 0xfffe;
const GLUCOSE_SENSOR_FAULT: u16 = 0xffff;
const PREDICTED_ABSENT: u16 = 0xffff;

/// A validated frame borrowed from the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub opcode: u8,
    pub version: u8,
    pub body: &'a [u8],
}

/// Checks length, version byte and CRC of a framed payload.
pub fn open_frame(endpoint: Endpoint, bytes: &[u8]) -> Result<Frame<'_>, CodecError> {
    let malformed = |reason| CodecError::malformed(endpoint, bytes.len(), reason);
    if bytes.len() < MIN_FRAME_LEN {
        return Err(malformed(MalformedReason::TooShort));
    }

    let (content, trailer) = bytes.split_at(bytes.len() - CRC_LEN);
    let crc_frame = u16::from_le_bytes([trailer[0], trailer[1]]);
    if crc16_ccitt_false(content) != crc_frame {
        return Err(malformed(MalformedReason::BadChecksum));
    }

    let version = content[1];
    if version == 0 {
        return Err(malformed(MalformedReason::BadVersion(version)));
    }

    Ok(Frame {
        opcode: content[0],
        version,
        body: &content[HEADER_LEN..],
    })
}

/// Builds a frame around `body`.
pub fn seal_frame(opcode: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + body.len() + CRC_LEN);
    out.push(opcode);
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(body);
    let crc = crc16_ccitt_false(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

/// Decodes a payload received on `endpoint`.
pub fn decode(endpoint: Endpoint, bytes: &[u8]) -> Result<DecodedMessage, CodecError> {
    if endpoint == Endpoint::ManufacturerName {
        return String::from_utf8(bytes.to_vec())
            .map(DecodedMessage::ManufacturerName)
            .map_err(|_| CodecError::malformed(endpoint, bytes.len(), MalformedReason::BadEncoding));
    }

    let frame = open_frame(endpoint, bytes)?;
    if frame.version != PROTOCOL_VERSION {
        return Ok(unrecognized(endpoint, &frame));
    }

    let body = Body {
        endpoint,
        frame_len: bytes.len(),
        bytes: frame.body,
    };
    let message = match (endpoint, frame.opcode) {
        (Endpoint::Communication | Endpoint::Control, OPCODE_GLUCOSE) => {
            DecodedMessage::Glucose(decode_glucose(&body)?)
        }
        (Endpoint::Control, OPCODE_TIME_SYNC_RESPONSE) => {
            body.expect_len(TIME_SYNC_RESPONSE_BODY_LEN)?;
            DecodedMessage::TimeSync(TimeSyncResponse {
                status: ResponseStatus::from_byte(body.u8(0)),
                sensor_time: body.u32(1),
            })
        }
        (Endpoint::Control, OPCODE_BACKFILL) => {
            body.expect_len(BACKFILL_COMPLETE_BODY_LEN)?;
            DecodedMessage::BackfillComplete(BackfillComplete {
                status: ResponseStatus::from_byte(body.u8(0)),
                record_count: body.u16(1),
            })
        }
        (Endpoint::Backfill, OPCODE_BACKFILL_RECORD) => {
            DecodedMessage::Backfill(decode_backfill_record(&body)?)
        }
        (Endpoint::Authentication, OPCODE_AUTH_CHALLENGE) => {
            body.expect_len(AUTH_CHALLENGE_BODY_LEN)?;
            let mut challenge = [0u8; AUTH_CHALLENGE_BODY_LEN];
            challenge.copy_from_slice(body.bytes);
            DecodedMessage::AuthChallenge(AuthChallenge { challenge })
        }
        (Endpoint::Authentication, OPCODE_AUTH_STATUS) => {
            body.expect_len(AUTH_STATUS_BODY_LEN)?;
            DecodedMessage::AuthStatus(AuthStatus {
                authenticated: decode_bool(&body, 0)?,
                bonded: decode_bool(&body, 1)?,
            })
        }
        _ => unrecognized(endpoint, &frame),
    };
    Ok(message)
}

/// Serializes an outbound command.
pub fn encode(command: &OutgoingCommand) -> Vec<u8> {
    match *command {
        OutgoingCommand::AuthRequest { token, slot } => {
            let mut body = token.to_vec();
            body.push(slot);
            seal_frame(OPCODE_AUTH_REQUEST, &body)
        }
        OutgoingCommand::BondRequest => seal_frame(OPCODE_BOND_REQUEST, &[]),
        OutgoingCommand::TimeSyncRequest { host_time } => {
            seal_frame(OPCODE_TIME_SYNC_REQUEST, &host_time.to_le_bytes())
        }
        OutgoingCommand::BackfillRequest { start, end } => {
            let mut body = start.to_le_bytes().to_vec();
            body.extend_from_slice(&end.to_le_bytes());
            seal_frame(OPCODE_BACKFILL, &body)
        }
    }
}

impl GlucoseMessage {
    /// Parses a glucose frame as received on the communication endpoint.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let endpoint = Endpoint::Communication;
        let frame = open_frame(endpoint, bytes)?;
        let body = Body {
            endpoint,
            frame_len: bytes.len(),
            bytes: frame.body,
        };
        if frame.opcode != OPCODE_GLUCOSE {
            return Err(body.malformed(MalformedReason::UnexpectedOpcode(frame.opcode)));
        }
        if frame.version != PROTOCOL_VERSION {
            return Err(body.malformed(MalformedReason::BadVersion(frame.version)));
        }
        decode_glucose(&body)
    }

    /// The exact wire frame of this reading.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(GLUCOSE_BODY_LEN);
        body.extend_from_slice(&self.message_timestamp.to_le_bytes());
        body.extend_from_slice(&self.sequence.to_le_bytes());
        body.push(self.age);
        body.push(self.algorithm_state.to_byte());
        body.extend_from_slice(&encode_glucose_value(self.glucose).to_le_bytes());
        body.push(self.trend.map_or(TrendRate::UNKNOWN, TrendRate::tenths) as u8);
        let predicted = self.predicted.map_or(PREDICTED_ABSENT, Concentration::tenths);
        body.extend_from_slice(&predicted.to_le_bytes());
        body.push(self.flags.bits());
        seal_frame(OPCODE_GLUCOSE, &body)
    }
}

impl BackfillRecord {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(BACKFILL_RECORD_BODY_LEN);
        body.extend_from_slice(&self.timestamp.to_le_bytes());
        body.extend_from_slice(&self.sequence.to_le_bytes());
        body.extend_from_slice(&encode_glucose_value(self.glucose).to_le_bytes());
        body.push(self.algorithm_state.to_byte());
        body.push(self.flags.bits());
        seal_frame(OPCODE_BACKFILL_RECORD, &body)
    }
}

fn decode_glucose(body: &Body<'_>) -> Result<GlucoseMessage, CodecError> {
    body.expect_len(GLUCOSE_BODY_LEN)?;
    let predicted = match body.u16(11) {
        PREDICTED_ABSENT => None,
        tenths => Some(Concentration::from_tenths(tenths).ok_or_else(|| body.malformed(MalformedReason::ReservedValue))?),
    };
    Ok(GlucoseMessage {
        message_timestamp: body.u32(0),
        sequence: body.u16(4),
        age: body.u8(6),
        algorithm_state: AlgorithmState::from_byte(body.u8(7)),
        glucose: decode_glucose_value(body, body.u16(8))?,
        trend: TrendRate::from_tenths(body.u8(10) as i8),
        predicted,
        flags: StatusFlags::from_bits(body.u8(13)),
    })
}

fn decode_backfill_record(body: &Body<'_>) -> Result<BackfillRecord, CodecError> {
    body.expect_len(BACKFILL_RECORD_BODY_LEN)?;
    Ok(BackfillRecord {
        timestamp: body.u32(0),
        sequence: body.u16(4),
        glucose: decode_glucose_value(body, body.u16(6))?,
        algorithm_state: AlgorithmState::from_byte(body.u8(8)),
        flags: StatusFlags::from_bits(body.u8(9)),
    })
}

fn decode_glucose_value(body: &Body<'_>, raw: u16) -> Result<GlucoseValue, CodecError> {
    let value = match raw {
        GLUCOSE_NOT_AVAILABLE => GlucoseValue::NotAvailable,
        GLUCOSE_BELOW_RANGE => GlucoseValue::BelowRange,
        GLUCOSE_ABOVE_RANGE => GlucoseValue::AboveRange,
        GLUCOSE_SENSOR_FAULT => GlucoseValue::SensorFault,
        tenths => GlucoseValue::Measured(
            Concentration::from_tenths(tenths).ok_or_else(|| body.malformed(MalformedReason::ReservedValue))?,
        ),
    };
    Ok(value)
}

fn encode_glucose_value(value: GlucoseValue) -> u16 {
    match value {
        GlucoseValue::Measured(concentration) => concentration.tenths(),
        GlucoseValue::NotAvailable => GLUCOSE_NOT_AVAILABLE,
        GlucoseValue::BelowRange => GLUCOSE_BELOW_RANGE,
        GlucoseValue::AboveRange => GLUCOSE_ABOVE_RANGE,
        GlucoseValue::SensorFault => GLUCOSE_SENSOR_FAULT,
    }
}

fn decode_bool(body: &Body<'_>, index: usize) -> Result<bool, CodecError> {
    match body.u8(index) {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(body.malformed(MalformedReason::ReservedValue)),
    }
}

fn unrecognized(endpoint: Endpoint, frame: &Frame<'_>) -> DecodedMessage {
    DecodedMessage::Unrecognized {
        endpoint,
        opcode: frame.opcode,
        version: frame.version,
        body: frame.body.to_vec(),
    }
}

/// Little-endian field access into a length-checked body.
struct Body<'a> {
    endpoint: Endpoint,
    frame_len: usize,
    bytes: &'a [u8],
}

impl Body<'_> {
    fn malformed(&self, reason: MalformedReason) -> CodecError {
        CodecError::malformed(self.endpoint, self.frame_len, reason)
    }

    fn expect_len(&self, expected: usize) -> Result<(), CodecError> {
        if self.bytes.len() == expected {
            Ok(())
        } else {
            Err(self.malformed(MalformedReason::BadLength { expected }))
        }
    }

    fn u8(&self, offset: usize) -> u8 {
        self.bytes[offset]
    }

    fn u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.bytes[offset], self.bytes[offset + 1]])
    }

    fn u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes([
            self.bytes[offset],
            self.bytes[offset + 1],
            self.bytes[offset + 2],
            self.bytes[offset + 3],
        ])
    }
}

pub fn crc16_ccitt_false(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0xffff;
    for &b in bytes {
        crc ^= (b as u16) << 8;
        for _ in 0..8 {
            if (crc & 0x8000) != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}
