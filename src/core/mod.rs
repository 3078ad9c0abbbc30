//! Core functionality for the G7 CGM bridge
//! This module contains the protocol, session and lifecycle logic for a
//! G7 transmitter.

pub mod bluetooth;
pub mod codec;
pub mod manager_state;
pub mod messages;
pub mod sensor;

// Re-export commonly used types
pub use bluetooth::{CgmManager, SessionManager};
pub use manager_state::{ManagerState, RawState, RawValue};
pub use messages::{DecodedMessage, GlucoseMessage, OutgoingCommand};
pub use sensor::{LifecycleState, LifecycleStatus, SensorTimings};
