//! G7 CGM bridge library
//! Session and protocol layer for G7 continuous glucose monitor transmitters.

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod store;
pub mod utils;

pub use crate::config::{AppConfig, SensorConfig, SessionConfig};
pub use crate::core::bluetooth::{
    BindPolicy, BluestTransport, ConnectionStatus, MockTransport, SensorEvent, StateObserver,
    SubscriptionId, TransmitterIdentity,
};
pub use crate::core::{
    CgmManager, GlucoseMessage, LifecycleState, LifecycleStatus, ManagerState, SensorTimings,
    SessionManager,
};
pub use crate::error::{CodecError, ConnectionError, LifecycleError, SessionError};
pub use crate::store::StateStore;
