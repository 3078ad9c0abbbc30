//! Bluetooth functionality for the G7 CGM bridge
//! This module handles all bluetooth operations including scanning,
//! connecting, and receiving data from the G7 transmitter.

pub mod catalog;
mod commands;
pub mod connection;
pub mod constants;
mod manager;
pub mod mock;
mod notification;
mod observer;
mod scanner;
pub mod transport;
pub mod types;

// Re-export types that should be publicly accessible
pub use catalog::{AccessMode, Endpoint, EndpointDescriptor, Service};
pub use commands::{CommandExecutor, CommandSender, setup_commands};
pub use connection::{Backoff, BluestLink, BluestTransport, Timeouts};
pub use constants::*; // Re-export all constants
pub use manager::{CgmManager, SessionManager};
pub use mock::MockTransport;
pub use notification::NotificationHandler;
pub use observer::{ObserverRegistry, SensorEvent, StateObserver, SubscriptionId};
pub use scanner::BluetoothScanner;
pub use transport::{NotificationSink, SensorLink, SensorTransport};
pub use types::{
    BindPolicy, ConnectionStatus, DiscoveredSensor, RawNotification, ScanFilter,
    TransmitterIdentity,
};
