//! Constants used throughout the sensor session
//! This module contains the UUIDs, timeouts, retry parameters and other
//! fixed values the G7 session relies on.

use uuid::Uuid;

/// Advertised name prefix of G7 transmitters ("DXCM" followed by two characters)
pub const SENSOR_NAME_PATTERN: &str = r"^DXCM[0-9A-Z]{2}$";

/// Standard Bluetooth Service UUIDs
pub const UUID_DEVICE_INFORMATION_SERVICE: Uuid = Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);

/// Standard Bluetooth Characteristic UUIDs
pub const UUID_MANUFACTURER_NAME: Uuid = Uuid::from_u128(0x00002a29_0000_1000_8000_00805f9b34fb);

/// Service advertised by the transmitter while it is looking for a receiver
pub const UUID_ADVERTISEMENT_SERVICE: Uuid = Uuid::from_u128(0x0000febc_0000_1000_8000_00805f9b34fb);

/// The UUID of the CGM service
pub const UUID_CGM_SERVICE: Uuid = Uuid::from_u128(0xf8083532_849e_531c_c594_30f1f86a4ea5);

/// CGM service characteristics
pub const UUID_COMMUNICATION_CHAR: Uuid = Uuid::from_u128(0xf8083533_849e_531c_c594_30f1f86a4ea5);
pub const UUID_CONTROL_CHAR: Uuid = Uuid::from_u128(0xf8083534_849e_531c_c594_30f1f86a4ea5);
pub const UUID_AUTHENTICATION_CHAR: Uuid = Uuid::from_u128(0xf8083535_849e_531c_c594_30f1f86a4ea5);
pub const UUID_BACKFILL_CHAR: Uuid = Uuid::from_u128(0xf8083536_849e_531c_c594_30f1f86a4ea5);

/// Secondary vendor service and its characteristics
pub const UUID_SERVICE_B: Uuid = Uuid::from_u128(0xf8084532_849e_531c_c594_30f1f86a4ea5);
pub const UUID_CHARACTERISTIC_E: Uuid = Uuid::from_u128(0xf8084533_849e_531c_c594_30f1f86a4ea5);
pub const UUID_CHARACTERISTIC_F: Uuid = Uuid::from_u128(0xf8084534_849e_531c_c594_30f1f86a4ea5);

/// Consecutive failed attempts before the session reports the sensor as unreachable
pub const MAX_CONNECT_RETRIES: u32 = 5;

/// Delay before the first reconnect attempt in milliseconds
pub const CONNECT_RETRY_DELAY_MS: u64 = 1000;

/// Upper bound of the reconnect backoff in milliseconds
pub const MAX_CONNECT_RETRY_DELAY_MS: u64 = 60_000;

/// Growth factor applied to the reconnect delay after each failure
pub const CONNECT_RETRY_MULTIPLIER: u32 = 2;

/// Timeout for Bluetooth operations in seconds
pub const BLUETOOTH_OPERATION_TIMEOUT_SECS: u64 = 10;

/// How long a single scan waits for the sensor to advertise, in seconds
pub const DEFAULT_SCAN_DURATION_SECS: u64 = 60;

/// Readings older than this trigger a backfill request after reconnecting
pub const BACKFILL_GAP_SECS: u64 = 10 * 60;

/// Advertisements weaker than this are ignored
pub const MIN_RSSI_THRESHOLD: i16 = -95;
