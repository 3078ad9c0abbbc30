use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use bluest::{Adapter, Device};
use futures_util::StreamExt;
use log::{debug, info};
use regex::Regex;

use crate::core::bluetooth::constants::UUID_ADVERTISEMENT_SERVICE;
use crate::core::bluetooth::types::{DiscoveredSensor, ScanFilter, TransmitterIdentity};
use crate::error::ConnectionError;

/// Finds G7 transmitters and remembers the `Device` handles it has seen.
#[derive(Clone)]
pub struct BluetoothScanner {
    adapter: Adapter,
    devices: Arc<Mutex<HashMap<String, Device>>>,
    min_rssi_threshold: i16,
}

impl BluetoothScanner {
    pub fn new(adapter: Adapter, min_rssi_threshold: i16) -> Self {
        Self {
            adapter,
            devices: Arc::new(Mutex::new(HashMap::new())),
            min_rssi_threshold,
        }
    }

    /// Device handle of a previously discovered peripheral.
    pub fn device(&self, peripheral_id: &str) -> Option<Device> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peripheral_id)
            .cloned()
    }

    /// Waits for a peripheral matching `filter`. Peripherals already connected
    /// to the host are checked first. Dropping the future stops the scan.
    pub async fn find(&self, filter: &ScanFilter) -> Result<DiscoveredSensor, ConnectionError> {
        info!("Checking for connected devices");
        for device in self.adapter.connected_devices().await? {
            if let Some(identity) = device.name().ok().filter(|name| filter.matches(name)) {
                return Ok(self.remember(device, TransmitterIdentity::new(identity), None));
            }
        }
        debug!("No connected sensor matches {:?}", filter);

        info!("Starting bluetooth scan");
        let mut scan_stream = self.adapter.scan(&[UUID_ADVERTISEMENT_SERVICE]).await?;

        while let Some(discovered_device) = scan_stream.next().await {
            let device = discovered_device.device;
            let rssi = discovered_device.rssi;
            debug!("Found device - Device: {:?}, RSSI: {:?}", device, rssi);

            // Only include devices with medium or stronger signal strength
            if rssi.is_some_and(|signal_strength| signal_strength < self.min_rssi_threshold) {
                continue;
            }
            let name = discovered_device
                .adv_data
                .local_name
                .or_else(|| device.name().ok());
            if let Some(name) = name.filter(|name| filter.matches(name)) {
                return Ok(self.remember(device, TransmitterIdentity::new(name), rssi));
            }
        }

        info!("Bluetooth scan stream has ended.");
        Err(ConnectionError::Transport("scan stream ended".into()))
    }

    fn remember(&self, device: Device, identity: TransmitterIdentity, rssi: Option<i16>) -> DiscoveredSensor {
        let id = device.id().to_string();
        let address = extract_mac_address(&id).unwrap_or_else(|| "N/A".to_string());
        info!(
            "Found sensor device: Address: {}, ID: {}, Name: {}, RSSI: {:?}",
            address, id, identity, rssi
        );

        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), device);

        DiscoveredSensor {
            identity,
            peripheral_id: id,
            rssi,
        }
    }
}

fn extract_mac_address(device_id_str: &str) -> Option<String> {
    let re = Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").ok()?;
    re.find_iter(device_id_str)
        .last()
        .map(|m| m.as_str().to_uppercase())
}
