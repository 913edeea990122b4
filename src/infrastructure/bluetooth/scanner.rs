//! BLE Scanner Module
//!
//! Advertisement watcher that reports named devices as
//! [`TransportEvent::DeviceDiscovered`]. Name matching is left to the
//! connection manager.

use crate::domain::models::Device;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{EventSender, TransportEvent};
use anyhow::Result;
use tracing::{debug, info};
use uuid::Uuid;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEScanningMode,
};
use windows::Foundation::TypedEventHandler;

/// Bluetooth addresses are used as device ids
pub fn device_id(address: u64) -> String {
    format!("{:012X}", address)
}

pub fn parse_device_id(id: &str) -> Result<u64> {
    u64::from_str_radix(id, 16).map_err(|_| anyhow::anyhow!("Invalid device id: {}", id))
}

pub struct BleScanner {
    watcher: Option<BluetoothLEAdvertisementWatcher>,
    events: EventSender,
}

impl BleScanner {
    pub fn new(events: EventSender) -> Self {
        Self {
            watcher: None,
            events,
        }
    }

    /// Start an active scan. Devices advertising `service` are reported even
    /// when their name only arrives in a later scan response.
    pub fn start(&mut self, service: Uuid) -> Result<()> {
        self.stop();
        info!("Starting BLE scan for service {}", service);

        let watcher = BluetoothLEAdvertisementWatcher::new()?;
        watcher.SetScanningMode(BluetoothLEScanningMode::Active)?;

        let sender = self.events.clone();
        let target = protocol::to_guid(service);
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let adv = args.Advertisement()?;
                    let name = adv.LocalName()?.to_string();
                    let uuids = adv.ServiceUuids()?;
                    let mut advertises_service = false;
                    for i in 0..uuids.Size()? {
                        if uuids.GetAt(i)? == target {
                            advertises_service = true;
                            break;
                        }
                    }

                    if !name.is_empty() || advertises_service {
                        let device = Device::discovered(device_id(args.BluetoothAddress()?), name);
                        let _ = sender.send(TransportEvent::DeviceDiscovered(device));
                    }
                }
                Ok(())
            },
        );

        watcher.Received(&handler)?;
        watcher.Start()?;
        self.watcher = Some(watcher);
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            debug!("Stopping BLE scan");
            let _ = watcher.Stop();
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.watcher.is_some()
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_round_trips_address() {
        let id = device_id(0x3C61_0512_ABCD);
        assert_eq!(id, "3C610512ABCD");
        assert_eq!(parse_device_id(&id).unwrap(), 0x3C61_0512_ABCD);
        assert!(parse_device_id("sim:device").is_err());
    }
}
