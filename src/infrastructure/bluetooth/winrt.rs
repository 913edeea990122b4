//! WinRT backend
//!
//! Implements [`BleTransport`] on top of the Windows Bluetooth APIs. Async
//! WinRT operations run on spawned tasks and report back through the event
//! channel. Every task carries the link generation it was started for, and
//! its result is dropped if `disconnect` has bumped the generation since.

use crate::domain::models::{CharacteristicHandle, Device};
use crate::infrastructure::bluetooth::connection::{self, Link};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::scanner::{self, BleScanner};
use crate::infrastructure::bluetooth::transport::{
    BleTransport, EventSender, TransportEvent, WriteId,
};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;
use windows::Devices::Bluetooth::BluetoothAdapter;
use windows::Devices::Bluetooth::GenericAttributeProfile::GattCharacteristic;

#[derive(Default)]
struct Shared {
    link: Option<Link>,
    characteristics: HashMap<Uuid, GattCharacteristic>,
    value_tokens: HashMap<Uuid, i64>,
}

pub struct WinRtTransport {
    available: bool,
    scanner: BleScanner,
    events: EventSender,
    shared: Arc<Mutex<Shared>>,
    generation: Arc<AtomicU64>,
}

/// Reports results of one spawned operation unless the link moved on
struct Reporter {
    events: EventSender,
    generation: Arc<AtomicU64>,
    started: u64,
}

impl Reporter {
    fn send(&self, event: TransportEvent) {
        if self.generation.load(Ordering::SeqCst) == self.started {
            let _ = self.events.send(event);
        } else {
            debug!("Dropping {:?} from a previous link", event);
        }
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl WinRtTransport {
    /// Probe the default adapter for Bluetooth LE support
    pub async fn new(events: EventSender) -> Self {
        let available = match probe_adapter().await {
            Ok(supported) => supported,
            Err(e) => {
                warn!("No usable Bluetooth adapter: {}", e);
                false
            }
        };
        Self {
            available,
            scanner: BleScanner::new(events.clone()),
            events,
            shared: Arc::new(Mutex::new(Shared::default())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    fn reporter(&self) -> Reporter {
        Reporter {
            events: self.events.clone(),
            generation: self.generation.clone(),
            started: self.generation.load(Ordering::SeqCst),
        }
    }

    fn characteristic(&self, handle: &CharacteristicHandle) -> Result<GattCharacteristic> {
        lock(&self.shared)
            .characteristics
            .get(&handle.uuid())
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Characteristic {} not discovered", handle.uuid()))
    }
}

async fn probe_adapter() -> Result<bool> {
    let adapter = BluetoothAdapter::GetDefaultAsync()?.await?;
    Ok(adapter.IsLowEnergySupported()?)
}

impl BleTransport for WinRtTransport {
    fn is_available(&self) -> bool {
        self.available
    }

    fn start_scan(&mut self, service: Uuid) -> Result<()> {
        self.scanner.start(service)
    }

    fn stop_scan(&mut self) {
        self.scanner.stop();
    }

    fn connect(&mut self, device: &Device) -> Result<()> {
        let address = scanner::parse_device_id(&device.id)?;
        let reporter = self.reporter();
        let shared = self.shared.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            match Link::open(address, events).await {
                Ok(link) => {
                    if reporter.generation.load(Ordering::SeqCst) != reporter.started {
                        link.close();
                        return;
                    }
                    lock(&shared).link = Some(link);
                    reporter.send(TransportEvent::Connected);
                }
                Err(e) => reporter.send(TransportEvent::ConnectFailed(e.to_string())),
            }
        });
        Ok(())
    }

    fn discover(&mut self, service: Uuid) -> Result<()> {
        let device = lock(&self.shared)
            .link
            .as_ref()
            .map(|link| link.device.clone())
            .ok_or_else(|| anyhow::anyhow!("Not connected"))?;
        let reporter = self.reporter();
        let shared = self.shared.clone();

        tokio::spawn(async move {
            match connection::characteristics(&device, service).await {
                Ok(found) => {
                    let mut uuids = Vec::with_capacity(found.len());
                    let mut guard = lock(&shared);
                    for characteristic in found {
                        if let Ok(guid) = characteristic.Uuid() {
                            let uuid = protocol::from_guid(guid);
                            uuids.push(uuid);
                            guard.characteristics.insert(uuid, characteristic);
                        }
                    }
                    drop(guard);
                    reporter.send(TransportEvent::ServicesDiscovered(uuids));
                }
                Err(e) => reporter.send(TransportEvent::DiscoveryFailed(e.to_string())),
            }
        });
        Ok(())
    }

    fn subscribe(&mut self, handle: &CharacteristicHandle) -> Result<()> {
        let characteristic = self.characteristic(handle)?;
        let token = connection::forward_indications(&characteristic, self.events.clone())?;
        lock(&self.shared).value_tokens.insert(handle.uuid(), token);

        let reporter = self.reporter();
        tokio::spawn(async move {
            if let Err(e) = connection::configure_indications(&characteristic, true).await {
                reporter.send(TransportEvent::LinkLost(format!(
                    "indications could not be enabled: {}",
                    e
                )));
            }
        });
        Ok(())
    }

    fn unsubscribe(&mut self, handle: &CharacteristicHandle) {
        let Ok(characteristic) = self.characteristic(handle) else {
            return;
        };
        if let Some(token) = lock(&self.shared).value_tokens.remove(&handle.uuid()) {
            let _ = characteristic.RemoveValueChanged(token);
        }
        tokio::spawn(async move {
            if let Err(e) = connection::configure_indications(&characteristic, false).await {
                debug!("Disabling indications failed: {}", e);
            }
        });
    }

    fn write(
        &mut self,
        handle: &CharacteristicHandle,
        id: WriteId,
        payload: &[u8],
        with_response: bool,
    ) -> Result<()> {
        let characteristic = self.characteristic(handle)?;
        let payload = payload.to_vec();
        let reporter = self.reporter();

        tokio::spawn(async move {
            let result = connection::write_value(&characteristic, &payload, with_response)
                .await
                .map_err(|e| e.to_string());
            if with_response {
                reporter.send(TransportEvent::WriteCompleted { id, result });
            } else if let Err(e) = result {
                warn!("Unacknowledged write failed: {}", e);
            }
        });
        Ok(())
    }

    fn disconnect(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.scanner.stop();

        let mut shared = lock(&self.shared);
        for (uuid, token) in shared.value_tokens.drain() {
            if let Some(characteristic) = shared.characteristics.get(&uuid) {
                let _ = characteristic.RemoveValueChanged(token);
            }
        }
        shared.characteristics.clear();
        if let Some(link) = shared.link.take() {
            debug!("Closing Bluetooth device");
            link.close();
        }
    }
}
