//! BLE Transport
//!
//! The seam between the connection manager and a platform Bluetooth stack.
//! Every operation returns as soon as it has been issued; its outcome is
//! delivered later as a [`TransportEvent`] on the channel the backend was
//! created with.

use crate::domain::models::{CharacteristicHandle, Device};
use anyhow::Result;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Identifies one write so its completion can be matched to the command slot
pub type WriteId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Advertisement received while scanning
    DeviceDiscovered(Device),
    /// Link established after `connect`
    Connected,
    ConnectFailed(String),
    /// Characteristics found in the requested service (empty if the service is absent)
    ServicesDiscovered(Vec<Uuid>),
    DiscoveryFailed(String),
    /// Raw value of one indication
    Indication(Vec<u8>),
    WriteCompleted {
        id: WriteId,
        result: Result<(), String>,
    },
    /// Link dropped without being asked to
    LinkLost(String),
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Operations a Bluetooth LE backend provides to the connection manager
pub trait BleTransport: Send {
    /// Whether the host has a usable Bluetooth LE adapter
    fn is_available(&self) -> bool;

    fn start_scan(&mut self, service: Uuid) -> Result<()>;

    fn stop_scan(&mut self);

    fn connect(&mut self, device: &Device) -> Result<()>;

    /// Enumerate the characteristics of `service` on the connected device
    fn discover(&mut self, service: Uuid) -> Result<()>;

    /// Enable indications and start forwarding them
    fn subscribe(&mut self, characteristic: &CharacteristicHandle) -> Result<()>;

    fn unsubscribe(&mut self, characteristic: &CharacteristicHandle);

    /// Write `payload`. With `with_response` the backend reports `WriteCompleted` for `id`.
    fn write(
        &mut self,
        characteristic: &CharacteristicHandle,
        id: WriteId,
        payload: &[u8],
        with_response: bool,
    ) -> Result<()>;

    /// Tear down the link and cancel anything outstanding. No events follow.
    fn disconnect(&mut self);
}

/// Backend for hosts without Bluetooth LE support
#[derive(Debug, Default)]
pub struct UnavailableTransport;

impl BleTransport for UnavailableTransport {
    fn is_available(&self) -> bool {
        false
    }

    fn start_scan(&mut self, _service: Uuid) -> Result<()> {
        anyhow::bail!("Bluetooth LE is not supported on this platform")
    }

    fn stop_scan(&mut self) {}

    fn connect(&mut self, _device: &Device) -> Result<()> {
        anyhow::bail!("Bluetooth LE is not supported on this platform")
    }

    fn discover(&mut self, _service: Uuid) -> Result<()> {
        anyhow::bail!("Bluetooth LE is not supported on this platform")
    }

    fn subscribe(&mut self, _characteristic: &CharacteristicHandle) -> Result<()> {
        anyhow::bail!("Bluetooth LE is not supported on this platform")
    }

    fn unsubscribe(&mut self, _characteristic: &CharacteristicHandle) {}

    fn write(
        &mut self,
        _characteristic: &CharacteristicHandle,
        _id: WriteId,
        _payload: &[u8],
        _with_response: bool,
    ) -> Result<()> {
        anyhow::bail!("Bluetooth LE is not supported on this platform")
    }

    fn disconnect(&mut self) {}
}
