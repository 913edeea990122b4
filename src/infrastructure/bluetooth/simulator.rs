//! Simulated Peripheral
//!
//! An in-process stand-in for the ESP32 LED board. It advertises the
//! firmware's name, exposes the two characteristics, applies LED commands
//! the way the firmware does (trimmed, case-sensitive) and reports the
//! result as an indication. [`SimulatorControl`] lets a test or a demo
//! session script faults: dropped links, failing connects, withheld write
//! acknowledgements and raw indications.

use crate::domain::models::{CharacteristicHandle, Device};
use crate::infrastructure::bluetooth::protocol::{self, DEVICE_NAME};
use crate::infrastructure::bluetooth::transport::{
    BleTransport, EventSender, TransportEvent, WriteId,
};
use anyhow::Result;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;
use uuid::Uuid;

pub const SIMULATED_DEVICE_ID: &str = "sim:3C:61:05:12:AB:CD";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RgbColor {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl RgbColor {
    pub const fn new(red: u8, green: u8, blue: u8) -> Self {
        Self { red, green, blue }
    }

    pub const fn black() -> Self {
        Self::new(0, 0, 0)
    }
}

#[derive(Debug)]
struct Peripheral {
    available: bool,
    name: String,
    advertising: bool,
    bystanders: Vec<String>,
    characteristics: Vec<Uuid>,
    connect_failures: u32,
    hang_connects: bool,
    hold_acks: bool,
    echo: bool,
    scanning: bool,
    linked: bool,
    subscribed: bool,
    led: RgbColor,
    writes: Vec<Vec<u8>>,
    pending_acks: VecDeque<WriteId>,
    connects: u32,
}

impl Default for Peripheral {
    fn default() -> Self {
        Self {
            available: true,
            name: DEVICE_NAME.to_string(),
            advertising: true,
            bystanders: Vec::new(),
            characteristics: vec![protocol::WRITE_CHAR_UUID, protocol::INDICATE_CHAR_UUID],
            connect_failures: 0,
            hang_connects: false,
            hold_acks: false,
            echo: true,
            scanning: false,
            linked: false,
            subscribed: false,
            led: RgbColor::black(),
            writes: Vec::new(),
            pending_acks: VecDeque::new(),
            connects: 0,
        }
    }
}

impl Peripheral {
    fn device(&self) -> Device {
        Device::discovered(SIMULATED_DEVICE_ID, self.name.clone())
    }

    fn drop_link(&mut self) {
        self.linked = false;
        self.subscribed = false;
        self.pending_acks.clear();
    }

    /// Same handling as the firmware's receive loop
    fn apply(&mut self, payload: &[u8]) -> String {
        let text = String::from_utf8_lossy(payload);
        let color = match text.trim() {
            "red" => Some(RgbColor::new(255, 0, 0)),
            "green" => Some(RgbColor::new(0, 255, 0)),
            "blue" => Some(RgbColor::new(0, 0, 255)),
            "off" => Some(RgbColor::black()),
            _ => None,
        };
        match color {
            Some(color) => {
                self.led = color;
                format!("led {}\n", text.trim())
            }
            None => format!("unknown command: {}\n", text),
        }
    }
}

fn lock(shared: &Mutex<Peripheral>) -> MutexGuard<'_, Peripheral> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Transport half, owned by the connection manager
pub struct SimulatedTransport {
    shared: Arc<Mutex<Peripheral>>,
    events: EventSender,
}

/// Scripting half, kept by the caller
#[derive(Clone)]
pub struct SimulatorControl {
    shared: Arc<Mutex<Peripheral>>,
    events: EventSender,
}

/// Create a simulated board reporting through `events`
pub fn simulated(events: EventSender) -> (SimulatedTransport, SimulatorControl) {
    let shared = Arc::new(Mutex::new(Peripheral::default()));
    (
        SimulatedTransport {
            shared: shared.clone(),
            events: events.clone(),
        },
        SimulatorControl { shared, events },
    )
}

impl SimulatedTransport {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

impl BleTransport for SimulatedTransport {
    fn is_available(&self) -> bool {
        lock(&self.shared).available
    }

    fn start_scan(&mut self, service: Uuid) -> Result<()> {
        let mut peripheral = lock(&self.shared);
        if !peripheral.available {
            anyhow::bail!("simulated adapter is off");
        }
        debug!("Simulated scan for {}", service);
        peripheral.scanning = true;
        for (i, name) in peripheral.bystanders.iter().enumerate() {
            self.emit(TransportEvent::DeviceDiscovered(Device::discovered(
                format!("sim:bystander:{}", i),
                name.clone(),
            )));
        }
        if peripheral.advertising {
            self.emit(TransportEvent::DeviceDiscovered(peripheral.device()));
        }
        Ok(())
    }

    fn stop_scan(&mut self) {
        lock(&self.shared).scanning = false;
    }

    fn connect(&mut self, device: &Device) -> Result<()> {
        let mut peripheral = lock(&self.shared);
        if device.id != SIMULATED_DEVICE_ID {
            anyhow::bail!("unknown simulated device {}", device.id);
        }
        peripheral.connects += 1;
        if peripheral.hang_connects {
            return Ok(());
        }
        if peripheral.connect_failures > 0 {
            peripheral.connect_failures -= 1;
            self.emit(TransportEvent::ConnectFailed(
                "simulated link failure".to_string(),
            ));
            return Ok(());
        }
        peripheral.linked = true;
        self.emit(TransportEvent::Connected);
        Ok(())
    }

    fn discover(&mut self, service: Uuid) -> Result<()> {
        let peripheral = lock(&self.shared);
        if !peripheral.linked {
            self.emit(TransportEvent::DiscoveryFailed("not linked".to_string()));
        } else if service == protocol::SERVICE_UUID {
            self.emit(TransportEvent::ServicesDiscovered(
                peripheral.characteristics.clone(),
            ));
        } else {
            self.emit(TransportEvent::ServicesDiscovered(Vec::new()));
        }
        Ok(())
    }

    fn subscribe(&mut self, characteristic: &CharacteristicHandle) -> Result<()> {
        let mut peripheral = lock(&self.shared);
        if !peripheral.linked {
            anyhow::bail!("not linked");
        }
        if !peripheral.characteristics.contains(&characteristic.uuid()) {
            anyhow::bail!("no characteristic {}", characteristic.uuid());
        }
        peripheral.subscribed = true;
        Ok(())
    }

    fn unsubscribe(&mut self, _characteristic: &CharacteristicHandle) {
        lock(&self.shared).subscribed = false;
    }

    fn write(
        &mut self,
        _characteristic: &CharacteristicHandle,
        id: WriteId,
        payload: &[u8],
        with_response: bool,
    ) -> Result<()> {
        let mut peripheral = lock(&self.shared);
        if !peripheral.linked {
            anyhow::bail!("not linked");
        }
        peripheral.writes.push(payload.to_vec());
        let reply = peripheral.apply(payload);
        if peripheral.echo && peripheral.subscribed {
            self.emit(TransportEvent::Indication(reply.into_bytes()));
        }
        if with_response {
            if peripheral.hold_acks {
                peripheral.pending_acks.push_back(id);
            } else {
                self.emit(TransportEvent::WriteCompleted { id, result: Ok(()) });
            }
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut peripheral = lock(&self.shared);
        peripheral.scanning = false;
        peripheral.drop_link();
    }
}

impl SimulatorControl {
    fn peripheral(&self) -> MutexGuard<'_, Peripheral> {
        lock(&self.shared)
    }

    /// Pretend the host has no Bluetooth LE adapter
    pub fn set_available(&self, available: bool) {
        self.peripheral().available = available;
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.peripheral().name = name.into();
    }

    /// Start or stop advertising. Starting while a scan runs reports the device.
    pub fn set_advertising(&self, advertising: bool) {
        let mut peripheral = self.peripheral();
        peripheral.advertising = advertising;
        if advertising && peripheral.scanning {
            let _ = self
                .events
                .send(TransportEvent::DeviceDiscovered(peripheral.device()));
        }
    }

    /// Other devices reported by every scan
    pub fn add_bystander(&self, name: impl Into<String>) {
        self.peripheral().bystanders.push(name.into());
    }

    /// Characteristics exposed in the LED service
    pub fn set_characteristics(&self, characteristics: Vec<Uuid>) {
        self.peripheral().characteristics = characteristics;
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.peripheral().connect_failures = count;
    }

    /// Accept `connect` but never answer it
    pub fn hang_connects(&self, hang: bool) {
        self.peripheral().hang_connects = hang;
    }

    /// Keep write acknowledgements until [`ack_next_write`](Self::ack_next_write)
    pub fn hold_acks(&self, hold: bool) {
        self.peripheral().hold_acks = hold;
    }

    pub fn set_echo(&self, echo: bool) {
        self.peripheral().echo = echo;
    }

    /// Complete the oldest withheld write. Returns false if none was pending.
    pub fn ack_next_write(&self, result: Result<(), String>) -> bool {
        let mut peripheral = self.peripheral();
        match peripheral.pending_acks.pop_front() {
            Some(id) => {
                let _ = self
                    .events
                    .send(TransportEvent::WriteCompleted { id, result });
                true
            }
            None => false,
        }
    }

    /// Drop the link as if the board reset or went out of range
    pub fn drop_link(&self, reason: &str) {
        let mut peripheral = self.peripheral();
        if peripheral.linked {
            peripheral.drop_link();
            let _ = self
                .events
                .send(TransportEvent::LinkLost(reason.to_string()));
        }
    }

    /// Deliver raw bytes on the indicate characteristic
    pub fn inject_indication(&self, bytes: &[u8]) -> bool {
        let peripheral = self.peripheral();
        if !peripheral.subscribed {
            return false;
        }
        let _ = self
            .events
            .send(TransportEvent::Indication(bytes.to_vec()));
        true
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.peripheral().writes.clone()
    }

    pub fn led(&self) -> RgbColor {
        self.peripheral().led
    }

    pub fn is_linked(&self) -> bool {
        self.peripheral().linked
    }

    pub fn is_subscribed(&self) -> bool {
        self.peripheral().subscribed
    }

    pub fn is_scanning(&self) -> bool {
        self.peripheral().scanning
    }

    pub fn connect_attempts(&self) -> u32 {
        self.peripheral().connects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::transport::event_channel;

    #[test]
    fn test_scan_reports_bystanders_then_board() {
        let (tx, mut rx) = event_channel();
        let (mut transport, control) = simulated(tx);
        control.add_bystander("Headphones");
        transport.start_scan(protocol::SERVICE_UUID).unwrap();

        match rx.try_recv().unwrap() {
            TransportEvent::DeviceDiscovered(device) => assert_eq!(device.name, "Headphones"),
            other => panic!("unexpected {:?}", other),
        }
        match rx.try_recv().unwrap() {
            TransportEvent::DeviceDiscovered(device) => {
                assert_eq!(device.name, DEVICE_NAME);
                assert!(device.discovered);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_write_applies_led_and_echoes() {
        let (tx, mut rx) = event_channel();
        let (mut transport, control) = simulated(tx);
        let device = Device::discovered(SIMULATED_DEVICE_ID, DEVICE_NAME);
        transport.connect(&device).unwrap();
        assert_eq!(rx.try_recv().unwrap(), TransportEvent::Connected);

        let indicate = CharacteristicHandle(protocol::INDICATE_CHAR_UUID);
        let write = CharacteristicHandle(protocol::WRITE_CHAR_UUID);
        transport.subscribe(&indicate).unwrap();
        transport.write(&write, 7, b"green", true).unwrap();

        assert_eq!(control.led(), RgbColor::new(0, 255, 0));
        assert_eq!(
            rx.try_recv().unwrap(),
            TransportEvent::Indication(b"led green\n".to_vec())
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            TransportEvent::WriteCompleted { id: 7, result: Ok(()) }
        );
    }

    #[test]
    fn test_unknown_command_leaves_led() {
        let mut peripheral = Peripheral::default();
        assert_eq!(peripheral.apply(b"blink"), "unknown command: blink\n");
        assert_eq!(peripheral.led, RgbColor::black());
        assert_eq!(peripheral.apply(b" red \r\n"), "led red\n");
        assert_eq!(peripheral.led, RgbColor::new(255, 0, 0));
    }

    #[test]
    fn test_disconnect_is_silent() {
        let (tx, mut rx) = event_channel();
        let (mut transport, control) = simulated(tx);
        let device = Device::discovered(SIMULATED_DEVICE_ID, DEVICE_NAME);
        transport.connect(&device).unwrap();
        let _ = rx.try_recv();
        transport.disconnect();
        assert!(!control.is_linked());
        control.drop_link("gone");
        assert!(rx.try_recv().is_err());
    }
}
