//! Bluetooth Module
//!
//! BLE client for the ESP32 LED board.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  ConnectionManager                       │
//! │   (state machine task - public API for the application)  │
//! └──────┬──────────────┬───────────────┬───────────────────┘
//!        │              │               │
//!        ▼              ▼               ▼
//! ┌────────────┐ ┌──────────────┐ ┌──────────┐
//! │  Command   │ │ Notification │ │ Protocol │
//! │  Channel   │ │   Channel    │ │          │
//! │ - one write│ │ - reassembly │ │ - UUIDs  │
//! │   in flight│ │ - decoding   │ │ - codec  │
//! └─────┬──────┘ └──────┬───────┘ └──────────┘
//!       └───────┬───────┘
//!               ▼
//!        dyn BleTransport ── WinRT (Windows) | simulator | unavailable
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - UUIDs, command set and codec
//! - [`transport`] - the backend trait and its events
//! - [`command`] - single-flight command writes
//! - [`notification`] - indication reassembly into log entries
//! - [`service`] - the connection manager
//! - [`simulator`] - in-process ESP32 peripheral
//! - `scanner`, `connection`, `winrt` - the Windows backend

pub mod command;
pub mod notification;
pub mod protocol;
pub mod service;
pub mod simulator;
pub mod transport;

#[cfg(windows)]
pub mod connection;
#[cfg(windows)]
pub mod scanner;
#[cfg(windows)]
pub mod winrt;

pub use service::ConnectionManager;
pub use transport::{event_channel, BleTransport, EventReceiver, EventSender, TransportEvent};

/// The Bluetooth backend of this host
#[cfg(windows)]
pub async fn platform_transport(events: EventSender) -> Box<dyn BleTransport> {
    Box::new(winrt::WinRtTransport::new(events).await)
}

/// The Bluetooth backend of this host
#[cfg(not(windows))]
pub async fn platform_transport(_events: EventSender) -> Box<dyn BleTransport> {
    tracing::warn!("No Bluetooth LE backend for this platform");
    Box::new(transport::UnavailableTransport)
}
