//! Host-side client for the ESP32 LED board.
//!
//! Finds the board over Bluetooth LE, keeps the link up, sends colour
//! commands and records everything the board reports in a bounded event log.

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use domain::event_log::{EventLog, ExportFormat, SubscriptionId};
pub use domain::models::{ConnectionState, Device, LogEntry, Severity};
pub use domain::settings::{Settings, SettingsService};
pub use error::{ClientError, Result};
pub use infrastructure::bluetooth::protocol::{Command, CommandCodec};
pub use infrastructure::bluetooth::ConnectionManager;
