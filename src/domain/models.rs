use crate::error::ClientError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A peripheral seen while scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Platform-assigned identifier (Bluetooth address on Windows)
    pub id: String,
    /// Advertised local name
    pub name: String,
    pub discovered: bool,
}

impl Device {
    pub fn discovered(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            discovered: true,
        }
    }
}

/// Resolved GATT characteristic, handed to a channel while the session is ready
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle(pub Uuid);

impl CharacteristicHandle {
    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Scanning,
    Connecting,
    DiscoveringServices,
    Ready,
    Reconnecting,
    Failed(ClientError),
}

impl ConnectionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// True for states in which a link is being established or kept alive
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Disconnected | Self::Failed(_))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::DiscoveringServices => write!(f, "DiscoveringServices"),
            Self::Ready => write!(f, "Ready"),
            Self::Reconnecting => write!(f, "Reconnecting"),
            Self::Failed(_) => write!(f, "Failed"),
        }
    }
}

/// The single live connection. Owned by the connection manager only.
#[derive(Debug, Clone)]
pub struct ConnectionSession {
    pub device: Option<Device>,
    pub write_characteristic: Option<CharacteristicHandle>,
    pub indicate_characteristic: Option<CharacteristicHandle>,
    pub state: ConnectionState,
    /// Reconnect attempts made since the session was last ready
    pub retries: u32,
}

impl ConnectionSession {
    pub fn new(state: ConnectionState) -> Self {
        Self {
            device: None,
            write_characteristic: None,
            indicate_characteristic: None,
            state,
            retries: 0,
        }
    }

    pub fn clear_link(&mut self) {
        self.write_characteristic = None;
        self.indicate_characteristic = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => f.pad("INFO"),
            Self::Warn => f.pad("WARN"),
            Self::Error => f.pad("ERROR"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub sequence: u64,
    /// Unix milliseconds
    pub timestamp: i64,
    pub severity: Severity,
    pub message: String,
}

impl LogEntry {
    pub fn to_text_line(&self) -> String {
        format!(
            "#{} {} {:<5} {}",
            self.sequence, self.timestamp, self.severity, self.message
        )
    }
}

/// A piece of an indication. `complete` marks the end of a logical message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationFragment {
    pub bytes: Vec<u8>,
    pub complete: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_state_display_hides_reason() {
        let state = ConnectionState::Failed(ClientError::NotConnected);
        assert_eq!(state.to_string(), "Failed");
        assert!(state.is_failed());
        assert!(!state.is_active());
    }

    #[test]
    fn test_log_entry_serializes_lowercase_severity() {
        let entry = LogEntry {
            sequence: 7,
            timestamp: 1_700_000_000_000,
            severity: Severity::Warn,
            message: "link lost".to_string(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(
            json,
            r#"{"sequence":7,"timestamp":1700000000000,"severity":"warn","message":"link lost"}"#
        );
        assert_eq!(entry.to_text_line(), "#7 1700000000000 WARN  link lost");
    }
}
