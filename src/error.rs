use thiserror::Error;

/// Errors surfaced to callers of the connection manager.
///
/// Usage errors (`NotConnected`, `Busy`, `CommandTooLong`) are returned
/// directly from the call that caused them. Fatal link errors end up inside
/// [`ConnectionState::Failed`](crate::domain::models::ConnectionState::Failed).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("Bluetooth LE is not available on this host")]
    UnsupportedTransport,

    #[error("no device advertising {name:?} found within {timeout_ms} ms")]
    DeviceNotFound { name: String, timeout_ms: u64 },

    #[error("link failed: {0}")]
    ConnectFailed(String),

    #[error("reconnect gave up after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("peripheral does not expose the expected GATT layout: {0}")]
    ProtocolMismatch(String),

    #[error("not connected")]
    NotConnected,

    #[error("a command is already in flight")]
    Busy,

    #[error("command is {len} bytes, maximum is {max}")]
    CommandTooLong { len: usize, max: usize },

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("malformed UTF-8 in {len}-byte notification")]
    DecodeWarning { len: usize },

    #[error("connection manager has shut down")]
    Closed,
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;
