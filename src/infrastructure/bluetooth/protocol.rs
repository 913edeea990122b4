//! LED Peripheral Protocol
//!
//! GATT identifiers and the command text protocol spoken by the ESP32 LED
//! peripheral. Commands are plain UTF-8 written to the write
//! characteristic; the peripheral answers through indications on the
//! indicate characteristic.

use crate::error::ClientError;
use std::fmt;
use tracing::trace;
use uuid::Uuid;

/// LED service
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0xad91b201_7347_4047_9e17_3bed82d75f9d);

/// Write characteristic - where commands are sent
pub const WRITE_CHAR_UUID: Uuid = Uuid::from_u128(0xb6fccb50_87be_44f3_ae22_f85485ea42c4);

/// Indicate characteristic - where the peripheral reports back
pub const INDICATE_CHAR_UUID: Uuid = Uuid::from_u128(0x503de214_8682_46c4_828f_d59144da41be);

/// Local name the firmware advertises
pub const DEVICE_NAME: &str = "ESP32-IR-Recorder";

/// Payload that fits one write at the default ATT MTU of 23
pub const DEFAULT_MAX_PAYLOAD: usize = 23 - 3;

/// A command for the peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Red,
    Green,
    Blue,
    /// Turn the LED off
    Off,
    /// Anything else, sent verbatim
    Custom(String),
}

impl Command {
    /// Verbs are case-sensitive: `"Red"` is a custom command
    pub fn parse(text: &str) -> Self {
        match text {
            "red" => Self::Red,
            "green" => Self::Green,
            "blue" => Self::Blue,
            "off" => Self::Off,
            other => Self::Custom(other.to_string()),
        }
    }

    /// Fixed wire token for the LED verbs
    pub fn token(&self) -> Option<&'static [u8]> {
        match self {
            Self::Red => Some(b"red"),
            Self::Green => Some(b"green"),
            Self::Blue => Some(b"blue"),
            Self::Off => Some(b"off"),
            Self::Custom(_) => None,
        }
    }

    /// Raw text the command was built from
    pub fn text(&self) -> &str {
        match self {
            Self::Red => "red",
            Self::Green => "green",
            Self::Blue => "blue",
            Self::Off => "off",
            Self::Custom(text) => text,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Custom(text) => write!(f, "custom {:?}", text),
            verb => write!(f, "{}", verb.text()),
        }
    }
}

/// Result of decoding an inbound payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub text: String,
    /// Some bytes were not valid UTF-8 and were replaced
    pub malformed: bool,
}

/// Converts commands to write payloads and indications to text
#[derive(Debug, Clone)]
pub struct CommandCodec {
    max_len: usize,
}

impl CommandCodec {
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn encode(&self, command: &Command) -> Result<Vec<u8>, ClientError> {
        let bytes = match command.token() {
            Some(token) => token.to_vec(),
            None => command.text().as_bytes().to_vec(),
        };

        if bytes.len() > self.max_len {
            return Err(ClientError::CommandTooLong {
                len: bytes.len(),
                max: self.max_len,
            });
        }

        trace!("Encoded {} as {:02X?}", command, bytes);
        Ok(bytes)
    }

    /// Malformed UTF-8 becomes U+FFFD instead of failing
    pub fn decode(&self, bytes: &[u8]) -> Decoded {
        match std::str::from_utf8(bytes) {
            Ok(text) => Decoded {
                text: text.to_string(),
                malformed: false,
            },
            Err(_) => Decoded {
                text: String::from_utf8_lossy(bytes).into_owned(),
                malformed: true,
            },
        }
    }
}

impl Default for CommandCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

/// Convert to a WinRT GUID
#[cfg(windows)]
pub fn to_guid(uuid: Uuid) -> windows::core::GUID {
    windows::core::GUID::from_u128(uuid.as_u128())
}

#[cfg(windows)]
pub fn from_guid(guid: windows::core::GUID) -> Uuid {
    Uuid::from_u128(guid.to_u128())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuids_match_firmware() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "ad91b201-7347-4047-9e17-3bed82d75f9d"
        );
        assert_eq!(
            WRITE_CHAR_UUID.to_string(),
            "b6fccb50-87be-44f3-ae22-f85485ea42c4"
        );
        assert_eq!(
            INDICATE_CHAR_UUID.to_string(),
            "503de214-8682-46c4-828f-d59144da41be"
        );
    }

    #[test]
    fn test_verbs_are_case_sensitive() {
        assert_eq!(Command::parse("red"), Command::Red);
        assert_eq!(Command::parse("off"), Command::Off);
        assert_eq!(Command::parse("Red"), Command::Custom("Red".to_string()));
        assert_eq!(Command::parse(" red"), Command::Custom(" red".to_string()));
    }

    #[test]
    fn test_verb_tokens_round_trip() {
        let codec = CommandCodec::default();
        for command in [Command::Red, Command::Green, Command::Blue, Command::Off] {
            let bytes = codec.encode(&command).unwrap();
            assert_eq!(bytes, command.token().unwrap());
            let decoded = codec.decode(&bytes);
            assert!(!decoded.malformed);
            assert_eq!(Command::parse(&decoded.text), command);
        }
    }

    #[test]
    fn test_custom_text_is_sent_verbatim() {
        let codec = CommandCodec::default();
        for text in ["blink 3", "", "ünïcødé", "RED"] {
            let command = Command::parse(text);
            let bytes = codec.encode(&command).unwrap();
            assert_eq!(bytes, text.as_bytes());
            assert_eq!(codec.decode(&bytes).text, text);
        }
    }

    #[test]
    fn test_length_bound() {
        let codec = CommandCodec::new(8);
        assert!(codec.encode(&Command::Custom("12345678".to_string())).is_ok());
        assert_eq!(
            codec.encode(&Command::Custom("123456789".to_string())),
            Err(ClientError::CommandTooLong { len: 9, max: 8 })
        );

        // Limit is in bytes, not characters
        let codec = CommandCodec::new(3);
        assert_eq!(
            codec.encode(&Command::Custom("éé".to_string())),
            Err(ClientError::CommandTooLong { len: 4, max: 3 })
        );
    }

    #[test]
    fn test_malformed_bytes_are_replaced() {
        let codec = CommandCodec::default();
        let decoded = codec.decode(&[b'o', b'k', 0xFF, b'!']);
        assert!(decoded.malformed);
        assert_eq!(decoded.text, "ok\u{FFFD}!");
    }
}
