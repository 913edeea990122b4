//! Command Channel
//!
//! Writes one command at a time to the write characteristic. GATT allows a
//! single outstanding write per link, so a second command is refused with
//! [`ClientError::Busy`] until the first one is acknowledged.

use crate::domain::models::CharacteristicHandle;
use crate::error::ClientError;
use crate::infrastructure::bluetooth::protocol::{Command, CommandCodec};
use crate::infrastructure::bluetooth::transport::{BleTransport, WriteId};
use tracing::debug;

#[derive(Debug)]
struct InFlight {
    id: WriteId,
    command: Command,
}

/// A write that finished, successfully or not
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub command: Command,
    pub result: Result<(), String>,
}

pub struct CommandChannel {
    characteristic: Option<CharacteristicHandle>,
    with_response: bool,
    in_flight: Option<InFlight>,
    next_id: WriteId,
}

impl CommandChannel {
    pub fn new(with_response: bool) -> Self {
        Self {
            characteristic: None,
            with_response,
            in_flight: None,
            next_id: 1,
        }
    }

    /// Hand over the write characteristic of a ready session
    pub fn attach(&mut self, characteristic: CharacteristicHandle) {
        self.characteristic = Some(characteristic);
        self.in_flight = None;
    }

    /// Revoke the characteristic. Returns the command that was in flight, unsent results discarded.
    pub fn detach(&mut self) -> Option<Command> {
        self.characteristic = None;
        self.in_flight.take().map(|slot| slot.command)
    }

    pub fn is_attached(&self) -> bool {
        self.characteristic.is_some()
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn in_flight(&self) -> Option<&Command> {
        self.in_flight.as_ref().map(|slot| &slot.command)
    }

    /// Encode and write `command`, taking the slot until it is acknowledged
    pub fn send(
        &mut self,
        transport: &mut dyn BleTransport,
        codec: &CommandCodec,
        command: Command,
    ) -> Result<usize, ClientError> {
        let characteristic = self.characteristic.ok_or(ClientError::NotConnected)?;
        if self.in_flight.is_some() {
            return Err(ClientError::Busy);
        }

        let payload = codec.encode(&command)?;
        let id = self.next_id;
        self.next_id += 1;

        transport
            .write(&characteristic, id, &payload, self.with_response)
            .map_err(|e| ClientError::WriteFailed(e.to_string()))?;

        if self.with_response {
            self.in_flight = Some(InFlight { id, command });
        }
        Ok(payload.len())
    }

    /// Free the slot if `id` is the write in flight
    pub fn complete(&mut self, id: WriteId, result: Result<(), String>) -> Option<Completion> {
        match &self.in_flight {
            Some(slot) if slot.id == id => {
                let slot = self.in_flight.take()?;
                Some(Completion {
                    command: slot.command,
                    result,
                })
            }
            _ => {
                debug!("Ignoring completion for stale write {}", id);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Device;
    use anyhow::Result;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingTransport {
        writes: Vec<(WriteId, Vec<u8>, bool)>,
        fail: bool,
    }

    impl BleTransport for RecordingTransport {
        fn is_available(&self) -> bool {
            true
        }
        fn start_scan(&mut self, _service: Uuid) -> Result<()> {
            Ok(())
        }
        fn stop_scan(&mut self) {}
        fn connect(&mut self, _device: &Device) -> Result<()> {
            Ok(())
        }
        fn discover(&mut self, _service: Uuid) -> Result<()> {
            Ok(())
        }
        fn subscribe(&mut self, _characteristic: &CharacteristicHandle) -> Result<()> {
            Ok(())
        }
        fn unsubscribe(&mut self, _characteristic: &CharacteristicHandle) {}
        fn write(
            &mut self,
            _characteristic: &CharacteristicHandle,
            id: WriteId,
            payload: &[u8],
            with_response: bool,
        ) -> Result<()> {
            if self.fail {
                anyhow::bail!("radio off");
            }
            self.writes.push((id, payload.to_vec(), with_response));
            Ok(())
        }
        fn disconnect(&mut self) {}
    }

    fn attached(with_response: bool) -> CommandChannel {
        let mut channel = CommandChannel::new(with_response);
        channel.attach(CharacteristicHandle(Uuid::nil()));
        channel
    }

    #[test]
    fn test_detached_channel_is_not_connected() {
        let mut transport = RecordingTransport::default();
        let mut channel = CommandChannel::new(true);
        let result = channel.send(&mut transport, &CommandCodec::default(), Command::Red);
        assert_eq!(result, Err(ClientError::NotConnected));
        assert!(transport.writes.is_empty());
    }

    #[test]
    fn test_single_flight() {
        let mut transport = RecordingTransport::default();
        let codec = CommandCodec::default();
        let mut channel = attached(true);

        assert_eq!(channel.send(&mut transport, &codec, Command::Red), Ok(3));
        assert_eq!(
            channel.send(&mut transport, &codec, Command::Blue),
            Err(ClientError::Busy)
        );
        assert_eq!(transport.writes.len(), 1);
        assert_eq!(transport.writes[0].1, b"red");

        let id = transport.writes[0].0;
        let done = channel.complete(id, Ok(())).unwrap();
        assert_eq!(done.command, Command::Red);
        assert!(!channel.is_busy());

        assert_eq!(channel.send(&mut transport, &codec, Command::Blue), Ok(4));
    }

    #[test]
    fn test_stale_completion_is_ignored() {
        let mut transport = RecordingTransport::default();
        let mut channel = attached(true);
        channel
            .send(&mut transport, &CommandCodec::default(), Command::Green)
            .unwrap();
        assert!(channel.complete(999, Ok(())).is_none());
        assert!(channel.is_busy());
    }

    #[test]
    fn test_unacknowledged_writes_free_the_slot() {
        let mut transport = RecordingTransport::default();
        let codec = CommandCodec::default();
        let mut channel = attached(false);
        channel.send(&mut transport, &codec, Command::Red).unwrap();
        channel.send(&mut transport, &codec, Command::Off).unwrap();
        assert_eq!(transport.writes.len(), 2);
        assert!(!transport.writes[0].2);
    }

    #[test]
    fn test_rejected_write_leaves_slot_free() {
        let mut transport = RecordingTransport {
            fail: true,
            ..Default::default()
        };
        let mut channel = attached(true);
        let result = channel.send(&mut transport, &CommandCodec::default(), Command::Red);
        assert!(matches!(result, Err(ClientError::WriteFailed(_))));
        assert!(!channel.is_busy());
    }

    #[test]
    fn test_too_long_is_rejected_before_writing() {
        let mut transport = RecordingTransport::default();
        let mut channel = attached(true);
        let result = channel.send(
            &mut transport,
            &CommandCodec::new(4),
            Command::Custom("too long".to_string()),
        );
        assert_eq!(result, Err(ClientError::CommandTooLong { len: 8, max: 4 }));
        assert!(transport.writes.is_empty());
        assert!(!channel.is_busy());
    }

    #[test]
    fn test_detach_discards_in_flight() {
        let mut transport = RecordingTransport::default();
        let mut channel = attached(true);
        channel
            .send(&mut transport, &CommandCodec::default(), Command::Red)
            .unwrap();
        assert_eq!(channel.detach(), Some(Command::Red));
        assert!(!channel.is_busy());
        assert!(!channel.is_attached());
    }
}
