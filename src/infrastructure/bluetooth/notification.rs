//! Notification Channel
//!
//! Receives indications from the peripheral and turns them into log entries.
//!
//! ## Framing
//!
//! One logical message may arrive split across several indications, and one
//! indication may carry several messages. Messages end at the configured
//! terminator byte (`\n` by default):
//!
//! ```text
//! indication 1: "led re"          -> buffered
//! indication 2: "d\nled gr"       -> "led red" complete, "led gr" buffered
//! indication 3: "een\n"           -> "led green" complete
//! ```
//!
//! A message that reaches `max_message_len` is delivered as is. A partial
//! message older than `message_timeout` is discarded with a warning. With no
//! terminator configured every indication is one complete message.

use crate::domain::event_log::EventLog;
use crate::domain::models::{CharacteristicHandle, NotificationFragment};
use crate::domain::settings::NotificationSettings;
use crate::error::ClientError;
use crate::infrastructure::bluetooth::protocol::CommandCodec;
use crate::infrastructure::bluetooth::transport::BleTransport;
use anyhow::Result;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

pub struct NotificationChannel {
    characteristic: Option<CharacteristicHandle>,
    terminator: Option<u8>,
    max_message_len: usize,
    message_timeout: Duration,
    buffer: Vec<u8>,
    deadline: Option<Instant>,
}

impl NotificationChannel {
    pub fn new(settings: &NotificationSettings) -> Self {
        Self {
            characteristic: None,
            terminator: settings.terminator,
            max_message_len: settings.max_message_len.max(1),
            message_timeout: Duration::from_millis(settings.message_timeout_ms),
            buffer: Vec::new(),
            deadline: None,
        }
    }

    /// Enable indications on `characteristic` for the current session
    pub fn subscribe(
        &mut self,
        transport: &mut dyn BleTransport,
        characteristic: CharacteristicHandle,
    ) -> Result<()> {
        if self.characteristic.is_some() {
            debug!("Already subscribed to indications");
            return Ok(());
        }
        transport.subscribe(&characteristic)?;
        self.characteristic = Some(characteristic);
        self.reset();
        Ok(())
    }

    pub fn unsubscribe(&mut self, transport: &mut dyn BleTransport) {
        if let Some(characteristic) = self.characteristic.take() {
            transport.unsubscribe(&characteristic);
            debug!("Unsubscribed from indications");
        }
        self.reset();
    }

    pub fn is_subscribed(&self) -> bool {
        self.characteristic.is_some()
    }

    /// When the partial message in the buffer expires
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Split one indication at terminator bytes
    pub fn fragments(&self, chunk: &[u8]) -> Vec<NotificationFragment> {
        match self.terminator {
            None => vec![NotificationFragment {
                bytes: chunk.to_vec(),
                complete: true,
            }],
            Some(terminator) => {
                let pieces: Vec<&[u8]> = chunk.split(|b| *b == terminator).collect();
                let last = pieces.len() - 1;
                pieces
                    .into_iter()
                    .enumerate()
                    .map(|(i, bytes)| NotificationFragment {
                        bytes: bytes.to_vec(),
                        complete: i < last,
                    })
                    .collect()
            }
        }
    }

    /// Feed one indication. Completed messages are decoded into `log`.
    pub fn on_indication(
        &mut self,
        chunk: &[u8],
        now: Instant,
        codec: &CommandCodec,
        log: &mut EventLog,
    ) {
        if self.characteristic.is_none() {
            trace!("Dropping indication outside a subscription");
            return;
        }
        trace!("Indication: {:02X?}", chunk);

        for fragment in self.fragments(chunk) {
            let mut bytes = fragment.bytes.as_slice();
            while !bytes.is_empty() {
                if self.buffer.is_empty() {
                    self.deadline = Some(now + self.message_timeout);
                }
                let room = self.max_message_len - self.buffer.len();
                let take = room.min(bytes.len());
                self.buffer.extend_from_slice(&bytes[..take]);
                bytes = &bytes[take..];
                if self.buffer.len() == self.max_message_len {
                    debug!("Message reached {} bytes, delivering", self.max_message_len);
                    self.flush_complete_chars(now, codec, log);
                }
            }
            if fragment.complete && !self.buffer.is_empty() {
                self.flush(codec, log);
            }
        }
    }

    /// Discard a partial message whose deadline has passed
    pub fn on_timer(&mut self, now: Instant, log: &mut EventLog) {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                if !self.buffer.is_empty() {
                    log.warn(format!(
                        "Discarded {} bytes of an incomplete message after {} ms",
                        self.buffer.len(),
                        self.message_timeout.as_millis()
                    ));
                }
                self.reset();
            }
            _ => {}
        }
    }

    /// Deliver the buffer up to its last whole UTF-8 character. A split
    /// character stays buffered and starts the next message.
    fn flush_complete_chars(&mut self, now: Instant, codec: &CommandCodec, log: &mut EventLog) {
        let tail = split_char_len(&self.buffer);
        if tail == 0 || tail == self.buffer.len() {
            self.flush(codec, log);
            return;
        }
        let carry = self.buffer.split_off(self.buffer.len() - tail);
        self.flush(codec, log);
        self.buffer = carry;
        self.deadline = Some(now + self.message_timeout);
    }

    fn flush(&mut self, codec: &CommandCodec, log: &mut EventLog) {
        let decoded = codec.decode(&self.buffer);
        if decoded.malformed {
            log.warn(
                ClientError::DecodeWarning {
                    len: self.buffer.len(),
                }
                .to_string(),
            );
        }
        log.info(format!("Peripheral: {}", decoded.text));
        self.reset();
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.deadline = None;
    }
}

/// Length of an incomplete multi-byte sequence at the end of `bytes`
fn split_char_len(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}
