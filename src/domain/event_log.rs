//! Event Log
//!
//! Bounded, append-only record of what happened to the connection. Every
//! entry is mirrored into `tracing` and fanned out to subscribers in the
//! order it was appended.

use crate::domain::models::{LogEntry, Severity};
use std::collections::VecDeque;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};

pub const DEFAULT_CAPACITY: usize = 200;

pub type LogListener = Box<dyn FnMut(&LogEntry) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub struct EventLog {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    next_sequence: u64,
    listeners: Vec<(SubscriptionId, LogListener)>,
    next_subscription: u64,
}

impl EventLog {
    /// Create a log holding at most `capacity` entries (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            next_sequence: 1,
            listeners: Vec::new(),
            next_subscription: 0,
        }
    }

    /// Append an entry, evicting the oldest one when full
    pub fn append(&mut self, severity: Severity, message: impl Into<String>) -> LogEntry {
        let entry = LogEntry {
            sequence: self.next_sequence,
            timestamp: now_millis(),
            severity,
            message: message.into(),
        };
        self.next_sequence += 1;

        match severity {
            Severity::Info => info!(target: "event_log", seq = entry.sequence, "{}", entry.message),
            Severity::Warn => warn!(target: "event_log", seq = entry.sequence, "{}", entry.message),
            Severity::Error => {
                error!(target: "event_log", seq = entry.sequence, "{}", entry.message)
            }
        }

        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry.clone());

        for (_, listener) in self.listeners.iter_mut() {
            listener(&entry);
        }

        entry
    }

    pub fn info(&mut self, message: impl Into<String>) -> LogEntry {
        self.append(Severity::Info, message)
    }

    pub fn warn(&mut self, message: impl Into<String>) -> LogEntry {
        self.append(Severity::Warn, message)
    }

    pub fn error(&mut self, message: impl Into<String>) -> LogEntry {
        self.append(Severity::Error, message)
    }

    /// Entries in insertion order
    pub fn export(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }

    /// Drop all entries. Sequence numbers keep counting from where they were.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscribe(&mut self, listener: LogListener) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.listeners.push((id, listener));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(existing, _)| *existing != id);
        self.listeners.len() != before
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Output format for [`render`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// One JSON object per line
    Json,
    /// One human-readable line per entry
    Text,
}

impl FromStr for ExportFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" | "ndjson" => Ok(Self::Json),
            "text" | "txt" => Ok(Self::Text),
            other => anyhow::bail!("unknown export format: {}", other),
        }
    }
}

pub fn render(entries: &[LogEntry], format: ExportFormat) -> serde_json::Result<String> {
    let mut out = String::new();
    for entry in entries {
        match format {
            ExportFormat::Json => out.push_str(&serde_json::to_string(entry)?),
            ExportFormat::Text => out.push_str(&entry.to_text_line()),
        }
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_capacity_is_never_exceeded() {
        let mut log = EventLog::new(3);
        for i in 0..10 {
            log.info(format!("entry {}", i));
            assert!(log.len() <= 3);
        }
        let entries = log.export();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "entry 7");
        assert_eq!(entries[2].message, "entry 9");
    }

    #[test]
    fn test_sequence_survives_eviction_and_clear() {
        let mut log = EventLog::new(2);
        let mut last = 0;
        for _ in 0..5 {
            let entry = log.warn("tick");
            assert!(entry.sequence > last);
            last = entry.sequence;
        }
        log.clear();
        assert!(log.is_empty());
        let after = log.error("after clear");
        assert_eq!(after.sequence, last + 1);
    }

    #[test]
    fn test_export_preserves_insertion_order() {
        let mut log = EventLog::new(10);
        log.info("a");
        log.warn("b");
        log.error("c");
        let entries = log.export();
        let sequences: Vec<u64> = entries.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        let severities: Vec<Severity> = entries.iter().map(|e| e.severity).collect();
        assert_eq!(
            severities,
            vec![Severity::Info, Severity::Warn, Severity::Error]
        );
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut log = EventLog::new(0);
        log.info("only");
        log.info("one");
        assert_eq!(log.capacity(), 1);
        assert_eq!(log.export()[0].message, "one");
    }

    #[test]
    fn test_listeners_receive_entries_until_unsubscribed() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut log = EventLog::new(10);
        let sink = seen.clone();
        let id = log.subscribe(Box::new(move |entry| {
            sink.lock().unwrap().push(entry.sequence);
        }));

        log.info("one");
        log.info("two");
        assert!(log.unsubscribe(id));
        log.info("three");

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert!(!log.unsubscribe(id));
    }

    #[test]
    fn test_render_formats() {
        let mut log = EventLog::new(10);
        log.info("hello");
        log.warn("careful");
        let entries = log.export();

        let json = render(&entries, ExportFormat::Json).unwrap();
        let lines: Vec<&str> = json.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: LogEntry = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed, entries[1]);

        let text = render(&entries, ExportFormat::Text).unwrap();
        assert!(text.lines().next().unwrap().ends_with("INFO  hello"));
        assert_eq!("ndjson".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert!("xml".parse::<ExportFormat>().is_err());
    }
}
