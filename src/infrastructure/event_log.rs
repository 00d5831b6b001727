//! Event Log
//!
//! Capped, append-only record of what the scanner and session did. This is
//! the user-facing log (shown in the UI and exported); `tracing` remains the
//! developer log and every entry is mirrored there.

use crate::domain::models::{AppEvent, LogEntry, MessageSeverity};
use crate::infrastructure::storage::FileSink;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Entries kept before the oldest is evicted
pub const DEFAULT_CAPACITY: usize = 200;

/// Destination name used by [`EventLog::export`]
pub const EXPORT_FILE_NAME: &str = "ble_logs.txt";

/// Cheaply clonable handle; clones share the same buffer
#[derive(Clone)]
pub struct EventLog {
    entries: Arc<Mutex<VecDeque<LogEntry>>>,
    capacity: usize,
    event_sender: Option<broadcast::Sender<AppEvent>>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
            event_sender: None,
        }
    }

    /// Also publish each entry as [`AppEvent::LogMessage`]
    pub fn with_events(mut self, event_sender: broadcast::Sender<AppEvent>) -> Self {
        self.event_sender = Some(event_sender);
        self
    }

    pub fn push(&self, message: impl Into<String>, severity: MessageSeverity) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            message: message.into(),
            severity,
        };

        match severity {
            MessageSeverity::Info | MessageSeverity::Success => info!("{}", entry.message),
            MessageSeverity::Warning => warn!("{}", entry.message),
            MessageSeverity::Error => error!("{}", entry.message),
        }

        {
            let mut entries = self.lock();
            entries.push_back(entry.clone());
            while entries.len() > self.capacity {
                entries.pop_front();
            }
        }

        if let Some(sender) = &self.event_sender {
            // No subscribers is fine
            let _ = sender.send(AppEvent::LogMessage(entry));
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.push(message, MessageSeverity::Info);
    }

    pub fn success(&self, message: impl Into<String>) {
        self.push(message, MessageSeverity::Success);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.push(message, MessageSeverity::Warning);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.push(message, MessageSeverity::Error);
    }

    /// Current entries, newest first
    pub fn entries(&self) -> Vec<LogEntry> {
        self.lock().iter().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Render all entries as newline-joined text, newest first
    pub fn render(&self) -> String {
        self.entries()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Write the log to `sink` and return the destination
    pub fn export(&self, sink: &dyn FileSink) -> anyhow::Result<String> {
        let text = self.render();
        match sink.write_text(EXPORT_FILE_NAME, &text) {
            Ok(destination) => {
                self.success(format!("Logs exported to: {}", destination));
                Ok(destination)
            }
            Err(e) => {
                self.error(format!("Log export error: {}", e));
                Err(e)
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<LogEntry>> {
        // Entries stay valid even if a writer panicked mid-append
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink {
        written: StdMutex<Option<(String, String)>>,
        fail: bool,
    }

    impl FileSink for RecordingSink {
        fn write_text(&self, name: &str, contents: &str) -> anyhow::Result<String> {
            if self.fail {
                anyhow::bail!("disk full");
            }
            *self.written.lock().unwrap() = Some((name.to_string(), contents.to_string()));
            Ok(format!("/tmp/{}", name))
        }
    }

    #[test]
    fn test_entry_201_evicts_entry_1() {
        let log = EventLog::new(DEFAULT_CAPACITY);
        for i in 1..=201 {
            log.info(format!("entry {}", i));
        }

        let entries = log.entries();
        assert_eq!(entries.len(), 200);
        assert_eq!(entries.first().unwrap().message, "entry 201");
        assert_eq!(entries.last().unwrap().message, "entry 2");
        assert!(!entries.iter().any(|e| e.message == "entry 1"));
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let log = EventLog::new(5);
        for i in 0..50 {
            log.warn(format!("{}", i));
            assert!(log.len() <= 5);
        }
    }

    #[test]
    fn test_concurrent_appends_are_serialized() {
        let log = EventLog::new(1_000);
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        log.info(format!("{}-{}", t, i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(log.len(), 400);
    }

    #[test]
    fn test_export_writes_newest_first() {
        let log = EventLog::new(10);
        log.info("first");
        log.info("second");

        let sink = RecordingSink {
            written: StdMutex::new(None),
            fail: false,
        };
        let destination = log.export(&sink).unwrap();
        assert_eq!(destination, "/tmp/ble_logs.txt");

        let (name, contents) = sink.written.lock().unwrap().clone().unwrap();
        assert_eq!(name, EXPORT_FILE_NAME);
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("] second"));
        assert!(lines[1].ends_with("] first"));

        assert!(log.entries()[0].message.starts_with("Logs exported to:"));
    }

    #[test]
    fn test_export_failure_is_logged() {
        let log = EventLog::new(10);
        let sink = RecordingSink {
            written: StdMutex::new(None),
            fail: true,
        };

        assert!(log.export(&sink).is_err());
        let newest = &log.entries()[0];
        assert_eq!(newest.severity, MessageSeverity::Error);
        assert!(newest.message.contains("disk full"));
    }

    #[tokio::test]
    async fn test_entries_are_broadcast() {
        let (tx, mut rx) = broadcast::channel(8);
        let log = EventLog::new(10).with_events(tx);
        log.info("hello");

        match rx.recv().await.unwrap() {
            AppEvent::LogMessage(entry) => assert_eq!(entry.message, "hello"),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
