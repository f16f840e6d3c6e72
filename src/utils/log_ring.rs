use crate::core::ports::error_sink::ErrorSink;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<&tracing::Level> for LogLevel {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::ERROR => LogLevel::Error,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::INFO => LogLevel::Info,
            _ => LogLevel::Debug,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub target: String,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            target: target.into(),
            message: message.into(),
        }
    }
}

/// A bounded, leveled buffer of recent log lines.
///
/// The oldest entry is evicted once `capacity` is reached. Error entries are
/// additionally offered to the error forwarder, if one is attached, with a
/// non-blocking `try_send`: a full or closed forwarder loses the entry.
#[derive(Debug)]
pub struct LogRing {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: AtomicUsize,
    forwarder: OnceLock<mpsc::Sender<LogEntry>>,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: AtomicUsize::new(capacity.max(1)),
            forwarder: OnceLock::new(),
        }
    }

    /// Changes the capacity, evicting the oldest entries if the ring shrinks.
    pub fn resize(&self, capacity: usize) {
        let capacity = capacity.max(1);
        self.capacity.store(capacity, Ordering::Relaxed);
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        while entries.len() > capacity {
            entries.pop_front();
        }
    }

    /// Attaches the error forwarder. Only the first call has an effect.
    pub fn attach_forwarder(&self, sender: mpsc::Sender<LogEntry>) -> bool {
        self.forwarder.set(sender).is_ok()
    }

    pub fn push(&self, entry: LogEntry) {
        if entry.level == LogLevel::Error {
            if let Some(forwarder) = self.forwarder.get() {
                let _ = forwarder.try_send(entry.clone());
            }
        }

        let capacity = self.capacity.load(Ordering::Relaxed);
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        while entries.len() >= capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Most recent entries at or above `min_level`, newest last.
    pub fn recent(&self, min_level: LogLevel, limit: usize) -> Vec<LogEntry> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut selected: Vec<LogEntry> = entries
            .iter()
            .rev()
            .filter(|e| e.level >= min_level)
            .take(limit)
            .cloned()
            .collect();
        selected.reverse();
        selected
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Spawns the task that drains forwarded error entries into `sink`.
///
/// Sink failures are swallowed; they are reported at debug level only so the
/// forwarder never feeds on its own errors.
pub fn spawn_error_forwarder(
    sink: Arc<dyn ErrorSink>,
    capacity: usize,
) -> (mpsc::Sender<LogEntry>, JoinHandle<()>) {
    let (sender, mut receiver) = mpsc::channel::<LogEntry>(capacity.max(1));
    let handle = tokio::spawn(async move {
        while let Some(entry) = receiver.recv().await {
            if let Err(e) = sink.forward(&entry).await {
                tracing::debug!("error sink rejected entry: {e}");
            }
        }
    });
    (sender, handle)
}

/// `tracing` layer that copies every event into a [`LogRing`].
pub struct LogRingLayer {
    ring: Arc<LogRing>,
}

impl LogRingLayer {
    pub fn new(ring: Arc<LogRing>) -> Self {
        Self { ring }
    }
}

impl<S: Subscriber> Layer<S> for LogRingLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.ring.push(LogEntry::new(
            LogLevel::from(metadata.level()),
            metadata.target(),
            visitor.finish(),
        ));
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.join(" ")
        } else {
            format!("{} {}", self.message, self.fields.join(" "))
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }
}
