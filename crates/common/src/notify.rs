//! Fire-and-forget progress notifications.
//!
//! The engine reports every step through a [`Notifier`], which splits
//! multi-line messages into one event per line, mirrors each event to
//! `tracing` and hands it to a [`NotificationSink`]. Sinks must never
//! block the update flow and never fail it.

use std::io::Write;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Information,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub message: String,
    pub severity: Severity,
    /// Correlation tag, the update run id when emitted by the orchestrator
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<String>,
    pub at: DateTime<Utc>,
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: NotificationEvent);
}

/// Forwards events to an in-process observer.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<NotificationEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<NotificationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelSink {
    fn notify(&self, event: NotificationEvent) {
        // Observer gone: nothing to deliver to.
        let _ = self.tx.send(event);
    }
}

/// Writes each event as one JSON line (stdout for the updater binary).
pub struct JsonLinesSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl<W: Write + Send> NotificationSink for JsonLinesSink<W> {
    fn notify(&self, event: NotificationEvent) {
        let Ok(line) = serde_json::to_string(&event) else {
            return;
        };
        if let Ok(mut writer) = self.writer.lock() {
            let _ = writeln!(writer, "{}", line);
            let _ = writer.flush();
        }
    }
}

/// Drops every event; tracing still sees them through the [`Notifier`].
pub struct NullSink;

impl NotificationSink for NullSink {
    fn notify(&self, _event: NotificationEvent) {}
}

#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
    meta: Option<String>,
}

impl Notifier {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink, meta: None }
    }

    pub fn silent() -> Self {
        Self::new(Arc::new(NullSink))
    }

    /// Same sink, every event tagged with `meta`.
    pub fn with_meta(&self, meta: impl Into<String>) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            meta: Some(meta.into()),
        }
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.emit(message.as_ref(), Severity::Information);
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.emit(message.as_ref(), Severity::Warning);
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.emit(message.as_ref(), Severity::Error);
    }

    pub fn emit(&self, message: &str, severity: Severity) {
        let meta = self.meta.as_deref().unwrap_or("-");
        for line in message.lines().map(str::trim_end).filter(|l| !l.is_empty()) {
            match severity {
                Severity::Information => info!(run = meta, "{}", line),
                Severity::Warning => warn!(run = meta, "{}", line),
                Severity::Error => error!(run = meta, "{}", line),
            }
            self.sink.notify(NotificationEvent {
                message: line.to_string(),
                severity,
                meta: self.meta.clone(),
                at: Utc::now(),
            });
        }
    }
}
