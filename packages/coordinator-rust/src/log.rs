//! Injected log sink.
//!
//! The coordinator reports log-worthy events (warnings on ignored calls,
//! pressure transitions, sweep results) through [`LogSink`] instead of
//! calling a logging backend directly, so the host decides where they go.
//! [`TracingLogSink`] is the default and forwards to `tracing`.

use std::fmt::Write as _;

use parking_lot::Mutex;

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// A structured key/value pair attached to a log record.
pub type LogField = (&'static str, String);

/// Receiver of coordinator log events.
///
/// Implementations must be cheap and non-blocking; they are called on the
/// caller's thread after the registry lock has been released.
pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, category: &'static str, message: &str, fields: &[LogField]);
}

/// Forwards records to the `tracing` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&self, level: LogLevel, category: &'static str, message: &str, fields: &[LogField]) {
        let fields = format_fields(fields);
        match level {
            LogLevel::Trace => tracing::trace!(category, fields = %fields, "{message}"),
            LogLevel::Debug => tracing::debug!(category, fields = %fields, "{message}"),
            LogLevel::Info => tracing::info!(category, fields = %fields, "{message}"),
            LogLevel::Warn => tracing::warn!(category, fields = %fields, "{message}"),
            LogLevel::Error => tracing::error!(category, fields = %fields, "{message}"),
        }
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLogSink;

impl LogSink for NoopLogSink {
    fn log(&self, _: LogLevel, _: &'static str, _: &str, _: &[LogField]) {}
}

/// A captured log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub category: &'static str,
    pub message: String,
    pub fields: Vec<LogField>,
}

impl LogRecord {
    /// Value of the first field named `key`.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Keeps every record in memory. Intended for tests and diagnostics.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    records: Mutex<Vec<LogRecord>>,
}

impl MemoryLogSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything logged so far.
    #[must_use]
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    /// Records matching `level` and `category`.
    #[must_use]
    pub fn matching(&self, level: LogLevel, category: &str) -> Vec<LogRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.level == level && r.category == category)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl LogSink for MemoryLogSink {
    fn log(&self, level: LogLevel, category: &'static str, message: &str, fields: &[LogField]) {
        self.records.lock().push(LogRecord {
            level,
            category,
            message: message.to_string(),
            fields: fields.to_vec(),
        });
    }
}

fn format_fields(fields: &[LogField]) -> String {
    let mut out = String::new();
    for (i, (key, value)) in fields.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{key}={value}");
    }
    out
}
