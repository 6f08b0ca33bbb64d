//! Structured logging.
//!
//! A [`Logger`] is the process-wide log handle shared by every scope. It owns
//! the minimum severity and the [`LogSink`] records are delivered to. A
//! [`LogContext`] is a per-scope view of a logger carrying its own fields.

use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Log severity, ordered from most to least verbose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum Severity {
    /// Very fine-grained diagnostics.
    Trace = 0,
    /// Diagnostics useful while developing.
    Debug = 1,
    /// Normal operational messages.
    #[default]
    Info = 2,
    /// Something unexpected that the process recovered from.
    Warn = 3,
    /// A failed operation.
    Error = 4,
    /// Logged, then the process exits.
    Fatal = 5,
    /// Logged, then the current thread panics.
    Panic = 6,
}

impl Severity {
    /// All severities in ascending order.
    pub const ALL: [Self; 7] = [
        Self::Trace,
        Self::Debug,
        Self::Info,
        Self::Warn,
        Self::Error,
        Self::Fatal,
        Self::Panic,
    ];

    /// Returns the lowercase name of the severity.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Fatal => "fatal",
            Self::Panic => "panic",
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Trace,
            1 => Self::Debug,
            2 => Self::Info,
            3 => Self::Warn,
            4 => Self::Error,
            5 => Self::Fatal,
            _ => Self::Panic,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "fatal" => Ok(Self::Fatal),
            "panic" => Ok(Self::Panic),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

/// A log record as delivered to a [`LogSink`].
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// Severity of the record.
    pub severity: Severity,
    /// The message text.
    pub message: String,
    /// Fields attached to the emitting scope.
    pub fields: Map<String, Value>,
}

/// Destination for log records.
pub trait LogSink: Send + Sync {
    /// Writes one record. Must not fail.
    fn emit(&self, record: &LogRecord);
}

/// `tracing` target of every event written by [`TracingSink`].
///
/// [`build_filter`](super::build_filter) lets this target through at every
/// level, so the [`Logger`] minimum severity is the only gate on scope logs.
pub const SCOPE_LOG_TARGET: &str = "ctxscope::scope";

/// Sink that forwards records to `tracing` events.
///
/// Scope fields are rendered as a single JSON `fields` value so that any
/// subscriber format can carry them.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&self, record: &LogRecord) {
        let fields = Value::Object(record.fields.clone());
        let message = record.message.as_str();
        match record.severity {
            Severity::Trace => tracing::trace!(target: SCOPE_LOG_TARGET, fields = %fields, "{message}"),
            Severity::Debug => tracing::debug!(target: SCOPE_LOG_TARGET, fields = %fields, "{message}"),
            Severity::Info => tracing::info!(target: SCOPE_LOG_TARGET, fields = %fields, "{message}"),
            Severity::Warn => tracing::warn!(target: SCOPE_LOG_TARGET, fields = %fields, "{message}"),
            Severity::Error => tracing::error!(target: SCOPE_LOG_TARGET, fields = %fields, "{message}"),
            Severity::Fatal | Severity::Panic => {
                tracing::error!(
                    target: SCOPE_LOG_TARGET,
                    severity = record.severity.as_str(),
                    fields = %fields,
                    "{message}"
                );
            },
        }
    }
}

/// Sink that keeps records in memory, for tests.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl MemorySink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every record written so far.
    #[must_use]
    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Returns the records written at `severity`.
    #[must_use]
    pub fn at(&self, severity: Severity) -> Vec<LogRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.severity == severity)
            .collect()
    }

    /// Removes all records.
    pub fn clear(&self) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl LogSink for MemorySink {
    fn emit(&self, record: &LogRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
    }
}

struct LoggerShared {
    min_severity: AtomicU8,
    sink: Arc<dyn LogSink>,
}

/// Process-wide logger handle.
///
/// Clones share the same minimum severity and sink: changing the level
/// through any clone affects every scope built on this logger.
#[derive(Clone)]
pub struct Logger {
    shared: Arc<LoggerShared>,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("min_severity", &self.min_severity())
            .finish_non_exhaustive()
    }
}

impl Logger {
    /// Creates a logger that forwards to `tracing` at the default level.
    #[must_use]
    pub fn new() -> Self {
        Self::with_sink(Arc::new(TracingSink))
    }

    /// Creates a logger writing to `sink` at the default level.
    #[must_use]
    pub fn with_sink(sink: Arc<dyn LogSink>) -> Self {
        Self {
            shared: Arc::new(LoggerShared {
                min_severity: AtomicU8::new(Severity::default() as u8),
                sink,
            }),
        }
    }

    /// Returns the current minimum severity.
    #[must_use]
    pub fn min_severity(&self) -> Severity {
        Severity::from_u8(self.shared.min_severity.load(Ordering::Relaxed))
    }

    /// Sets the minimum severity for every holder of this logger.
    pub fn set_min_severity(&self, severity: Severity) {
        self.shared
            .min_severity
            .store(severity as u8, Ordering::Relaxed);
    }

    /// Returns whether records at `severity` would be written.
    #[must_use]
    pub fn enabled(&self, severity: Severity) -> bool {
        severity >= self.min_severity()
    }

    /// Creates an empty log context on this logger.
    #[must_use]
    pub fn context(&self) -> LogContext {
        LogContext {
            logger: self.clone(),
            fields: Map::new(),
        }
    }

    /// Creates a log context carrying `fields`.
    #[must_use]
    pub fn with_fields(&self, fields: Map<String, Value>) -> LogContext {
        LogContext {
            logger: self.clone(),
            fields,
        }
    }

    /// Writes a record without any fields.
    pub fn log(&self, severity: Severity, message: &str) {
        self.write(severity, message, &Map::new());
    }

    fn write(&self, severity: Severity, message: &str, fields: &Map<String, Value>) {
        // Fatal and panic are always written before the process/thread goes down.
        if !self.enabled(severity) && severity < Severity::Fatal {
            return;
        }
        self.shared.sink.emit(&LogRecord {
            severity,
            message: message.to_string(),
            fields: fields.clone(),
        });
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

/// A logger view with fields attached.
#[derive(Debug, Clone)]
pub struct LogContext {
    logger: Logger,
    fields: Map<String, Value>,
}

impl LogContext {
    /// Attaches a field. An existing field with the same key is replaced.
    pub fn add_field(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Returns the attached fields.
    #[must_use]
    pub const fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Returns the underlying shared logger.
    #[must_use]
    pub const fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Writes `message` at `severity` with the attached fields.
    ///
    /// `Fatal` exits the process and `Panic` panics after the record is written.
    pub fn log(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Fatal => self.fatal(message),
            Severity::Panic => self.panic(message),
            _ => self.logger.write(severity, message, &self.fields),
        }
    }

    /// Writes `message` at fatal severity, then exits the process with status 1.
    pub fn fatal(&self, message: &str) -> ! {
        self.logger.write(Severity::Fatal, message, &self.fields);
        std::process::exit(1)
    }

    /// Writes `message` at panic severity, then panics with it.
    #[allow(clippy::panic)]
    pub fn panic(&self, message: &str) -> ! {
        self.logger.write(Severity::Panic, message, &self.fields);
        panic!("{message}")
    }
}
