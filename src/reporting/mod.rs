//! Error reporting.
//!
//! A scope forwards exceptions to an [`ErrorReporter`] when one was activated
//! at construction. Two reporters are provided:
//!
//! - [`WebhookReporter`]: posts JSON reports to an `http(s)` destination from a
//!   background task, retrying with exponential backoff
//! - [`MemoryReporter`]: keeps reports in memory, for tests

mod webhook;

pub use webhook::{RetryPolicy, WebhookReporter};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

/// A single reported error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReport {
    /// Unique id of this report.
    pub event_id: Uuid,
    /// When the error was reported.
    pub timestamp: DateTime<Utc>,
    /// The error's display message.
    pub message: String,
    /// Display messages of the error's sources, outermost first.
    pub chain: Vec<String>,
    /// Log fields of the reporting scope.
    pub fields: Map<String, Value>,
}

impl ErrorReport {
    /// Builds a report from an error and the reporting scope's fields.
    #[must_use]
    pub fn from_error(error: &(dyn std::error::Error + 'static), fields: Map<String, Value>) -> Self {
        let mut chain = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }

        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            message: error.to_string(),
            chain,
            fields,
        }
    }
}

/// Destination for error reports.
///
/// `report` must not block on delivery and must not fail; implementations
/// handle their own delivery errors.
pub trait ErrorReporter: Send + Sync {
    /// Submits a report.
    fn report(&self, report: ErrorReport);
}

/// Reporter that keeps reports in memory, for tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryReporter {
    reports: Arc<Mutex<Vec<ErrorReport>>>,
}

impl MemoryReporter {
    /// Creates an empty reporter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every report submitted so far.
    #[must_use]
    pub fn reports(&self) -> Vec<ErrorReport> {
        self.reports
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl ErrorReporter for MemoryReporter {
    fn report(&self, report: ErrorReport) {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report);
    }
}
