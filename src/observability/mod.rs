//! Observability: structured logging and request context.

mod logging;
mod request_context;

pub use logging::{
    LogContext, LogRecord, LogSink, Logger, MemorySink, SCOPE_LOG_TARGET, Severity, TracingSink,
};
pub use request_context::{RequestContext, current_request_id};

use crate::config::{LogFormat, LoggingSettings};
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

static LOGGING_INIT: OnceLock<()> = OnceLock::new();

/// Error returned when the global subscriber cannot be installed.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    /// A subscriber was already installed by this process.
    #[error("logging already initialized")]
    AlreadyInitialized,

    /// The filter directive could not be parsed.
    #[error("invalid log filter '{directive}': {cause}")]
    InvalidFilter {
        /// The rejected directive.
        directive: String,
        /// Parser message.
        cause: String,
    },

    /// `tracing-subscriber` refused to install the subscriber.
    #[error("failed to install subscriber: {0}")]
    Install(String),
}

/// Builds the `tracing` filter for `settings`.
///
/// `RUST_LOG` wins when set and valid; otherwise the configured level applies
/// to the whole process. Either way [`SCOPE_LOG_TARGET`] is enabled at every
/// level: scope records are filtered by their [`Logger`], so that
/// [`Logger::set_min_severity`] takes effect at runtime.
pub fn build_filter(settings: &LoggingSettings) -> Result<EnvFilter, InitError> {
    filter_for(settings, std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref())
}

fn filter_for(settings: &LoggingSettings, rust_log: Option<&str>) -> Result<EnvFilter, InitError> {
    let base = rust_log
        .filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok());
    let filter = match base {
        Some(filter) => filter,
        None => {
            let directive = tracing_level(settings.level).to_string();
            EnvFilter::try_new(&directive).map_err(|e| InitError::InvalidFilter {
                directive,
                cause: e.to_string(),
            })?
        },
    };

    let directive = format!("{SCOPE_LOG_TARGET}=trace");
    let scope_logs: Directive = directive.parse().map_err(|e: tracing_subscriber::filter::ParseError| {
        InitError::InvalidFilter {
            directive: directive.clone(),
            cause: e.to_string(),
        }
    })?;
    Ok(filter.add_directive(scope_logs))
}

/// Maps a scope severity onto the closest `tracing` level.
#[must_use]
pub const fn tracing_level(severity: Severity) -> tracing::Level {
    match severity {
        Severity::Trace => tracing::Level::TRACE,
        Severity::Debug => tracing::Level::DEBUG,
        Severity::Info => tracing::Level::INFO,
        Severity::Warn => tracing::Level::WARN,
        Severity::Error | Severity::Fatal | Severity::Panic => tracing::Level::ERROR,
    }
}

/// Installs the global `tracing` subscriber.
///
/// Pretty output for local use, JSON lines for log shippers. Output goes to
/// stderr so that command output on stdout stays clean.
///
/// # Errors
///
/// Returns an error if logging was already initialized or the filter is invalid.
pub fn init_logging(settings: &LoggingSettings) -> Result<(), InitError> {
    if LOGGING_INIT.get().is_some() {
        return Err(InitError::AlreadyInitialized);
    }

    let filter = build_filter(settings)?;
    let registry = tracing_subscriber::registry().with(filter);

    match settings.format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_current_span(true)
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .try_init(),
    }
    .map_err(|e| InitError::Install(e.to_string()))?;

    LOGGING_INIT
        .set(())
        .map_err(|()| InitError::AlreadyInitialized)
}
