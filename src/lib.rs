//! # ctxscope
//!
//! Request-scoped resource environment for async services.
//!
//! A root [`Scope`] is built once at process start and holds the shared
//! resource handles: a database connection pool, a cache client, a logger and
//! an optional error-reporting sink. Every request gets its own clone of the
//! root. The clone hands out a lazily-started database transaction and
//! guarantees that the transaction and its connection checkout are released
//! exactly once when the request ends.
//!
//! ## Features
//!
//! - Lazy connection checkout and transaction begin on first use
//! - Idempotent [`Scope::transaction`]: every call in a request sees the same transaction
//! - Non-failing, idempotent [`Scope::cleanup`] that rolls back abandoned work
//! - Per-request structured log fields over a shared, level-controlled logger
//! - Error reporting that degrades to error-level logging when not configured
//! - Pluggable pools (PostgreSQL via `deadpool-postgres`, in-memory for tests)
//!
//! ## Example
//!
//! ```rust,ignore
//! use ctxscope::{Scope, ScopeConfig};
//!
//! let root = Scope::connect(&ScopeConfig::from_env()?).await?;
//!
//! let inserted = root
//!     .with_request(async |scope| {
//!         let tx = scope.transaction().await?;
//!         let rows = tx.execute("INSERT INTO audit (msg) VALUES ($1)", &[&"hello"]).await?;
//!         tx.commit().await?;
//!         Ok::<_, anyhow::Error>(rows)
//!     })
//!     .await?;
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

use std::fmt;
use thiserror::Error as ThisError;

// Module declarations
#[cfg(feature = "redis")]
pub mod cache;
pub mod config;
pub mod observability;
pub mod pool;
pub mod reporting;
pub mod scope;

// Re-exports for convenience
#[cfg(feature = "redis")]
pub use cache::RedisCache;
pub use config::{LoggingSettings, PoolSettings, ScopeConfig, env_or};
pub use observability::{LogContext, LogSink, Logger, MemorySink, Severity, current_request_id};
#[cfg(feature = "postgres")]
pub use pool::PgPool;
pub use pool::{ConnectionPool, MemoryPool, PoolStatus, PooledConnection, TransactionId};
pub use reporting::{ErrorReport, ErrorReporter, MemoryReporter, WebhookReporter};
pub use scope::{ConstructionError, Scope, ScopeBuilder, ScopeState, Transaction};

/// Shared resources a scope can be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    /// The database connection pool.
    Database,
    /// The cache client.
    Cache,
    /// The error-reporting sink.
    Reporting,
}

impl Resource {
    /// Returns the resource name used in errors and log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::Cache => "cache",
            Self::Reporting => "reporting",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure to check a connection out of a pool.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum AcquireError {
    /// No connection became available within the pool's wait timeout.
    #[error("timed out waiting for a pooled connection")]
    Timeout,

    /// The pool has been closed.
    #[error("connection pool is closed")]
    Closed,

    /// The backend failed to create or recycle a connection.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Error reported by a database backend for a connection-level command.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
#[error("{0}")]
pub struct DbError(pub String);

impl DbError {
    /// Creates a backend error from any displayable cause.
    pub fn new(cause: impl fmt::Display) -> Self {
        Self(cause.to_string())
    }
}

/// Error type for ctxscope operations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `Configuration` | Malformed URL or failed resource initialization while connecting the root scope |
/// | `ResourceNotActive` | A transaction is requested on a scope built without a database |
/// | `Acquire` | The pool is exhausted, closed, or cannot create a connection |
/// | `Begin` | The backend rejects the start of a transaction |
/// | `Commit` / `Rollback` | A handler-driven commit or rollback fails |
/// | `ScopeCleaned` | A transaction is requested after cleanup already ran |
/// | `Cache` | A Redis command fails or times out |
#[derive(Debug, ThisError)]
pub enum Error {
    /// A resource could not be configured.
    ///
    /// Raised when:
    /// - The database or cache URL cannot be parsed
    /// - The database pool fails its startup checkout
    /// - The error-reporting destination is not a usable `http(s)` URL
    #[error("configuration error for {resource}: {cause}")]
    Configuration {
        /// The resource being configured.
        resource: Resource,
        /// The underlying cause.
        cause: String,
    },

    /// The requested resource was never configured on this scope.
    #[error("{0} resource is not active")]
    ResourceNotActive(Resource),

    /// A connection could not be acquired from the pool.
    #[error("failed to acquire connection: {0}")]
    Acquire(#[from] AcquireError),

    /// The backend refused to begin a transaction.
    #[error("failed to begin transaction: {0}")]
    Begin(#[source] DbError),

    /// The backend refused to commit a transaction.
    #[error("failed to commit transaction: {0}")]
    Commit(#[source] DbError),

    /// The backend refused to roll back a transaction.
    #[error("failed to roll back transaction: {0}")]
    Rollback(#[source] DbError),

    /// The scope has already been cleaned up.
    #[error("scope has already been cleaned up")]
    ScopeCleaned,

    /// A cache command failed.
    #[error("cache operation '{operation}' failed: {cause}")]
    Cache {
        /// The command that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },
}

impl Error {
    /// Creates a configuration error for a resource.
    pub fn configuration(resource: Resource, cause: impl fmt::Display) -> Self {
        Self::Configuration {
            resource,
            cause: cause.to_string(),
        }
    }
}

/// Result type alias for ctxscope operations.
pub type Result<T> = std::result::Result<T, Error>;
