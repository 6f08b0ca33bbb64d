//! Request-scoped resource environment.
//!
//! A [`Scope`] is built once as the root of a process and cloned for every
//! request. Clones share the root's resource handles but never its database
//! state.
//!
//! # Lifecycle
//!
//! ```text
//!            transaction()              commit()/rollback()
//!   Idle ───────────────────► InTransaction ─────────────► Connected
//!    │    (acquire + begin)        ▲    │                     │
//!    │                             └────┼──── transaction() ──┘
//!    │                                  │
//!    └────────────── cleanup() ─────────┴──────────────────► Cleaned
//! ```
//!
//! - [`Scope::transaction`] checks a connection out on first use, begins a
//!   transaction on it, and returns the same transaction on every later call.
//! - [`Scope::cleanup`] rolls back whatever is still open and returns the
//!   connection to the pool. It never fails and is safe to call repeatedly.
//! - [`Clone`] produces a fresh `Idle` scope with empty log fields.

mod builder;
mod request;
mod transaction;

pub use builder::{ConstructionError, ScopeBuilder};
pub use transaction::Transaction;

#[cfg(feature = "redis")]
use crate::cache::RedisCache;
use crate::observability::{LogContext, Logger, Severity};
use crate::pool::{ConnectionPool, PooledConnection, TransactionId};
use crate::reporting::{ErrorReport, ErrorReporter};
use crate::{Error, Resource, Result};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Observable lifecycle state of a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeState {
    /// No connection and no transaction.
    Idle,
    /// A connection is held but no transaction is open.
    Connected,
    /// A connection is held with an open transaction.
    InTransaction,
    /// Cleanup has run; the scope can no longer start transactions.
    Cleaned,
}

/// Process-wide handles shared by every clone of a root scope.
pub(crate) struct ResourceHandles<P> {
    pub(crate) pool: Option<P>,
    #[cfg(feature = "redis")]
    pub(crate) cache: Option<RedisCache>,
    pub(crate) logger: Logger,
    pub(crate) reporter: Option<Arc<dyn ErrorReporter>>,
}

/// Request-scoped resource environment.
///
/// `P` is the connection pool backing [`Scope::transaction`]; use
/// [`PgPool`](crate::PgPool) for PostgreSQL or [`MemoryPool`](crate::MemoryPool)
/// in tests.
pub struct Scope<P: ConnectionPool> {
    handles: Arc<ResourceHandles<P>>,
    connection: Option<P::Connection>,
    transaction: Option<TransactionId>,
    /// A `begin` was started but did not report back.
    unsettled: bool,
    cleaned: bool,
    log: LogContext,
}

impl<P: ConnectionPool> Scope<P> {
    fn from_handles(handles: Arc<ResourceHandles<P>>) -> Self {
        let log = handles.logger.context();
        Self {
            handles,
            connection: None,
            transaction: None,
            unsettled: false,
            cleaned: false,
            log,
        }
    }

    /// Returns a builder for a root scope.
    #[must_use]
    pub fn builder() -> ScopeBuilder<P> {
        ScopeBuilder::new()
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ScopeState {
        if self.cleaned {
            ScopeState::Cleaned
        } else if self.transaction.is_some() {
            ScopeState::InTransaction
        } else if self.connection.is_some() {
            ScopeState::Connected
        } else {
            ScopeState::Idle
        }
    }

    /// Returns the id of the open transaction, if any.
    #[must_use]
    pub const fn transaction_id(&self) -> Option<TransactionId> {
        self.transaction
    }

    /// Returns whether this scope currently holds a pooled connection.
    #[must_use]
    pub const fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    /// Returns the scope's transaction, starting one on first use.
    ///
    /// The first call checks a connection out of the pool (waiting for
    /// capacity if needed) and begins a transaction on it. Later calls return
    /// the same transaction without touching the pool.
    ///
    /// # Errors
    ///
    /// - [`Error::ResourceNotActive`] if the scope has no database; no
    ///   checkout is attempted
    /// - [`Error::ScopeCleaned`] after [`Scope::cleanup`]
    /// - [`Error::Acquire`] if no connection could be checked out; the scope
    ///   stays `Idle`
    /// - [`Error::Begin`] if the backend refused the transaction; the
    ///   connection stays attached and is released by cleanup
    /// - [`Error::Rollback`] if an earlier interrupted start could not be
    ///   rolled back; cleanup retries the rollback
    pub async fn transaction(&mut self) -> Result<Transaction<'_, P::Connection>> {
        if self.cleaned {
            return Err(Error::ScopeCleaned);
        }
        let Some(pool) = self.handles.pool.as_ref() else {
            return Err(Error::ResourceNotActive(Resource::Database));
        };

        let connection = match self.connection.take() {
            Some(connection) => self.connection.insert(connection),
            None => {
                let acquired = pool.acquire().await.inspect_err(|e| {
                    self.log
                        .log(Severity::Debug, &format!("connection checkout failed: {e}"));
                })?;
                self.log.log(Severity::Debug, "connection checked out");
                self.connection.insert(acquired)
            },
        };

        let id = match self.transaction {
            Some(id) => id,
            None => {
                if self.unsettled {
                    // The interrupted BEGIN may have reached the server.
                    connection.rollback().await.map_err(Error::Rollback)?;
                    self.unsettled = false;
                    self.log
                        .log(Severity::Debug, "interrupted transaction start rolled back");
                }
                self.unsettled = true;
                let begun = connection.begin().await;
                self.unsettled = false;
                if let Err(e) = begun {
                    self.log
                        .log(Severity::Debug, &format!("transaction begin failed: {e}"));
                    return Err(Error::Begin(e));
                }
                let id = TransactionId::next();
                self.transaction = Some(id);
                self.log.log(Severity::Debug, &format!("transaction {id} begun"));
                id
            },
        };

        Ok(Transaction::new(connection, &mut self.transaction, id))
    }

    /// Rolls back any open transaction and returns the connection to the pool.
    ///
    /// Never commits: work the handler did not commit is treated as abandoned.
    /// Failures are logged at warn level and otherwise ignored; a connection
    /// whose rollback failed is discarded rather than recycled. Calling this
    /// again, or on a scope that never touched the database, does nothing.
    pub async fn cleanup(&mut self) {
        let mut rollback_failed = false;

        if let Some(connection) = self.connection.as_mut() {
            if self.transaction.is_some() || self.unsettled {
                match connection.rollback().await {
                    Ok(()) => self.log.log(Severity::Debug, "open transaction rolled back"),
                    Err(e) => {
                        rollback_failed = true;
                        self.log.log(
                            Severity::Warn,
                            &format!("rollback during cleanup failed: {e}"),
                        );
                    },
                }
            }
        }
        self.transaction = None;
        self.unsettled = false;

        if let (Some(connection), Some(pool)) = (self.connection.take(), self.handles.pool.as_ref()) {
            if rollback_failed {
                pool.discard(connection);
            } else {
                pool.release(connection);
            }
            self.log.log(Severity::Debug, "connection returned to pool");
        }

        self.cleaned = true;
    }

    /// Returns the shared connection pool, bypassing the scope's transaction.
    #[must_use]
    pub fn raw_pool(&self) -> Option<&P> {
        self.handles.pool.as_ref()
    }

    /// Returns the shared cache client, if one was configured.
    #[cfg(feature = "redis")]
    #[must_use]
    pub fn cache(&self) -> Option<&RedisCache> {
        self.handles.cache.as_ref()
    }

    /// Returns the shared logger.
    #[must_use]
    pub fn logger(&self) -> &Logger {
        &self.handles.logger
    }

    /// Returns whether error reports are forwarded to a reporter.
    #[must_use]
    pub fn reporting_active(&self) -> bool {
        self.handles.reporter.is_some()
    }

    /// Attaches a log field to this scope only.
    pub fn add_log_field(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.log.add_field(key, value);
    }

    /// Returns the fields attached to this scope.
    #[must_use]
    pub const fn log_fields(&self) -> &Map<String, Value> {
        self.log.fields()
    }

    /// Sets the minimum severity of the shared logger.
    ///
    /// This is process-wide: every scope on the same logger is affected.
    pub fn set_log_level(&self, severity: Severity) {
        self.handles.logger.set_min_severity(severity);
    }

    /// Returns the minimum severity of the shared logger.
    #[must_use]
    pub fn log_level(&self) -> Severity {
        self.handles.logger.min_severity()
    }

    /// Logs `message` at `severity` with this scope's fields.
    ///
    /// `Fatal` exits the process and `Panic` panics after logging.
    pub fn log(&self, severity: Severity, message: &str) {
        self.log.log(severity, message);
    }

    /// Logs at trace severity.
    pub fn trace(&self, message: &str) {
        self.log.log(Severity::Trace, message);
    }

    /// Logs at debug severity.
    pub fn debug(&self, message: &str) {
        self.log.log(Severity::Debug, message);
    }

    /// Logs at info severity.
    pub fn info(&self, message: &str) {
        self.log.log(Severity::Info, message);
    }

    /// Logs at warn severity.
    pub fn warn(&self, message: &str) {
        self.log.log(Severity::Warn, message);
    }

    /// Logs at error severity.
    pub fn error(&self, message: &str) {
        self.log.log(Severity::Error, message);
    }

    /// Logs at fatal severity, then exits the process.
    pub fn fatal(&self, message: &str) -> ! {
        self.log.fatal(message)
    }

    /// Logs at panic severity, then panics.
    pub fn panic(&self, message: &str) -> ! {
        self.log.panic(message)
    }

    /// Reports an error to the configured reporter.
    ///
    /// Without a reporter the error's message is logged at error severity.
    pub fn report_exception(&self, error: &(dyn std::error::Error + 'static)) {
        match &self.handles.reporter {
            Some(reporter) => {
                reporter.report(ErrorReport::from_error(error, self.log.fields().clone()));
            },
            None => self.log.log(Severity::Error, &error.to_string()),
        }
    }
}

/// Produces a fresh request scope.
///
/// The clone shares the pool, cache, logger and reporter, but starts `Idle`
/// with no connection, no transaction and no log fields, whatever the state
/// of `self`. `self` is not modified.
impl<P: ConnectionPool> Clone for Scope<P> {
    fn clone(&self) -> Self {
        Self::from_handles(Arc::clone(&self.handles))
    }
}

impl<P: ConnectionPool> Drop for Scope<P> {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        let Some(pool) = self.handles.pool.as_ref() else {
            return;
        };

        if self.transaction.is_some() || self.unsettled {
            self.log.log(
                Severity::Warn,
                "scope dropped without cleanup while a transaction was open; discarding connection",
            );
            pool.discard(connection);
        } else {
            self.log.log(
                Severity::Debug,
                "scope dropped without cleanup; releasing connection",
            );
            pool.release(connection);
        }
    }
}

impl<P: ConnectionPool> fmt::Debug for Scope<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Scope");
        s.field("state", &self.state())
            .field("transaction", &self.transaction)
            .field("database", &self.handles.pool.is_some());
        #[cfg(feature = "redis")]
        s.field("cache", &self.handles.cache.is_some());
        s.field("reporting", &self.reporting_active())
            .field("log_fields", self.log.fields())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::MemorySink;
    use crate::pool::MemoryPool;
    use crate::{AcquireError, MemoryReporter};

    fn scope_with_pool(pool: &MemoryPool) -> Scope<MemoryPool> {
        Scope::builder().pool(pool.clone()).build()
    }

    #[tokio::test]
    async fn test_new_scope_is_idle() {
        let pool = MemoryPool::new(1);
        let scope = scope_with_pool(&pool);
        assert_eq!(scope.state(), ScopeState::Idle);
        assert!(!scope.has_connection());
        assert_eq!(pool.stats().acquired, 0);
    }

    #[tokio::test]
    async fn test_transaction_is_lazy_and_cached() {
        let pool = MemoryPool::new(2);
        let mut scope = scope_with_pool(&pool);

        let first = scope.transaction().await.map(|tx| tx.id());
        let second = scope.transaction().await.map(|tx| tx.id());

        assert!(first.is_ok());
        assert_eq!(first.ok(), second.ok());
        assert_eq!(scope.state(), ScopeState::InTransaction);
        assert_eq!(pool.stats().acquired, 1);
        assert_eq!(pool.stats().begun, 1);
    }

    #[tokio::test]
    async fn test_acquire_failure_leaves_scope_idle() {
        let pool = MemoryPool::new(1);
        pool.fail_next_acquire(AcquireError::Backend("refused".to_string()));
        let mut scope = scope_with_pool(&pool);

        let result = scope.transaction().await.map(|tx| tx.id());

        assert!(matches!(result, Err(Error::Acquire(AcquireError::Backend(_)))));
        assert_eq!(scope.state(), ScopeState::Idle);
        assert_eq!(pool.status().available, 1);
    }

    #[tokio::test]
    async fn test_begin_failure_keeps_connection_until_cleanup() {
        let pool = MemoryPool::new(1);
        pool.fail_next_begin("read-only replica");
        let mut scope = scope_with_pool(&pool);

        let result = scope.transaction().await.map(|tx| tx.id());

        assert!(matches!(result, Err(Error::Begin(_))));
        assert_eq!(scope.state(), ScopeState::Connected);
        assert_eq!(pool.status().available, 0);

        scope.cleanup().await;
        assert_eq!(scope.state(), ScopeState::Cleaned);
        assert_eq!(pool.status().available, 1);
        assert_eq!(pool.stats().rolled_back, 0);
    }

    #[tokio::test]
    async fn test_retry_after_begin_failure_reuses_connection() {
        let pool = MemoryPool::new(1);
        pool.fail_next_begin("transient");
        let mut scope = scope_with_pool(&pool);

        assert!(scope.transaction().await.is_err());
        assert!(scope.transaction().await.is_ok());
        assert_eq!(pool.stats().acquired, 1);
        assert_eq!(pool.stats().begun, 1);
    }

    #[tokio::test]
    async fn test_commit_then_new_transaction_on_same_connection() {
        let pool = MemoryPool::new(1);
        let mut scope = scope_with_pool(&pool);

        let first = match scope.transaction().await {
            Ok(tx) => {
                let id = tx.id();
                assert!(tx.commit().await.is_ok());
                Some(id)
            },
            Err(_) => None,
        };
        assert_eq!(scope.state(), ScopeState::Connected);

        let second = scope.transaction().await.map(|tx| tx.id()).ok();
        assert!(first.is_some());
        assert_ne!(first, second);
        assert_eq!(pool.stats().acquired, 1);
        assert_eq!(pool.stats().begun, 2);
    }

    #[tokio::test]
    async fn test_cleanup_swallows_rollback_failure_and_discards() {
        let pool = MemoryPool::new(1);
        let sink = MemorySink::new();
        let logger = Logger::with_sink(Arc::new(sink.clone()));
        let mut scope: Scope<MemoryPool> = Scope::builder().pool(pool.clone()).logger(logger).build();

        assert!(scope.transaction().await.is_ok());
        pool.fail_next_rollback("connection lost");
        scope.cleanup().await;

        assert_eq!(scope.state(), ScopeState::Cleaned);
        assert_eq!(pool.stats().discarded, 1);
        assert_eq!(pool.stats().released, 0);
        assert_eq!(pool.status().available, 1);
        let warnings = sink.at(Severity::Warn);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("connection lost"));
    }

    #[tokio::test]
    async fn test_transaction_after_cleanup_is_rejected() {
        let pool = MemoryPool::new(1);
        let mut scope = scope_with_pool(&pool);
        scope.cleanup().await;

        let result = scope.transaction().await.map(|tx| tx.id());
        assert!(matches!(result, Err(Error::ScopeCleaned)));
        assert_eq!(pool.stats().acquired, 0);
    }

    #[tokio::test]
    async fn test_drop_discards_connection_with_open_transaction() {
        let pool = MemoryPool::new(1);
        {
            let mut scope = scope_with_pool(&pool);
            assert!(scope.transaction().await.is_ok());
        }
        assert_eq!(pool.stats().discarded, 1);
        assert_eq!(pool.status().available, 1);
    }

    #[tokio::test]
    async fn test_drop_releases_clean_connection() {
        let pool = MemoryPool::new(1);
        {
            let mut scope = scope_with_pool(&pool);
            if let Ok(tx) = scope.transaction().await {
                assert!(tx.rollback().await.is_ok());
            }
        }
        assert_eq!(pool.stats().released, 1);
        assert_eq!(pool.stats().discarded, 0);
    }

    #[test]
    fn test_report_exception_uses_reporter_when_active() {
        let reporter = MemoryReporter::new();
        let sink = MemorySink::new();
        let mut scope: Scope<MemoryPool> = Scope::builder()
            .logger(Logger::with_sink(Arc::new(sink.clone())))
            .reporter(reporter.clone())
            .build();
        scope.add_log_field("route", "/orders");

        scope.report_exception(&Error::ScopeCleaned);

        let reports = reporter.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].fields.get("route"), Some(&Value::from("/orders")));
        assert!(sink.records().is_empty());
    }

    /// Stalls its first `begin` forever; later ones succeed.
    struct StallingConnection {
        rollbacks: Arc<std::sync::atomic::AtomicUsize>,
        stalled: bool,
    }

    impl PooledConnection for StallingConnection {
        async fn begin(&mut self) -> std::result::Result<(), crate::DbError> {
            if self.stalled {
                return Ok(());
            }
            self.stalled = true;
            std::future::pending().await
        }

        async fn commit(&mut self) -> std::result::Result<(), crate::DbError> {
            Ok(())
        }

        async fn rollback(&mut self) -> std::result::Result<(), crate::DbError> {
            self.rollbacks
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    struct StallingPool {
        rollbacks: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl ConnectionPool for StallingPool {
        type Connection = StallingConnection;

        async fn acquire(&self) -> std::result::Result<StallingConnection, AcquireError> {
            Ok(StallingConnection {
                rollbacks: Arc::clone(&self.rollbacks),
                stalled: false,
            })
        }

        fn release(&self, _connection: StallingConnection) {}

        fn status(&self) -> crate::PoolStatus {
            crate::PoolStatus::default()
        }
    }

    #[tokio::test]
    async fn test_interrupted_begin_is_rolled_back_on_cleanup() {
        let rollbacks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut scope: Scope<StallingPool> = Scope::builder()
            .pool(StallingPool {
                rollbacks: Arc::clone(&rollbacks),
            })
            .build();

        let timed_out = tokio::time::timeout(
            std::time::Duration::from_millis(10),
            scope.transaction(),
        )
        .await
        .is_err();
        assert!(timed_out);
        assert_eq!(scope.state(), ScopeState::Connected);

        scope.cleanup().await;
        assert_eq!(rollbacks.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_after_interrupted_begin_rolls_back_first() {
        let rollbacks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut scope: Scope<StallingPool> = Scope::builder()
            .pool(StallingPool {
                rollbacks: Arc::clone(&rollbacks),
            })
            .build();

        let timed_out = tokio::time::timeout(
            std::time::Duration::from_millis(10),
            scope.transaction(),
        )
        .await
        .is_err();
        assert!(timed_out);
        assert_eq!(rollbacks.load(std::sync::atomic::Ordering::SeqCst), 0);

        assert!(scope.transaction().await.is_ok());
        assert_eq!(rollbacks.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(scope.state(), ScopeState::InTransaction);

        scope.cleanup().await;
        assert_eq!(rollbacks.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn test_debug_lists_active_resources() {
        let scope: Scope<MemoryPool> = Scope::builder().pool(MemoryPool::new(1)).build();
        let debug = format!("{scope:?}");
        assert!(debug.contains("state: Idle"));
        assert!(debug.contains("database: true"));
        assert!(debug.contains("reporting: false"));
    }
}
