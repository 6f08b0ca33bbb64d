//! In-memory connection pool for testing.
//!
//! Provides a bounded, non-persistent implementation of [`ConnectionPool`]
//! with a shared key/value store. Writes staged inside a transaction become
//! visible in the store only on commit, which lets tests observe commit and
//! rollback behavior without a database server.

use super::{ConnectionPool, PoolStatus, PooledConnection};
use crate::{AcquireError, DbError};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// In-memory connection pool.
///
/// Cloning the pool yields another handle to the same connections and store.
///
/// # Example
///
/// ```rust,ignore
/// use ctxscope::{MemoryPool, Scope};
///
/// let pool = MemoryPool::new(4);
/// let root = Scope::builder().pool(pool.clone()).build();
/// ```
#[derive(Debug, Clone)]
pub struct MemoryPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    max_size: usize,
    permits: Arc<Semaphore>,
    wait_timeout: Option<Duration>,
    closed: AtomicBool,
    store: Mutex<BTreeMap<String, String>>,
    faults: Mutex<Faults>,
    counters: Counters,
}

#[derive(Debug, Default)]
struct Faults {
    fail_acquire: Option<AcquireError>,
    fail_begin: Option<String>,
    fail_commit: Option<String>,
    fail_rollback: Option<String>,
}

#[derive(Debug, Default)]
struct Counters {
    acquired: AtomicUsize,
    released: AtomicUsize,
    discarded: AtomicUsize,
    begun: AtomicUsize,
    committed: AtomicUsize,
    rolled_back: AtomicUsize,
}

/// Operation counts recorded by a [`MemoryPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryPoolStats {
    /// Successful checkouts.
    pub acquired: usize,
    /// Connections returned with [`ConnectionPool::release`].
    pub released: usize,
    /// Connections removed with [`ConnectionPool::discard`].
    pub discarded: usize,
    /// Transactions begun.
    pub begun: usize,
    /// Transactions committed.
    pub committed: usize,
    /// Rollback commands issued, including failed ones.
    pub rolled_back: usize,
}

impl MemoryPool {
    /// Creates a pool holding at most `max_size` connections.
    ///
    /// Checkouts wait indefinitely for capacity.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self::build(max_size, None)
    }

    /// Creates a pool whose checkouts fail with [`AcquireError::Timeout`]
    /// after waiting `wait_timeout` for capacity.
    #[must_use]
    pub fn with_wait_timeout(max_size: usize, wait_timeout: Duration) -> Self {
        Self::build(max_size, Some(wait_timeout))
    }

    fn build(max_size: usize, wait_timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                max_size,
                permits: Arc::new(Semaphore::new(max_size)),
                wait_timeout,
                closed: AtomicBool::new(false),
                store: Mutex::new(BTreeMap::new()),
                faults: Mutex::new(Faults::default()),
                counters: Counters::default(),
            }),
        }
    }

    /// Closes the pool. Pending and future checkouts fail with [`AcquireError::Closed`].
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.permits.close();
    }

    /// Returns whether the pool has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Makes the next checkout fail with `error`.
    pub fn fail_next_acquire(&self, error: AcquireError) {
        self.faults().fail_acquire = Some(error);
    }

    /// Makes the next `begin` on any connection fail with `cause`.
    pub fn fail_next_begin(&self, cause: impl Into<String>) {
        self.faults().fail_begin = Some(cause.into());
    }

    /// Makes the next `commit` on any connection fail with `cause`.
    pub fn fail_next_commit(&self, cause: impl Into<String>) {
        self.faults().fail_commit = Some(cause.into());
    }

    /// Makes the next `rollback` on any connection fail with `cause`.
    pub fn fail_next_rollback(&self, cause: impl Into<String>) {
        self.faults().fail_rollback = Some(cause.into());
    }

    /// Returns the committed value for `key`.
    #[must_use]
    pub fn committed(&self, key: &str) -> Option<String> {
        self.store().get(key).cloned()
    }

    /// Returns the number of committed keys.
    #[must_use]
    pub fn committed_len(&self) -> usize {
        self.store().len()
    }

    /// Returns the operation counts recorded so far.
    #[must_use]
    pub fn stats(&self) -> MemoryPoolStats {
        let c = &self.inner.counters;
        MemoryPoolStats {
            acquired: c.acquired.load(Ordering::SeqCst),
            released: c.released.load(Ordering::SeqCst),
            discarded: c.discarded.load(Ordering::SeqCst),
            begun: c.begun.load(Ordering::SeqCst),
            committed: c.committed.load(Ordering::SeqCst),
            rolled_back: c.rolled_back.load(Ordering::SeqCst),
        }
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.inner.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn store(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.inner.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn take_permit(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        let permit = Arc::clone(&self.inner.permits).acquire_owned();
        let result = match self.inner.wait_timeout {
            Some(wait) => tokio::time::timeout(wait, permit)
                .await
                .map_err(|_| AcquireError::Timeout)?,
            None => permit.await,
        };
        result.map_err(|_| AcquireError::Closed)
    }
}

impl ConnectionPool for MemoryPool {
    type Connection = MemoryConnection;

    async fn acquire(&self) -> Result<MemoryConnection, AcquireError> {
        if self.is_closed() {
            return Err(AcquireError::Closed);
        }
        if let Some(error) = self.faults().fail_acquire.take() {
            return Err(error);
        }

        let permit = self.take_permit().await?;
        self.inner.counters.acquired.fetch_add(1, Ordering::SeqCst);

        Ok(MemoryConnection {
            pool: self.clone(),
            staged: Vec::new(),
            in_transaction: false,
            _permit: permit,
        })
    }

    fn release(&self, connection: MemoryConnection) {
        self.inner.counters.released.fetch_add(1, Ordering::SeqCst);
        drop(connection);
    }

    fn discard(&self, connection: MemoryConnection) {
        self.inner.counters.discarded.fetch_add(1, Ordering::SeqCst);
        drop(connection);
    }

    fn status(&self) -> PoolStatus {
        let available = self.inner.permits.available_permits();
        PoolStatus {
            max_size: self.inner.max_size,
            size: self.inner.max_size.saturating_sub(available),
            available,
        }
    }
}

/// A connection checked out of a [`MemoryPool`].
///
/// Capacity is returned to the pool when the connection is dropped.
#[derive(Debug)]
pub struct MemoryConnection {
    pool: MemoryPool,
    staged: Vec<(String, String)>,
    in_transaction: bool,
    _permit: OwnedSemaphorePermit,
}

impl MemoryConnection {
    /// Writes `value` under `key`.
    ///
    /// Inside a transaction the write is staged until commit; outside one it
    /// is applied immediately.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let (key, value) = (key.into(), value.into());
        if self.in_transaction {
            self.staged.push((key, value));
        } else {
            self.pool.store().insert(key, value);
        }
    }

    /// Reads `key`, seeing this connection's staged writes first.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.staged
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .or_else(|| self.pool.committed(key))
    }

    /// Returns whether a transaction is open on this connection.
    #[must_use]
    pub const fn in_transaction(&self) -> bool {
        self.in_transaction
    }
}

impl PooledConnection for MemoryConnection {
    async fn begin(&mut self) -> Result<(), DbError> {
        if let Some(cause) = self.pool.faults().fail_begin.take() {
            return Err(DbError(cause));
        }
        if self.in_transaction {
            return Err(DbError::new("transaction already in progress"));
        }
        self.in_transaction = true;
        self.pool.inner.counters.begun.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        if !self.in_transaction {
            return Err(DbError::new("no transaction in progress"));
        }
        if let Some(cause) = self.pool.faults().fail_commit.take() {
            return Err(DbError(cause));
        }
        self.pool.store().extend(self.staged.drain(..));
        self.in_transaction = false;
        self.pool.inner.counters.committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        self.pool
            .inner
            .counters
            .rolled_back
            .fetch_add(1, Ordering::SeqCst);
        if let Some(cause) = self.pool.faults().fail_rollback.take() {
            return Err(DbError(cause));
        }
        // Matches PostgreSQL: ROLLBACK outside a transaction is not an error.
        self.staged.clear();
        self.in_transaction = false;
        Ok(())
    }
}
