//! Connection pool abstraction.
//!
//! A [`Scope`](crate::Scope) talks to its database only through the two traits
//! in this module. [`ConnectionPool`] hands out exclusively-owned connections
//! and takes them back; [`PooledConnection`] drives the transaction commands on
//! one checked-out connection.
//!
//! Two backends are provided:
//!
//! - [`PgPool`]: PostgreSQL through `deadpool-postgres` (feature `postgres`)
//! - [`MemoryPool`]: an in-process pool with a committed-write store, used by
//!   tests and local development

mod memory;
#[cfg(feature = "postgres")]
mod postgresql;

pub use memory::{MemoryConnection, MemoryPool, MemoryPoolStats};
#[cfg(feature = "postgres")]
pub use postgresql::{PgConnection, PgPool};

use crate::{AcquireError, DbError};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

/// A pool of database connections shared by every scope.
///
/// Implementations must be safe for concurrent checkout from many tasks.
pub trait ConnectionPool: Send + Sync + 'static {
    /// Connection type handed out by this pool.
    type Connection: PooledConnection;

    /// Checks out a connection, waiting for capacity if the pool is exhausted.
    fn acquire(&self) -> impl Future<Output = Result<Self::Connection, AcquireError>> + Send;

    /// Returns a connection to the pool for reuse.
    fn release(&self, connection: Self::Connection);

    /// Removes a connection from the pool without returning it for reuse.
    ///
    /// Used for connections that may still carry an open transaction.
    fn discard(&self, connection: Self::Connection) {
        drop(connection);
    }

    /// Returns a snapshot of the pool's occupancy.
    fn status(&self) -> PoolStatus;
}

/// A connection checked out of a [`ConnectionPool`].
pub trait PooledConnection: Send + 'static {
    /// Starts a transaction on this connection.
    fn begin(&mut self) -> impl Future<Output = Result<(), DbError>> + Send;

    /// Commits the open transaction.
    fn commit(&mut self) -> impl Future<Output = Result<(), DbError>> + Send;

    /// Rolls back the open transaction.
    fn rollback(&mut self) -> impl Future<Output = Result<(), DbError>> + Send;
}

/// Occupancy snapshot of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStatus {
    /// Maximum number of connections the pool will hold.
    pub max_size: usize,
    /// Connections currently open (idle plus checked out).
    pub size: usize,
    /// Connections that can be checked out without waiting.
    pub available: usize,
}

/// Identifier of one transaction begun by a scope.
///
/// Ids are unique for the life of the process, which lets callers tell
/// whether two handles refer to the same underlying transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(u64);

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

impl TransactionId {
    /// Allocates the next process-unique id.
    pub(crate) fn next() -> Self {
        Self(NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the numeric value of the id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}
