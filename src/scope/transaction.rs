//! Borrowed transaction handle.

use crate::pool::{PooledConnection, TransactionId};
use crate::{Error, Result};
use std::ops::{Deref, DerefMut};

/// The open transaction of a [`Scope`](crate::Scope).
///
/// Dereferences to the underlying connection so queries run inside the
/// transaction. Dropping the handle leaves the transaction open: the next
/// call to [`Scope::transaction`](crate::Scope::transaction) returns it again
/// and [`Scope::cleanup`](crate::Scope::cleanup) rolls it back.
#[derive(Debug)]
pub struct Transaction<'a, C> {
    connection: &'a mut C,
    open: &'a mut Option<TransactionId>,
    id: TransactionId,
}

impl<'a, C: PooledConnection> Transaction<'a, C> {
    pub(super) const fn new(
        connection: &'a mut C,
        open: &'a mut Option<TransactionId>,
        id: TransactionId,
    ) -> Self {
        Self {
            connection,
            open,
            id,
        }
    }

    /// Returns the id of this transaction.
    #[must_use]
    pub const fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the connection the transaction runs on.
    pub const fn connection(&mut self) -> &mut C {
        self.connection
    }

    /// Commits the transaction.
    ///
    /// On success the scope keeps its connection and the next
    /// [`Scope::transaction`](crate::Scope::transaction) call begins a new
    /// transaction on it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Commit`] if the backend refused. The transaction
    /// stays open and is rolled back by cleanup.
    pub async fn commit(self) -> Result<()> {
        self.connection.commit().await.map_err(Error::Commit)?;
        *self.open = None;
        Ok(())
    }

    /// Rolls back the transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Rollback`] if the backend refused. The transaction
    /// stays open and cleanup retries the rollback.
    pub async fn rollback(self) -> Result<()> {
        self.connection.rollback().await.map_err(Error::Rollback)?;
        *self.open = None;
        Ok(())
    }
}

impl<C> Deref for Transaction<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.connection
    }
}

impl<C> DerefMut for Transaction<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        self.connection
    }
}

#[cfg(test)]
mod tests {
    use crate::pool::MemoryPool;
    use crate::{Error, Scope, ScopeState};

    #[tokio::test]
    async fn test_writes_visible_only_after_commit() {
        let pool = MemoryPool::new(1);
        let mut scope: Scope<MemoryPool> = Scope::builder().pool(pool.clone()).build();

        if let Ok(mut tx) = scope.transaction().await {
            tx.put("order:1", "pending");
            assert_eq!(tx.get("order:1").as_deref(), Some("pending"));
            assert_eq!(pool.committed("order:1"), None);
            assert!(tx.commit().await.is_ok());
        }

        assert_eq!(pool.committed("order:1").as_deref(), Some("pending"));
        assert_eq!(scope.state(), ScopeState::Connected);
    }

    #[tokio::test]
    async fn test_dropped_handle_keeps_transaction_open() {
        let pool = MemoryPool::new(1);
        let mut scope: Scope<MemoryPool> = Scope::builder().pool(pool.clone()).build();

        if let Ok(mut tx) = scope.transaction().await {
            tx.put("k", "v");
        }
        assert_eq!(scope.state(), ScopeState::InTransaction);

        let seen = scope.transaction().await.ok().and_then(|tx| tx.get("k"));
        assert_eq!(seen.as_deref(), Some("v"));

        scope.cleanup().await;
        assert_eq!(pool.committed("k"), None);
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_transaction_for_cleanup() {
        let pool = MemoryPool::new(1);
        let mut scope: Scope<MemoryPool> = Scope::builder().pool(pool.clone()).build();

        pool.fail_next_commit("serialization failure");
        let result = match scope.transaction().await {
            Ok(mut tx) => {
                tx.put("k", "v");
                tx.commit().await
            },
            Err(e) => Err(e),
        };

        assert!(matches!(result, Err(Error::Commit(_))));
        assert_eq!(scope.state(), ScopeState::InTransaction);

        scope.cleanup().await;
        assert_eq!(pool.stats().rolled_back, 1);
        assert_eq!(pool.committed("k"), None);
    }
}
