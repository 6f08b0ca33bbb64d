//! Concurrent request tests.
//!
//! Runs several request scopes cloned from one root on separate tasks and
//! checks that their transactions stay independent.

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use ctxscope::{ConnectionPool, Error, MemoryPool, Scope, ScopeState, TransactionId};
use std::sync::Arc;
use tokio::sync::Barrier;

/// Writes inside the scope's transaction, then fails without committing.
async fn abandoned_write(scope: &mut Scope<MemoryPool>, barrier: &Barrier) -> Result<(), Error> {
    let mut tx = scope.transaction().await?;
    tx.put("order:b", "shipped");
    barrier.wait().await;
    Err(Error::ScopeCleaned)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_committed_request_persists_and_abandoned_request_rolls_back() {
    let pool = MemoryPool::new(4);
    let root: Scope<MemoryPool> = Scope::builder().pool(pool.clone()).build();
    let before = pool.status().available;
    let barrier = Arc::new(Barrier::new(2));

    let mut a = root.clone();
    let a_barrier = Arc::clone(&barrier);
    let request_a = tokio::spawn(async move {
        let mut tx = a.transaction().await.unwrap();
        tx.put("order:a", "shipped");
        a_barrier.wait().await;
        tx.commit().await.unwrap();
        a.cleanup().await;
        a
    });

    let mut b = root.clone();
    let b_barrier = Arc::clone(&barrier);
    let request_b = tokio::spawn(async move {
        let outcome = abandoned_write(&mut b, &b_barrier).await;
        b.cleanup().await;
        (b, outcome)
    });

    let a = request_a.await.unwrap();
    let (b, outcome) = request_b.await.unwrap();

    assert!(outcome.is_err());
    assert_eq!(pool.committed("order:a").as_deref(), Some("shipped"));
    assert_eq!(pool.committed("order:b"), None);
    assert_eq!(a.state(), ScopeState::Cleaned);
    assert_eq!(b.state(), ScopeState::Cleaned);
    assert_eq!(pool.status().available, before);
    assert_eq!(root.state(), ScopeState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_requests_share_a_small_pool() {
    let pool = MemoryPool::new(2);
    let root: Scope<MemoryPool> = Scope::builder().pool(pool.clone()).build();

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let mut scope = root.clone();
            tokio::spawn(async move {
                let mut tx = scope.transaction().await.unwrap();
                tx.put(format!("key:{i}"), i.to_string());
                if i % 2 == 0 {
                    tx.commit().await.unwrap();
                }
                tokio::task::yield_now().await;
                scope.cleanup().await;
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(pool.committed_len(), 8);
    assert_eq!(pool.status().available, 2);
    let stats = pool.stats();
    assert_eq!(stats.acquired, 16);
    assert_eq!(stats.released, 16);
    assert_eq!(stats.rolled_back, 8);
}

#[tokio::test]
async fn test_with_request_runs_concurrently_on_one_task() {
    let pool = MemoryPool::new(2);
    let root: Scope<MemoryPool> = Scope::builder().pool(pool.clone()).build();

    let (first, second) = tokio::join!(
        root.with_request(async |scope| -> Result<TransactionId, Error> {
            let tx = scope.transaction().await?;
            Ok(tx.id())
        }),
        root.with_request(async |scope| -> Result<TransactionId, Error> {
            let tx = scope.transaction().await?;
            Ok(tx.id())
        }),
    );

    assert_ne!(first.unwrap(), second.unwrap());
    assert_eq!(pool.status().available, 2);
    assert_eq!(pool.stats().rolled_back, 2);
}
