//! Per-request helper.

use super::Scope;
use crate::observability::RequestContext;
use crate::pool::ConnectionPool;

impl<P: ConnectionPool> Scope<P> {
    /// Runs `handler` in a fresh request scope and cleans it up afterwards.
    ///
    /// The request scope is a clone of `self` carrying a generated
    /// `request_id` log field, which is also visible through
    /// [`current_request_id`](crate::current_request_id) while the handler
    /// runs. Cleanup runs whether the handler returned `Ok` or `Err`.
    ///
    /// If the handler panics, cleanup does not run; the scope's drop discards
    /// any connection it still held.
    pub async fn with_request<F, T>(&self, handler: F) -> T
    where
        F: AsyncFnOnce(&mut Self) -> T,
    {
        self.with_request_context(RequestContext::generate(), handler)
            .await
    }

    /// Like [`Scope::with_request`] with a caller-supplied request context,
    /// e.g. one carrying an upstream request id.
    pub async fn with_request_context<F, T>(&self, context: RequestContext, handler: F) -> T
    where
        F: AsyncFnOnce(&mut Self) -> T,
    {
        let mut scope = self.clone();
        scope.add_log_field("request_id", context.request_id());

        context
            .run(async {
                let output = handler(&mut scope).await;
                scope.cleanup().await;
                output
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use crate::observability::{MemorySink, RequestContext};
    use crate::pool::{ConnectionPool, MemoryPool};
    use crate::{Error, Logger, Scope, ScopeState, current_request_id};
    use serde_json::Value;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_request_is_cleaned_up_on_error() {
        let pool = MemoryPool::new(1);
        let root: Scope<MemoryPool> = Scope::builder().pool(pool.clone()).build();

        let result = root
            .with_request(async |scope| -> Result<(), Error> {
                let mut tx = scope.transaction().await?;
                tx.put("k", "v");
                Err(Error::ScopeCleaned)
            })
            .await;

        assert!(result.is_err());
        assert_eq!(pool.committed("k"), None);
        assert_eq!(pool.stats().rolled_back, 1);
        assert_eq!(pool.status().available, 1);
        assert_eq!(root.state(), ScopeState::Idle);
    }

    #[tokio::test]
    async fn test_request_id_is_logged_and_propagated() {
        let sink = MemorySink::new();
        let root: Scope<MemoryPool> = Scope::builder()
            .logger(Logger::with_sink(Arc::new(sink.clone())))
            .build();

        let seen = root
            .with_request_context(RequestContext::with_id("req-42"), async |scope| {
                scope.info("handling");
                current_request_id()
            })
            .await;

        assert_eq!(seen.as_deref(), Some("req-42"));
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fields.get("request_id"), Some(&Value::from("req-42")));
        assert!(root.log_fields().is_empty());
    }

    #[tokio::test]
    async fn test_committed_work_survives_cleanup() {
        let pool = MemoryPool::new(1);
        let root: Scope<MemoryPool> = Scope::builder().pool(pool.clone()).build();

        let result = root
            .with_request(async |scope| -> Result<(), Error> {
                let mut tx = scope.transaction().await?;
                tx.put("order:7", "paid");
                tx.commit().await
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(pool.committed("order:7").as_deref(), Some("paid"));
        assert_eq!(pool.stats().rolled_back, 0);
        assert_eq!(pool.stats().released, 1);
    }
}
