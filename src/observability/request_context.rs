//! Task-local request identity.
//!
//! [`Scope::with_request`](crate::Scope::with_request) runs each handler inside
//! a [`RequestContext`], so code without access to the scope can still tag its
//! output with the current request id.

use chrono::{DateTime, Utc};
use std::future::Future;
use uuid::Uuid;

tokio::task_local! {
    static CURRENT: RequestContext;
}

/// Identity of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    request_id: String,
    started_at: DateTime<Utc>,
}

impl RequestContext {
    /// Creates a context with a fresh time-ordered id.
    #[must_use]
    pub fn generate() -> Self {
        Self::with_id(Uuid::now_v7().to_string())
    }

    /// Creates a context for an id assigned upstream, e.g. from a request header.
    #[must_use]
    pub fn with_id(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            started_at: Utc::now(),
        }
    }

    /// Returns the request id.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Returns when the context was created.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Runs `fut` with this context as the current one.
    pub async fn run<F: Future>(self, fut: F) -> F::Output {
        CURRENT.scope(self, fut).await
    }

    /// Returns the context of the running request, if any.
    #[must_use]
    pub fn current() -> Option<Self> {
        CURRENT.try_with(Clone::clone).ok()
    }
}

/// Returns the id of the running request, if any.
#[must_use]
pub fn current_request_id() -> Option<String> {
    CURRENT.try_with(|ctx| ctx.request_id.clone()).ok()
}
