//! Redis cache client.
//!
//! The scope only carries this handle; it never issues cache commands itself.
//!
//! # Connection Management
//!
//! [`RedisCache::new`] only parses the URL. The first command opens a
//! `ConnectionManager`, which multiplexes all callers over one connection and
//! reconnects on failure.
//!
//! # Command Timeout
//!
//! Connecting and every command are bounded by a 5-second timeout so a slow
//! or unresponsive server cannot stall a request indefinitely.

use crate::{Error, Resource, Result};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisResult};
use std::future::Future;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Default timeout for Redis operations.
const REDIS_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared Redis cache handle.
pub struct RedisCache {
    /// Redis client.
    client: Client,
    /// Connection opened on first use.
    connection: OnceCell<ConnectionManager>,
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache")
            .field("connected", &self.connection.initialized())
            .finish_non_exhaustive()
    }
}

/// Helper to map command errors.
fn cache_error(operation: &str, cause: impl std::fmt::Display) -> Error {
    Error::Cache {
        operation: operation.to_string(),
        cause: cause.to_string(),
    }
}

/// Runs a Redis future under [`REDIS_TIMEOUT`].
async fn timed<T>(operation: &str, fut: impl Future<Output = RedisResult<T>>) -> Result<T> {
    match tokio::time::timeout(REDIS_TIMEOUT, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(cache_error(operation, e)),
        Err(_) => Err(cache_error(operation, "timed out")),
    }
}

impl RedisCache {
    /// Creates a cache handle from a `redis://` or `rediss://` URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the URL is malformed.
    pub fn new(connection_url: &str) -> Result<Self> {
        let client =
            Client::open(connection_url).map_err(|e| Error::configuration(Resource::Cache, e))?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
        })
    }

    /// Returns the underlying Redis client.
    #[must_use]
    pub const fn client(&self) -> &Client {
        &self.client
    }

    /// Returns the shared connection, opening it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cache`] if the server cannot be reached.
    pub async fn connection(&self) -> Result<ConnectionManager> {
        let manager = self
            .connection
            .get_or_try_init(|| timed("connect", ConnectionManager::new(self.client.clone())))
            .await?;
        Ok(manager.clone())
    }

    /// Reads a string value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cache`] if the command fails.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        let value: Option<String> = timed("get", conn.get(key)).await?;
        Ok(value)
    }

    /// Writes a string value, optionally expiring after `ttl` (whole seconds, at least one).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cache`] if the command fails.
    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.connection().await?;
        match ttl {
            Some(ttl) => timed::<()>("set_ex", conn.set_ex(key, value, ttl.as_secs().max(1))).await,
            None => timed::<()>("set", conn.set(key, value)).await,
        }
    }

    /// Deletes a key, returning whether it existed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cache`] if the command fails.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let removed: u64 = timed("del", conn.del(key)).await?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_url_is_configuration_error() {
        let result = RedisCache::new("not-a-redis-url");
        assert!(matches!(
            result,
            Err(Error::Configuration {
                resource: Resource::Cache,
                ..
            })
        ));
    }

    #[test]
    fn test_valid_url_does_not_connect() {
        let cache = RedisCache::new("redis://127.0.0.1:1/0");
        assert!(
            cache
                .ok()
                .is_some_and(|c| format!("{c:?}").contains("connected: false"))
        );
    }

    #[tokio::test]
    async fn test_unreachable_server_is_cache_error() {
        let Ok(cache) = RedisCache::new("redis://127.0.0.1:1/0") else {
            unreachable!("URL is well-formed");
        };
        assert!(matches!(
            cache.get("key").await,
            Err(Error::Cache { ref operation, .. }) if operation == "connect"
        ));
    }
}
