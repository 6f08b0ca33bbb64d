//! Root scope construction.

use super::{ResourceHandles, Scope};
#[cfg(feature = "redis")]
use crate::cache::RedisCache;
use crate::observability::Logger;
use crate::pool::ConnectionPool;
use crate::reporting::ErrorReporter;
use crate::Error;
use std::fmt;
use std::sync::Arc;

/// Builder for a root [`Scope`] from already-constructed resources.
///
/// Any resource left unset is inactive on the built scope. The logger
/// defaults to [`Logger::new`].
///
/// # Example
///
/// ```rust,ignore
/// use ctxscope::{Logger, MemoryPool, Scope};
///
/// let root = Scope::builder()
///     .pool(MemoryPool::new(8))
///     .logger(Logger::new())
///     .build();
/// ```
pub struct ScopeBuilder<P: ConnectionPool> {
    pool: Option<P>,
    #[cfg(feature = "redis")]
    cache: Option<RedisCache>,
    logger: Option<Logger>,
    reporter: Option<Arc<dyn ErrorReporter>>,
}

impl<P: ConnectionPool> ScopeBuilder<P> {
    /// Creates a builder with no resources.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pool: None,
            #[cfg(feature = "redis")]
            cache: None,
            logger: None,
            reporter: None,
        }
    }

    /// Activates the database with `pool`.
    #[must_use]
    pub fn pool(mut self, pool: P) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Activates the cache with `cache`.
    #[cfg(feature = "redis")]
    #[must_use]
    pub fn cache(mut self, cache: RedisCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Sets the shared logger.
    #[must_use]
    pub fn logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Activates error reporting through `reporter`.
    #[must_use]
    pub fn reporter(self, reporter: impl ErrorReporter + 'static) -> Self {
        self.reporter_arc(Arc::new(reporter))
    }

    /// Activates error reporting through a shared reporter.
    #[must_use]
    pub fn reporter_arc(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Builds the root scope.
    #[must_use]
    pub fn build(self) -> Scope<P> {
        Scope::from_handles(Arc::new(ResourceHandles {
            pool: self.pool,
            #[cfg(feature = "redis")]
            cache: self.cache,
            logger: self.logger.unwrap_or_default(),
            reporter: self.reporter,
        }))
    }
}

impl<P: ConnectionPool> Default for ScopeBuilder<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// Root scope construction failed.
///
/// Carries the partially-constructed scope: the resources that initialized
/// before the failure are active on it, the rest are not.
pub struct ConstructionError<P: ConnectionPool> {
    scope: Box<Scope<P>>,
    error: Error,
}

impl<P: ConnectionPool> ConstructionError<P> {
    /// Returns the error that stopped construction.
    #[must_use]
    pub const fn error(&self) -> &Error {
        &self.error
    }

    /// Returns the partial scope.
    #[must_use]
    pub fn scope(&self) -> &Scope<P> {
        &self.scope
    }

    /// Splits into the partial scope and the error.
    #[must_use]
    pub fn into_parts(self) -> (Scope<P>, Error) {
        (*self.scope, self.error)
    }

    /// Discards the error and keeps the partial scope.
    #[must_use]
    pub fn into_scope(self) -> Scope<P> {
        *self.scope
    }
}

impl<P: ConnectionPool> fmt::Display for ConstructionError<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to construct scope: {}", self.error)
    }
}

impl<P: ConnectionPool> fmt::Debug for ConstructionError<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConstructionError")
            .field("error", &self.error)
            .field("scope", &self.scope)
            .finish()
    }
}

impl<P: ConnectionPool> std::error::Error for ConstructionError<P> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[cfg(feature = "postgres")]
mod connect {
    use super::{ConstructionError, ScopeBuilder};
    use crate::config::{ScopeConfig, redact_url};
    use crate::observability::Logger;
    use crate::pool::PgPool;
    use crate::reporting::WebhookReporter;
    use crate::{Error, Resource, Scope};
    use secrecy::ExposeSecret;

    impl Scope<PgPool> {
        /// Builds a root scope from configuration.
        ///
        /// Resources are initialized in order: error reporting, database,
        /// cache. Absent settings leave the resource inactive. The shared
        /// logger forwards to `tracing` at `config.logging.level`.
        ///
        /// Must be called from within a tokio runtime.
        ///
        /// # Errors
        ///
        /// Returns a [`ConstructionError`] carrying [`Error::Configuration`]
        /// for the first resource that failed, together with the scope built
        /// from the resources initialized before it.
        pub async fn connect(config: &ScopeConfig) -> Result<Self, ConstructionError<PgPool>> {
            Self::connect_with_logger(config, Logger::new()).await
        }

        /// Builds a root scope from configuration with an explicit logger.
        ///
        /// The logger's minimum severity is set to `config.logging.level`.
        ///
        /// # Errors
        ///
        /// See [`Scope::connect`].
        pub async fn connect_with_logger(
            config: &ScopeConfig,
            logger: Logger,
        ) -> Result<Self, ConstructionError<PgPool>> {
            logger.set_min_severity(config.logging.level);
            let mut builder = ScopeBuilder::new().logger(logger.clone());

            if let Some(destination) = &config.reporting_destination {
                match WebhookReporter::new(destination.expose_secret()) {
                    Ok(reporter) => builder = builder.reporter(reporter),
                    Err(error) => return Err(fail(builder, error)),
                }
            }

            if let Some(url) = &config.database_url {
                let url = url.expose_secret();
                let pool = if config.pool.lazy_connect {
                    PgPool::new(url, &config.pool)
                } else {
                    PgPool::connect(url, &config.pool).await
                };
                match pool {
                    Ok(pool) => {
                        logger.log(
                            crate::Severity::Debug,
                            &format!("database pool ready for {}", redact_url(url)),
                        );
                        builder = builder.pool(pool);
                    },
                    Err(error) => return Err(fail(builder, error)),
                }
            }

            if let Some(url) = &config.cache_url {
                #[cfg(feature = "redis")]
                {
                    match crate::cache::RedisCache::new(url.expose_secret()) {
                        Ok(cache) => builder = builder.cache(cache),
                        Err(error) => return Err(fail(builder, error)),
                    }
                }
                #[cfg(not(feature = "redis"))]
                {
                    let _ = url;
                    return Err(fail(
                        builder,
                        Error::configuration(Resource::Cache, "built without the `redis` feature"),
                    ));
                }
            }

            Ok(builder.build())
        }
    }

    fn fail(builder: ScopeBuilder<PgPool>, error: Error) -> ConstructionError<PgPool> {
        let error = match error {
            Error::Configuration { .. } => error,
            other => Error::configuration(Resource::Database, other),
        };
        ConstructionError {
            scope: Box::new(builder.build()),
            error,
        }
    }
}
