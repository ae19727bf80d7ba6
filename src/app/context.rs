use crate::cache::memory::{MemoryCache, NoopCache};
use crate::cache::{CacheBackend, RenderCache};
use crate::config::AppConfig;
use crate::config::cache::CacheBackendKind;
use crate::config::queue::QueueBackend;
use crate::error::ErrandResult;
#[cfg(any(not(feature = "queue-pg"), not(feature = "cache-redis")))]
use crate::error::config::ConfigError;
use crate::queue::QueueStore;
use crate::queue::memory::MemoryQueueStore;
use std::sync::Arc;
use tracing::info;

/// The shared resources of the app: the config, the [`QueueStore`] that holds jobs, and the
/// [`RenderCache`].
///
/// Cheap to clone. If the app uses a custom state type, it should implement
/// [`axum_core::extract::FromRef`] to allow getting the [`AppContext`] from the state.
#[derive(Clone)]
pub struct AppContext {
    inner: Arc<AppContextInner>,
}

struct AppContextInner {
    config: AppConfig,
    queue: Arc<dyn QueueStore>,
    cache: RenderCache,
}

impl AppContext {
    /// Build the context, connecting to the queue store and cache backend selected in the config.
    pub async fn new(config: AppConfig) -> ErrandResult<Self> {
        let queue = queue_store(&config).await?;
        let cache = cache_backend(&config).await?;
        Ok(Self::from_parts(config, queue, cache))
    }

    /// Build the context from already-constructed backends.
    pub fn from_parts(
        config: AppConfig,
        queue: Arc<dyn QueueStore>,
        cache: Arc<dyn CacheBackend>,
    ) -> Self {
        let cache = RenderCache::new(cache, config.cache.clone());
        Self {
            inner: Arc::new(AppContextInner {
                config,
                queue,
                cache,
            }),
        }
    }

    /// A context with in-memory backends. Uses [`AppConfig::test`] if no config is provided.
    #[cfg(any(test, feature = "testing"))]
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn test(config: Option<AppConfig>) -> ErrandResult<Self> {
        let config = match config {
            Some(config) => config,
            None => AppConfig::test(None)?,
        };
        Ok(Self::from_parts(
            config,
            Arc::new(MemoryQueueStore::new()),
            Arc::new(MemoryCache::new()),
        ))
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn queue(&self) -> &Arc<dyn QueueStore> {
        &self.inner.queue
    }

    pub fn cache(&self) -> &RenderCache {
        &self.inner.cache
    }
}

async fn queue_store(config: &AppConfig) -> ErrandResult<Arc<dyn QueueStore>> {
    let backend: &str = (&config.queue.backend).into();
    info!(queue.backend = backend, "Initializing queue store");

    let store: Arc<dyn QueueStore> = match config.queue.backend {
        QueueBackend::Memory => Arc::new(MemoryQueueStore::new()),
        #[cfg(feature = "queue-pg")]
        QueueBackend::Postgres => {
            let uri = config.queue.uri.as_ref().ok_or_else(|| {
                crate::error::config::ConfigError::MissingValue("queue.uri".to_owned())
            })?;
            Arc::new(crate::queue::pg::PgQueueStore::new(uri).await?)
        }
        #[cfg(not(feature = "queue-pg"))]
        QueueBackend::Postgres => {
            return Err(ConfigError::UnsupportedBackend(
                backend.to_owned(),
                "queue-pg".to_owned(),
            )
            .into());
        }
    };
    Ok(store)
}

async fn cache_backend(config: &AppConfig) -> ErrandResult<Arc<dyn CacheBackend>> {
    let backend: &str = (&config.cache.backend).into();
    info!(
        cache.backend = backend,
        cache.enable = config.cache.enable,
        "Initializing cache backend"
    );

    if !config.cache.enable {
        return Ok(Arc::new(NoopCache));
    }

    let cache: Arc<dyn CacheBackend> = match config.cache.backend {
        CacheBackendKind::Memory => {
            Arc::new(MemoryCache::with_max_entries(config.cache.max_entries))
        }
        CacheBackendKind::None => Arc::new(NoopCache),
        #[cfg(feature = "cache-redis")]
        CacheBackendKind::Redis => {
            let uri = config.cache.uri.as_ref().ok_or_else(|| {
                crate::error::config::ConfigError::MissingValue("cache.uri".to_owned())
            })?;
            Arc::new(crate::cache::redis::RedisCache::new(uri).await?)
        }
        #[cfg(not(feature = "cache-redis"))]
        CacheBackendKind::Redis => {
            return Err(ConfigError::UnsupportedBackend(
                backend.to_owned(),
                "cache-redis".to_owned(),
            )
            .into());
        }
    };
    Ok(cache)
}
