//! Fail-open cache for rendered responses.
//!
//! [`RenderCache::fetch_or_render`] returns a stored body when one exists for the [`CacheKey`],
//! otherwise it renders a fresh body, stores it, and returns it. The cache never fails a request:
//! backend errors and timeouts are logged and the body is rendered as if the cache didn't exist.

use crate::config::cache::CacheConfig;
use crate::error::cache::CacheError;
use async_trait::async_trait;
use key::CacheKey;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use strum_macros::{EnumString, IntoStaticStr};
use tracing::{debug, instrument, warn};

#[cfg(feature = "http")]
pub mod http;
pub mod key;
pub mod memory;
#[cfg(feature = "cache-redis")]
pub mod redis;

pub const DEFAULT_CONTENT_TYPE: &str = "text/html; charset=utf-8";

/// Storage for rendered bodies. Implementations should not retry internally; the
/// [`RenderCache`] bounds every call with a timeout and treats failures as a miss.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Store the value, overwriting any existing value. If a `ttl` is provided, the value should
    /// not be returned by [`CacheBackend::read`] after it elapses.
    async fn write(&self, key: &str, value: &[u8], ttl: Option<Duration>)
    -> Result<(), CacheError>;
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, EnumString, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
#[non_exhaustive]
pub enum CacheStatus {
    /// The body was read from the cache.
    Hit,
    /// The body was rendered and written to the cache.
    Miss,
    /// The cache is disabled; the body was rendered without reading or writing the cache.
    Bypass,
}

#[derive(Debug, Default, Clone, bon::Builder)]
#[non_exhaustive]
pub struct RenderOptions {
    /// How long the rendered body should be stored. Falls back to `cache.default-ttl`.
    pub ttl: Option<Duration>,
    /// Skip the cache read and always render. The fresh body is still written.
    #[builder(default)]
    pub force: bool,
    #[builder(into)]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub struct Rendered {
    pub body: Vec<u8>,
    pub status: CacheStatus,
    pub content_type: String,
}

impl Rendered {
    fn new(body: Vec<u8>, status: CacheStatus, options: &RenderOptions) -> Self {
        Self {
            body,
            status,
            content_type: options
                .content_type
                .clone()
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_owned()),
        }
    }

    pub fn text(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.body)
    }
}

#[derive(Clone)]
pub struct RenderCache {
    backend: Arc<dyn CacheBackend>,
    config: CacheConfig,
}

impl RenderCache {
    pub fn new(backend: Arc<dyn CacheBackend>, config: CacheConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn effective_key(&self, key: &CacheKey) -> String {
        key.effective(&self.config.namespace)
    }

    /// Return the stored body for `key`, or render, store and return a fresh one. Only an error
    /// from `producer` is returned; cache failures are logged and treated as a miss.
    #[instrument(skip_all, fields(view = key.view()))]
    pub async fn fetch_or_render<F, Fut, B, E>(
        &self,
        key: &CacheKey,
        producer: F,
        options: RenderOptions,
    ) -> Result<Rendered, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<B, E>>,
        B: Into<Vec<u8>>,
    {
        if !self.config.enable {
            let body = producer().await?.into();
            return Ok(Rendered::new(body, CacheStatus::Bypass, &options));
        }

        let key = self.effective_key(key);

        if !options.force {
            if let Some(body) = self.read(&key).await {
                return Ok(Rendered::new(body, CacheStatus::Hit, &options));
            }
        }

        let body = producer().await?.into();
        self.write(&key, &body, options.ttl).await;
        Ok(Rendered::new(body, CacheStatus::Miss, &options))
    }

    /// Like [`RenderCache::fetch_or_render`], but for a value that's stored as JSON. A stored
    /// value that can't be deserialized as `T` is treated as a miss.
    #[instrument(skip_all, fields(view = key.view()))]
    pub async fn fetch_or_render_json<T, F, Fut, E>(
        &self,
        key: &CacheKey,
        producer: F,
        options: RenderOptions,
    ) -> Result<(T, CacheStatus), E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.config.enable {
            return Ok((producer().await?, CacheStatus::Bypass));
        }

        let key = self.effective_key(key);

        if !options.force {
            if let Some(body) = self.read(&key).await {
                match serde_json::from_slice::<T>(&body) {
                    Ok(value) => return Ok((value, CacheStatus::Hit)),
                    Err(err) => {
                        warn!(key, %err, "Unable to deserialize cached value, rendering a fresh one")
                    }
                }
            }
        }

        let value = producer().await?;
        match serde_json::to_vec(&value) {
            Ok(body) => self.write(&key, &body, options.ttl).await,
            Err(err) => warn!(key, %err, "Unable to serialize value, it will not be cached"),
        }
        Ok((value, CacheStatus::Miss))
    }

    async fn read(&self, key: &str) -> Option<Vec<u8>> {
        let timeout = self.config.read_timeout;
        match tokio::time::timeout(timeout, self.backend.read(key)).await {
            Ok(Ok(value)) => {
                debug!(key, hit = value.is_some(), "Cache read");
                value
            }
            Ok(Err(err)) => {
                warn!(key, %err, "Cache read failed, rendering without the cache");
                None
            }
            Err(_) => {
                warn!(
                    key,
                    timeout_ms = timeout.as_millis(),
                    "Cache read timed out, rendering without the cache"
                );
                None
            }
        }
    }

    async fn write(&self, key: &str, value: &[u8], ttl: Option<Duration>) {
        let timeout = self.config.write_timeout;
        let ttl = ttl.or(self.config.default_ttl);
        match tokio::time::timeout(timeout, self.backend.write(key, value, ttl)).await {
            Ok(Ok(())) => debug!(key, ?ttl, "Cache write"),
            Ok(Err(err)) => warn!(key, %err, "Cache write failed"),
            Err(_) => warn!(key, timeout_ms = timeout.as_millis(), "Cache write timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryCache;
    use crate::config::AppConfig;
    use mockall::predicate::{always, eq};
    use rstest::{fixture, rstest};
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[fixture]
    #[cfg_attr(coverage_nightly, coverage(off))]
    fn config() -> CacheConfig {
        AppConfig::test(None).unwrap().cache
    }

    #[fixture]
    #[cfg_attr(coverage_nightly, coverage(off))]
    fn key() -> CacheKey {
        CacheKey::new("orders/show").part(7)
    }

    async fn render(count: &AtomicUsize) -> Result<String, Infallible> {
        count.fetch_add(1, Ordering::SeqCst);
        Ok("<p>Order 7</p>".to_owned())
    }

    #[rstest]
    #[tokio::test]
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn miss_then_hit(config: CacheConfig, key: CacheKey) {
        let cache = RenderCache::new(Arc::new(MemoryCache::new()), config);
        let count = AtomicUsize::new(0);

        let first = cache
            .fetch_or_render(&key, || render(&count), Default::default())
            .await
            .unwrap();
        let second = cache
            .fetch_or_render(&key, || render(&count), Default::default())
            .await
            .unwrap();

        assert_eq!(first.status, CacheStatus::Miss);
        assert_eq!(second.status, CacheStatus::Hit);
        assert_eq!(second.text().unwrap(), "<p>Order 7</p>");
        assert_eq!(second.content_type, DEFAULT_CONTENT_TYPE);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    #[tokio::test]
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn force_skips_read(config: CacheConfig, key: CacheKey) {
        let cache = RenderCache::new(Arc::new(MemoryCache::new()), config);
        let count = AtomicUsize::new(0);

        cache
            .fetch_or_render(&key, || render(&count), Default::default())
            .await
            .unwrap();
        let forced = cache
            .fetch_or_render(
                &key,
                || render(&count),
                RenderOptions::builder().force(true).build(),
            )
            .await
            .unwrap();

        assert_eq!(forced.status, CacheStatus::Miss);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[rstest]
    #[tokio::test]
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn disabled(mut config: CacheConfig, key: CacheKey) {
        config.enable = false;
        let mut backend = MockCacheBackend::new();
        backend.expect_read().never();
        backend.expect_write().never();
        let cache = RenderCache::new(Arc::new(backend), config);
        let count = AtomicUsize::new(0);

        let rendered = cache
            .fetch_or_render(&key, || render(&count), Default::default())
            .await
            .unwrap();

        assert_eq!(rendered.status, CacheStatus::Bypass);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    #[tokio::test]
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn backend_failure_falls_back_to_producer(config: CacheConfig, key: CacheKey) {
        let mut backend = MockCacheBackend::new();
        backend
            .expect_read()
            .returning(|_| Err(CacheError::Unavailable("connection refused".to_owned())));
        backend
            .expect_write()
            .times(1)
            .returning(|_, _, _| Err(CacheError::Unavailable("connection refused".to_owned())));
        let cache = RenderCache::new(Arc::new(backend), config);
        let count = AtomicUsize::new(0);

        let rendered = cache
            .fetch_or_render(&key, || render(&count), Default::default())
            .await
            .unwrap();

        assert_eq!(rendered.status, CacheStatus::Miss);
        assert_eq!(rendered.text().unwrap(), "<p>Order 7</p>");
    }

    #[rstest]
    #[tokio::test]
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn producer_error_is_returned(config: CacheConfig, key: CacheKey) {
        let mut backend = MockCacheBackend::new();
        backend.expect_read().returning(|_| Ok(None));
        backend.expect_write().never();
        let cache = RenderCache::new(Arc::new(backend), config);

        let result = cache
            .fetch_or_render(
                &key,
                || async { Err::<String, _>("template error") },
                Default::default(),
            )
            .await;

        assert_eq!(result.unwrap_err(), "template error");
    }

    #[rstest]
    #[tokio::test]
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn ttl_falls_back_to_default(mut config: CacheConfig, key: CacheKey) {
        config.default_ttl = Some(Duration::from_secs(60));
        let effective_key = key.effective(&config.namespace);
        let mut backend = MockCacheBackend::new();
        backend.expect_read().returning(|_| Ok(None));
        backend
            .expect_write()
            .with(
                eq(effective_key.clone()),
                always(),
                eq(Some(Duration::from_secs(60))),
            )
            .times(1)
            .returning(|_, _, _| Ok(()));
        backend
            .expect_write()
            .with(
                eq(effective_key),
                always(),
                eq(Some(Duration::from_secs(5))),
            )
            .times(1)
            .returning(|_, _, _| Ok(()));
        let cache = RenderCache::new(Arc::new(backend), config);
        let count = AtomicUsize::new(0);

        cache
            .fetch_or_render(&key, || render(&count), Default::default())
            .await
            .unwrap();
        cache
            .fetch_or_render(
                &key,
                || render(&count),
                RenderOptions::builder()
                    .ttl(Duration::from_secs(5))
                    .build(),
            )
            .await
            .unwrap();
    }

    #[rstest]
    #[tokio::test]
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn json_undecodable_value_is_a_miss(config: CacheConfig, key: CacheKey) {
        let backend = Arc::new(MemoryCache::new());
        backend
            .write(&key.effective(&config.namespace), b"not json", None)
            .await
            .unwrap();
        let cache = RenderCache::new(backend, config);

        let (value, status) = cache
            .fetch_or_render_json(
                &key,
                || async { Ok::<_, Infallible>(vec![7, 8, 9]) },
                Default::default(),
            )
            .await
            .unwrap();
        assert_eq!(value, vec![7, 8, 9]);
        assert_eq!(status, CacheStatus::Miss);

        let (value, status) = cache
            .fetch_or_render_json(
                &key,
                || async { Ok::<Vec<i32>, Infallible>(vec![]) },
                Default::default(),
            )
            .await
            .unwrap();
        assert_eq!(value, vec![7, 8, 9]);
        assert_eq!(status, CacheStatus::Hit);
    }
}
