use crate::error::Error;
use std::time::Duration;

/// Errors returned by a [`crate::cache::CacheBackend`]. The [`crate::cache::RenderCache`] never
/// surfaces these to its callers; they are logged and the cache is bypassed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CacheError {
    #[error("The cache backend is unavailable: {0}")]
    Unavailable(String),

    #[error("The cache backend did not respond within `{0:?}`")]
    Timeout(Duration),

    #[cfg(feature = "cache-redis")]
    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}
