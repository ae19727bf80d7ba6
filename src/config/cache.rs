use serde_derive::{Deserialize, Serialize};
use serde_with::{serde_as, skip_serializing_none};
use std::time::Duration;
use strum_macros::{EnumString, IntoStaticStr};
use url::Url;
use validator::{Validate, ValidationError};

/// Configuration for the render cache.
#[serde_as]
#[skip_serializing_none]
#[derive(Debug, Clone, Validate, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[validate(schema(function = "validate_cache_config"))]
#[non_exhaustive]
pub struct CacheConfig {
    /// Disable to always render fresh content. Responses are then marked as a cache "bypass".
    pub enable: bool,

    /// Prefix for every key written by the app. Allows multiple apps (or multiple deployments of
    /// the same app) to share a backend without overwriting each other's entries.
    pub namespace: String,

    /// How long entries live when the caller doesn't provide a TTL. If not provided, entries
    /// live until the backend evicts them.
    #[serde(default)]
    #[serde_as(as = "Option<serde_with::DurationSeconds>")]
    pub default_ttl: Option<Duration>,

    /// The maximum time to wait for the backend when reading an entry. A read that takes longer
    /// is treated as a miss.
    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub read_timeout: Duration,

    /// The maximum time to wait for the backend when writing an entry. A write that takes longer
    /// is abandoned.
    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub write_timeout: Duration,

    #[serde(default)]
    pub backend: CacheBackendKind,

    /// The maximum number of entries kept by the `memory` backend. When full, expired entries
    /// are dropped first, then the oldest entry.
    #[serde(default = "CacheConfig::default_max_entries")]
    #[validate(range(min = 1))]
    pub max_entries: usize,

    /// The URI of the Redis server to use when `backend = "redis"`.
    #[serde(default)]
    pub uri: Option<Url>,
}

impl CacheConfig {
    fn default_max_entries() -> usize {
        crate::cache::memory::DEFAULT_MAX_ENTRIES
    }
}

#[derive(
    Debug, Default, Clone, Eq, PartialEq, Serialize, Deserialize, EnumString, IntoStaticStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
#[non_exhaustive]
pub enum CacheBackendKind {
    #[default]
    Memory,
    /// Requires the `cache-redis` feature.
    Redis,
    /// Never store anything. Every request is a miss.
    None,
}

fn validate_cache_config(config: &CacheConfig) -> Result<(), ValidationError> {
    if config.backend == CacheBackendKind::Redis && config.uri.is_none() {
        return Err(ValidationError::new("cache.uri is required for the redis backend"));
    }
    if config.namespace.is_empty() {
        return Err(ValidationError::new("cache.namespace can not be empty"));
    }
    Ok(())
}
