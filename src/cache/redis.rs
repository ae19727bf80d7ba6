//! [`CacheBackend`] backed by Redis.

use crate::cache::CacheBackend;
use crate::error::cache::CacheError;
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::time::Duration;
use url::Url;

/// Stores entries as plain Redis strings. Entries with a TTL are written with `SET .. PX` so
/// Redis evicts them; entries without one are evicted according to the server's
/// `maxmemory-policy`.
#[derive(Clone)]
pub struct RedisCache {
    connection: ConnectionManager,
}

impl RedisCache {
    pub async fn new(uri: &Url) -> Result<Self, CacheError> {
        let client = redis::Client::open(uri.as_str())?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self { connection })
    }

    pub fn from_connection(connection: ConnectionManager) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut connection = self.connection.clone();
        let value: Option<Vec<u8>> = connection.get(key).await?;
        Ok(value)
    }

    async fn write(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let mut connection = self.connection.clone();
        match ttl {
            Some(ttl) => {
                let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
                let _: () = connection.pset_ex(key, value, millis).await?;
            }
            None => {
                let _: () = connection.set(key, value).await?;
            }
        }
        Ok(())
    }
}
