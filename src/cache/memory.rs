use crate::cache::CacheBackend;
use crate::error::cache::CacheError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Used when no `cache.max-entries` is configured.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// A [`CacheBackend`] that keeps entries in the memory of the current process.
///
/// Expired entries are removed when they're read, or when the cache is full. A full cache then
/// drops the oldest entry to make room for a new one.
#[derive(Debug)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Entry>>,
    max_entries: usize,
}

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    written_at: Instant,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::with_max_entries(DEFAULT_MAX_ENTRIES)
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            entries: Default::default(),
            max_entries: max_entries.max(1),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

/// Make room for one more entry.
fn evict(entries: &mut HashMap<String, Entry>, max_entries: usize, now: Instant) {
    if entries.len() < max_entries {
        return;
    }
    entries.retain(|_, entry| !entry.is_expired(now));
    if entries.len() < max_entries {
        return;
    }
    let oldest = entries
        .iter()
        .min_by_key(|(_, entry)| entry.written_at)
        .map(|(key, _)| key.clone());
    if let Some(oldest) = oldest {
        entries.remove(&oldest);
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return Ok(None),
                Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
            }
        }

        // Expired. Another task may have rewritten the entry since the read lock was released.
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn write(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let now = Instant::now();
        let expires_at = ttl.and_then(|ttl| now.checked_add(ttl));
        let mut entries = self.entries.write().await;
        if !entries.contains_key(key) {
            evict(&mut entries, self.max_entries, now);
        }
        entries.insert(
            key.to_owned(),
            Entry {
                value: value.to_vec(),
                written_at: now,
                expires_at,
            },
        );
        Ok(())
    }
}

/// A [`CacheBackend`] that never stores anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCache;

#[async_trait]
impl CacheBackend for NoopCache {
    async fn read(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(None)
    }

    async fn write(
        &self,
        _key: &str,
        _value: &[u8],
        _ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        Ok(())
    }
}
