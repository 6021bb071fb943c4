use crate::error::{ProximityError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::hash::{Hash, Hasher};
use std::sync::RwLock;
use std::time::Duration;
use tokio::time::Instant;

const CACHE_SHARDS: usize = 16;

/// Key-value cache with per-entry TTL.
///
/// Implementations may be remote and slow; callers wrap every call in a
/// timeout and treat failures as misses.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;

    async fn invalidate(&self, key: &str) -> Result<()>;

    /// Look up several keys at once, answering in `keys` order
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }

    /// Store several entries sharing one TTL
    async fn set_many(&self, entries: Vec<(String, Bytes)>, ttl: Duration) -> Result<()> {
        for (key, value) in entries {
            self.set(&key, value, ttl).await?;
        }
        Ok(())
    }

    /// Drop expired entries eagerly. Returns how many were dropped.
    async fn purge_expired(&self) -> Result<usize> {
        Ok(0)
    }
}

/// A cached value and its expiration
#[derive(Debug, Clone)]
pub struct CacheItem {
    pub value: Bytes,
    pub expires_at: Instant,
}

impl CacheItem {
    pub fn with_ttl(value: impl Into<Bytes>, ttl: Duration) -> Self {
        Self {
            value: value.into(),
            expires_at: Instant::now() + ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

type Shard = FxHashMap<String, CacheItem>;

/// In-process cache, sharded by key hash.
///
/// Expired items are dropped lazily on read and by `purge_expired`. When a
/// shard is full, expired items go first, then the one closest to expiry.
pub struct MemoryCache {
    shards: Vec<RwLock<Shard>>,
    shard_capacity: usize,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            shards: (0..CACHE_SHARDS)
                .map(|_| RwLock::new(FxHashMap::default()))
                .collect(),
            shard_capacity: max_entries.div_ceil(CACHE_SHARDS).max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .filter_map(|shard| shard.read().ok())
            .map(|shard| shard.values().filter(|item| !item.is_expired()).count())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shard(&self, key: &str) -> &RwLock<Shard> {
        let mut hasher = rustc_hash::FxHasher::default();
        key.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % CACHE_SHARDS]
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(100_000)
    }
}

fn evict_one(shard: &mut Shard) {
    shard.retain(|_, item| !item.is_expired());
    if shard.is_empty() {
        return;
    }
    let soonest = shard
        .iter()
        .min_by_key(|(_, item)| item.expires_at)
        .map(|(key, _)| key.clone());
    if let Some(key) = soonest {
        shard.remove(&key);
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let shard = self.shard(key);
        {
            let items = shard.read().map_err(|_| ProximityError::Lock("cache"))?;
            match items.get(key) {
                Some(item) if !item.is_expired() => return Ok(Some(item.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }

        let mut items = shard.write().map_err(|_| ProximityError::Lock("cache"))?;
        if items.get(key).is_some_and(|item| item.is_expired()) {
            items.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        let mut items = self
            .shard(key)
            .write()
            .map_err(|_| ProximityError::Lock("cache"))?;
        if items.len() >= self.shard_capacity && !items.contains_key(key) {
            evict_one(&mut items);
        }
        items.insert(key.to_string(), CacheItem::with_ttl(value, ttl));
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        self.shard(key)
            .write()
            .map_err(|_| ProximityError::Lock("cache"))?
            .remove(key);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let mut purged = 0;
        for shard in &self.shards {
            let mut items = shard.write().map_err(|_| ProximityError::Lock("cache"))?;
            let before = items.len();
            items.retain(|_, item| !item.is_expired());
            purged += before - items.len();
        }
        Ok(purged)
    }
}
