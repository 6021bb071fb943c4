//! Version and generation checks around the cache.
//!
//! Entity entries hold a full [`Business`]; a read supplies the minimum
//! version it will accept (normally the version the index has placed),
//! so an old snapshot written back by a slow reader is ignored rather
//! than served.
//!
//! Query entries are keyed by the rounded query center, the radius and the
//! category filter, and carry the generation token current when their
//! computation started. Every write bumps the generation of the categories
//! it touches plus the unfiltered generation, so a result computed before
//! the write can never be returned after it. A query entry stores every
//! matching business within `radius + slack` of the rounded center, which
//! is a superset of the exact answer for any center that rounds to the same
//! key; readers re-filter against their own center.
//!
//! Cache failures and timeouts never fail a read: they are logged and
//! treated as misses.

use crate::cache::Cache;
use crate::config::CacheConfig;
use crate::error::{Component, ProximityError, Result};
use crate::spatial::Point;
use crate::types::{Business, BusinessId, Category, Version};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

const METERS_PER_DEGREE: f64 = 111_320.0;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    key: String,
    category: Option<Category>,
}

impl QueryKey {
    pub fn as_str(&self) -> &str {
        &self.key
    }

    pub fn category(&self) -> Option<Category> {
        self.category
    }
}

#[derive(Serialize, Deserialize)]
struct CachedQuery {
    generation: u64,
    businesses: Vec<Business>,
}

pub struct CacheLayer {
    cache: Arc<dyn Cache>,
    config: CacheConfig,
    category_generations: [AtomicU64; Category::ALL.len()],
    all_generation: AtomicU64,
}

impl CacheLayer {
    pub fn new(cache: Arc<dyn Cache>, config: CacheConfig) -> Self {
        Self {
            cache,
            config,
            category_generations: std::array::from_fn(|_| AtomicU64::new(0)),
            all_generation: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn entity_key(id: &BusinessId) -> String {
        format!("biz:{}", id)
    }

    /// Canonical key for a nearby search; the result limit is not part of it
    pub fn query_key(&self, center: &Point, radius_m: f64, category: Option<Category>) -> QueryKey {
        let decimals = self.config.coordinate_decimals as usize;
        let rounded = center.rounded(self.config.coordinate_decimals);
        let key = format!(
            "near:{:.*}:{:.*}:{}:{}",
            decimals,
            rounded.lat,
            decimals,
            rounded.lon,
            radius_m.round() as u64,
            category.map_or("all", |c| c.as_str()),
        );
        QueryKey { key, category }
    }

    /// The center a query entry is computed around
    pub fn canonical_center(&self, center: &Point) -> Point {
        center.rounded(self.config.coordinate_decimals)
    }

    /// Upper bound on the distance between a center and its rounded form
    pub fn rounding_slack_m(&self) -> f64 {
        let half_step = 0.5 * 10f64.powi(-(self.config.coordinate_decimals as i32));
        half_step * METERS_PER_DEGREE * std::f64::consts::SQRT_2 + 1.0
    }

    pub fn generation(&self, category: Option<Category>) -> u64 {
        match category {
            Some(c) => self.category_generations[c.ordinal()].load(Ordering::Acquire),
            None => self.all_generation.load(Ordering::Acquire),
        }
    }

    /// Invalidate query results for `categories` and all unfiltered results
    pub fn bump_generations(&self, categories: &[Category]) {
        for category in categories {
            self.category_generations[category.ordinal()].fetch_add(1, Ordering::AcqRel);
        }
        self.all_generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Cached snapshot of `id` no older than `min_version`
    pub async fn business(&self, id: &BusinessId, min_version: Option<Version>) -> Option<Business> {
        let raw = self.get_or_miss(&Self::entity_key(id)).await?;
        let business: Business = match serde_json::from_slice(&raw) {
            Ok(b) => b,
            Err(e) => {
                warn!(id = %id, error = %e, "undecodable entity cache entry");
                return None;
            }
        };
        match min_version {
            Some(min) if business.version < min => {
                debug!(id = %id, cached = business.version, min, "stale entity cache entry");
                None
            }
            _ => Some(business),
        }
    }

    /// Best-effort write-back of an entity snapshot
    pub async fn put_business(&self, business: &Business) {
        let Ok(raw) = serde_json::to_vec(business) else {
            return;
        };
        let key = Self::entity_key(&business.id);
        if let Err(e) = self
            .call(self.cache.set(&key, Bytes::from(raw), self.config.entity_ttl()))
            .await
        {
            warn!(id = %business.id, error = %e, "entity cache write failed");
        }
    }

    /// Cached snapshots for a batch of `(id, min_version)` pairs, in order.
    ///
    /// The whole batch shares one cache deadline; when it fails or expires
    /// every entry is a miss.
    pub async fn businesses(&self, wanted: &[(BusinessId, Version)]) -> Vec<Option<Business>> {
        if wanted.is_empty() {
            return Vec::new();
        }
        let keys: Vec<String> = wanted.iter().map(|(id, _)| Self::entity_key(id)).collect();
        let raw = match self.call(self.cache.get_many(&keys)).await {
            Ok(raw) if raw.len() == wanted.len() => raw,
            Ok(raw) => {
                warn!(asked = wanted.len(), got = raw.len(), "cache batch answered short");
                return vec![None; wanted.len()];
            }
            Err(e) => {
                warn!(keys = wanted.len(), error = %e, "cache batch read failed, treating as misses");
                return vec![None; wanted.len()];
            }
        };

        wanted
            .iter()
            .zip(raw)
            .map(|((id, min), raw)| {
                let business: Business = serde_json::from_slice(&raw?).ok()?;
                if business.id != *id || business.version < *min {
                    return None;
                }
                Some(business)
            })
            .collect()
    }

    /// Best-effort write-back of many entity snapshots under one deadline
    pub async fn put_businesses(&self, businesses: &[Business]) {
        let entries: Vec<(String, Bytes)> = businesses
            .iter()
            .filter_map(|b| {
                let raw = serde_json::to_vec(b).ok()?;
                Some((Self::entity_key(&b.id), Bytes::from(raw)))
            })
            .collect();
        if entries.is_empty() {
            return;
        }
        let count = entries.len();
        if let Err(e) = self
            .call(self.cache.set_many(entries, self.config.entity_ttl()))
            .await
        {
            warn!(count, error = %e, "entity cache batch write failed");
        }
    }

    /// Drop the entity entry for `id`. Errors are returned so the write
    /// path can retry.
    pub async fn invalidate_business(&self, id: &BusinessId) -> Result<()> {
        self.call(self.cache.invalidate(&Self::entity_key(id)))
            .await
    }

    /// Cached query result, if present and still at `generation`
    pub async fn query(&self, key: &QueryKey) -> Option<Vec<Business>> {
        let raw = self.get_or_miss(key.as_str()).await?;
        let cached: CachedQuery = serde_json::from_slice(&raw).ok()?;
        if cached.generation != self.generation(key.category) {
            debug!(key = key.as_str(), "query cache generation mismatch");
            return None;
        }
        Some(cached.businesses)
    }

    /// Best-effort write-back of a query result computed at `generation`
    pub async fn put_query(&self, key: &QueryKey, generation: u64, businesses: &[Business]) {
        if businesses.len() > self.config.max_cached_candidates {
            debug!(key = key.as_str(), candidates = businesses.len(), "result too large to cache");
            return;
        }
        let entry = CachedQuery {
            generation,
            businesses: businesses.to_vec(),
        };
        let Ok(raw) = serde_json::to_vec(&entry) else {
            return;
        };
        if let Err(e) = self
            .call(self.cache.set(key.as_str(), Bytes::from(raw), self.config.query_ttl()))
            .await
        {
            warn!(key = key.as_str(), error = %e, "query cache write failed");
        }
    }

    pub async fn purge_expired(&self) -> Result<usize> {
        self.call(self.cache.purge_expired()).await
    }

    async fn get_or_miss(&self, key: &str) -> Option<Bytes> {
        match self.call(self.cache.get(key)).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(key, error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    async fn call<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        with_timeout(self.config.timeout(), Component::Cache, fut).await
    }
}

/// Run `fut` under `limit`, mapping expiry to `DownstreamTimeout`
pub async fn with_timeout<T>(
    limit: Duration,
    component: Component,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| ProximityError::DownstreamTimeout { component })?
}
