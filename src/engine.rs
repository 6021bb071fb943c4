use crate::consistency::{CacheLayer, with_timeout};
use crate::error::{Component, ProximityError, Result};
use crate::index::{Neighbor, SpatialIndex};
use crate::spatial::Point;
use crate::store::Store;
use crate::types::{Business, BusinessId, Category};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

pub const DEFAULT_RADIUS_M: f64 = 5_000.0;
pub const MIN_RADIUS_M: f64 = 1.0;
pub const MAX_RADIUS_M: f64 = 20_000.0;
pub const MAX_LIMIT: usize = 50;

/// Parameters of a nearby search
#[derive(Debug, Clone, PartialEq)]
pub struct NearbyQuery {
    pub center: Point,
    pub radius_m: f64,
    pub category: Option<Category>,
    /// Cap on returned hits; `None` returns everything in range
    pub limit: Option<usize>,
}

impl NearbyQuery {
    pub fn new(latitude: f64, longitude: f64, radius_m: f64) -> Self {
        Self {
            center: Point::new(latitude, longitude),
            radius_m,
            category: None,
            limit: None,
        }
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.center.validate()?;
        if !(MIN_RADIUS_M..=MAX_RADIUS_M).contains(&self.radius_m) {
            return Err(ProximityError::validation(
                "radius",
                format!("must be between {} and {} meters", MIN_RADIUS_M, MAX_RADIUS_M),
            ));
        }
        if let Some(limit) = self.limit {
            if !(1..=MAX_LIMIT).contains(&limit) {
                return Err(ProximityError::validation(
                    "limit",
                    format!("must be between 1 and {}", MAX_LIMIT),
                ));
            }
        }
        Ok(())
    }
}

/// A business in range and its distance from the query center
#[derive(Debug, Clone, PartialEq)]
pub struct NearbyHit {
    pub business: Business,
    pub distance_m: f64,
}

/// Read path: nearby search and lookup by id.
///
/// Reads go cache first, then index and store. The only side effect is
/// populating the cache on a miss.
pub struct QueryEngine {
    store: Arc<dyn Store>,
    index: Arc<SpatialIndex>,
    cache: Arc<CacheLayer>,
    store_timeout: Duration,
}

impl QueryEngine {
    pub fn new(store: Arc<dyn Store>, index: Arc<SpatialIndex>, cache: Arc<CacheLayer>) -> Self {
        Self {
            store,
            index,
            cache,
            store_timeout: Duration::from_secs(1),
        }
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Businesses within the query radius, nearest first, ties by id.
    ///
    /// Either the complete ordered set is returned or the whole call fails.
    #[instrument(skip(self), fields(lat = query.center.lat, lon = query.center.lon, radius = query.radius_m))]
    pub async fn nearby(&self, query: &NearbyQuery) -> Result<Vec<NearbyHit>> {
        query.validate()?;
        let key = self
            .cache
            .query_key(&query.center, query.radius_m, query.category);

        let candidates = match self.cache.query(&key).await {
            Some(cached) => {
                debug!(key = key.as_str(), "query cache hit");
                cached
            }
            None => {
                // read before the index so a concurrent write invalidates what we store
                let generation = self.cache.generation(query.category);
                let center = self.cache.canonical_center(&query.center);
                let reach = query.radius_m + self.cache.rounding_slack_m();

                let neighbors = self.index.query(&center, reach)?;
                let mut businesses = self.fetch(&neighbors).await?;
                if let Some(category) = query.category {
                    businesses.retain(|b| b.category == category);
                }
                self.cache.put_query(&key, generation, &businesses).await;
                businesses
            }
        };

        let mut hits: Vec<NearbyHit> = candidates
            .into_iter()
            .filter_map(|business| {
                let distance_m = business.point().distance_to(&query.center);
                (distance_m <= query.radius_m).then_some(NearbyHit {
                    business,
                    distance_m,
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            a.distance_m
                .total_cmp(&b.distance_m)
                .then_with(|| a.business.id.cmp(&b.business.id))
        });
        if let Some(limit) = query.limit {
            hits.truncate(limit);
        }

        debug!(hits = hits.len(), "nearby search complete");
        Ok(hits)
    }

    /// Fetch a business by id, failing with `NotFound` if the store has none
    #[instrument(skip(self), fields(id = %id))]
    pub async fn get(&self, id: &BusinessId) -> Result<Business> {
        // ids the index no longer places skip the cache entirely
        if let Some(placed) = self.index.version_of(id)? {
            if let Some(business) = self.cache.business(id, Some(placed)).await {
                return Ok(business);
            }
        }

        let business = self
            .store_call(self.store.get(id))
            .await?
            .ok_or(ProximityError::NotFound(*id))?;
        self.cache.put_business(&business).await;
        Ok(business)
    }

    /// Entity data for index hits, entity cache first, then one store batch
    async fn fetch(&self, neighbors: &[Neighbor]) -> Result<Vec<Business>> {
        let wanted: Vec<_> = neighbors.iter().map(|n| (n.id, n.version)).collect();
        let cached = self.cache.businesses(&wanted).await;

        let mut found = Vec::with_capacity(neighbors.len());
        let mut missing = Vec::new();
        for ((id, _), hit) in wanted.iter().zip(cached) {
            match hit {
                Some(business) => found.push(business),
                None => missing.push(*id),
            }
        }

        if !missing.is_empty() {
            let fetched = self.store_call(self.store.get_many(&missing)).await?;
            if fetched.len() < missing.len() {
                debug!(
                    indexed = missing.len(),
                    stored = fetched.len(),
                    "index holds ids the store no longer has"
                );
            }
            self.cache.put_businesses(&fetched).await;
            found.extend(fetched);
        }
        Ok(found)
    }

    async fn store_call<T>(&self, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        with_timeout(self.store_timeout, Component::Store, fut).await
    }
}
