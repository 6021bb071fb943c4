//! The only path that mutates the store, index and cache.
//!
//! Every write persists to the store first. A store failure ends the write
//! with nothing downstream touched. Index and cache steps that fail after
//! the store committed are retried under the [`RetryPolicy`]; if retries run
//! out the write still succeeds and the gap is recorded in the
//! [`InconsistencyLog`] for the next reconciliation sweep.
//!
//! Index steps carry the store version, so a retried or reordered step can
//! never move an entry backwards. Query-cache generations are bumped only
//! after the index step, so a query that observes the new generation also
//! observes the new index state.

use crate::consistency::{CacheLayer, with_timeout};
use crate::error::{Component, ProximityError, Result};
use crate::index::SpatialIndex;
use crate::reconcile::InconsistencyLog;
use crate::retry::RetryPolicy;
use crate::store::Store;
use crate::types::{Business, BusinessDraft, BusinessId, BusinessUpdate, Category};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

pub struct WriteCoordinator {
    store: Arc<dyn Store>,
    index: Arc<SpatialIndex>,
    cache: Arc<CacheLayer>,
    retry: RetryPolicy,
    store_timeout: Duration,
    inconsistencies: Arc<InconsistencyLog>,
}

impl WriteCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        index: Arc<SpatialIndex>,
        cache: Arc<CacheLayer>,
        inconsistencies: Arc<InconsistencyLog>,
    ) -> Self {
        Self {
            store,
            index,
            cache,
            retry: RetryPolicy::default(),
            store_timeout: Duration::from_secs(1),
            inconsistencies,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    #[instrument(skip(self, draft), fields(name = %draft.name, category = %draft.category))]
    pub async fn create(&self, draft: BusinessDraft) -> Result<Business> {
        draft.validate()?;
        let business = self
            .store_call(self.store.insert(draft))
            .await?;

        let (id, point, version) = (business.id, business.point(), business.version);
        self.index_step(id, "index.insert", || async move {
            self.index.insert(id, point, version).map(drop)
        })
        .await;
        self.cache.bump_generations(&[business.category]);

        info!(id = %id, "created business");
        Ok(business)
    }

    /// Full replacement of a business's fields.
    ///
    /// With an expected version this is a compare-and-swap against the
    /// store and fails with `VersionConflict` when it is stale.
    #[instrument(skip(self, update), fields(id = %id, expected = ?update.expected_version))]
    pub async fn update(&self, id: BusinessId, update: BusinessUpdate) -> Result<Business> {
        update.fields.validate()?;
        let revision = self
            .store_call(self.store.update(&id, update))
            .await?;
        let (previous, current) = (&revision.previous, &revision.current);

        let (old, new, version) = (previous.point(), current.point(), current.version);
        if old != new {
            self.index_step(id, "index.relocate", || async move {
                self.index.relocate(id, old, new, version).map(drop)
            })
            .await;
        } else {
            // same point, still record the new version
            self.index_step(id, "index.insert", || async move {
                self.index.insert(id, new, version).map(drop)
            })
            .await;
        }

        self.invalidate_entity(id).await;
        self.cache
            .bump_generations(&touched(previous.category, current.category));

        info!(version, moved = old != new, "updated business");
        Ok(revision.current)
    }

    #[instrument(skip(self), fields(id = %id))]
    pub async fn delete(&self, id: BusinessId) -> Result<()> {
        let removed = self.store_call(self.store.delete(&id)).await?;

        let (point, version) = (removed.point(), removed.version);
        self.index_step(id, "index.remove", || async move {
            self.index.remove(id, &point, version).map(drop)
        })
        .await;

        self.invalidate_entity(id).await;
        self.cache.bump_generations(&[removed.category]);

        info!("deleted business");
        Ok(())
    }

    /// Bulk create: one durable store write, then bucket-grouped index
    /// inserts and a single generation bump.
    ///
    /// The whole batch is validated first; one bad item rejects it all.
    #[instrument(skip(self, drafts), fields(count = drafts.len()))]
    pub async fn seed(&self, drafts: Vec<BusinessDraft>) -> Result<Vec<Business>> {
        for (position, draft) in drafts.iter().enumerate() {
            draft.validate().map_err(|e| e.at_item(position))?;
        }
        if drafts.is_empty() {
            return Ok(Vec::new());
        }

        let created = self
            .store_call(self.store.insert_batch(drafts))
            .await?;

        let entries: Vec<_> = created
            .iter()
            .map(|b| (b.id, b.point(), b.version))
            .collect();
        let entries = entries.as_slice();
        if let Err(e) = self
            .retry
            .run("index.insert_batch", || async move {
                self.index.insert_batch(entries).map(drop)
            })
            .await
        {
            for business in &created {
                self.inconsistencies.record(&ProximityError::Inconsistent {
                    id: business.id,
                    component: Component::Index,
                    detail: format!("batch insert failed: {}", e),
                });
            }
        }

        let mut categories: Vec<Category> = created.iter().map(|b| b.category).collect();
        categories.sort();
        categories.dedup();
        self.cache.bump_generations(&categories);

        info!(created = created.len(), "seeded businesses");
        Ok(created)
    }

    async fn store_call<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        with_timeout(self.store_timeout, Component::Store, fut).await
    }

    /// Run a post-commit index step; exhaustion is recorded, never returned
    async fn index_step<F, Fut>(&self, id: BusinessId, op_name: &str, op: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        if let Err(e) = self.retry.run(op_name, op).await {
            self.inconsistencies.record(&ProximityError::Inconsistent {
                id,
                component: Component::Index,
                detail: format!("{} failed: {}", op_name, e),
            });
        }
    }

    async fn invalidate_entity(&self, id: BusinessId) {
        let result = self
            .retry
            .run("cache.invalidate", || async move {
                self.cache.invalidate_business(&id).await
            })
            .await;
        match result {
            Ok(()) => debug!(id = %id, "invalidated entity cache"),
            Err(e) => self.inconsistencies.record(&ProximityError::Inconsistent {
                id,
                component: Component::Cache,
                detail: format!("invalidate failed: {}", e),
            }),
        }
    }
}

fn touched(before: Category, after: Category) -> Vec<Category> {
    if before == after {
        vec![before]
    } else {
        vec![before, after]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::CacheConfig;
    use crate::spatial::Point;
    use crate::store::AofStore;

    struct Fixture {
        store: Arc<AofStore>,
        index: Arc<SpatialIndex>,
        cache: Arc<CacheLayer>,
        log: Arc<InconsistencyLog>,
        writes: WriteCoordinator,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(AofStore::memory());
        let index = Arc::new(SpatialIndex::new(5).unwrap());
        let cache = Arc::new(CacheLayer::new(
            Arc::new(MemoryCache::default()),
            CacheConfig::default(),
        ));
        let log = Arc::new(InconsistencyLog::default());
        let writes = WriteCoordinator::new(store.clone(), index.clone(), cache.clone(), log.clone());
        Fixture {
            store,
            index,
            cache,
            log,
            writes,
        }
    }

    fn draft(lat: f64, lon: f64) -> BusinessDraft {
        BusinessDraft::new("Cafe", "Seoul", lat, lon, Category::Cafe)
    }

    #[tokio::test]
    async fn test_create_indexes_and_bumps_generation() {
        let f = fixture();
        let before = f.cache.generation(Some(Category::Cafe));
        let created = f.writes.create(draft(37.5, 127.0)).await.unwrap();

        assert_eq!(created.version, 0);
        assert_eq!(f.index.version_of(&created.id).unwrap(), Some(0));
        assert!(f.cache.generation(Some(Category::Cafe)) > before);
        assert!(f.log.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_create_never_reaches_store() {
        let f = fixture();
        let err = f.writes.create(draft(91.0, 127.0)).await.unwrap_err();
        assert!(matches!(err, ProximityError::Validation { field: "latitude", .. }));
        assert_eq!(f.store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_update_relocates_and_invalidates() {
        let f = fixture();
        let created = f.writes.create(draft(37.5, 127.0)).await.unwrap();
        f.cache.put_business(&created).await;

        let updated = f
            .writes
            .update(created.id, BusinessUpdate::new(draft(38.0, 128.0)).expecting(0))
            .await
            .unwrap();
        assert_eq!(updated.version, 1);
        assert!(f.cache.business(&created.id, None).await.is_none());

        assert!(f.index.query(&Point::new(37.5, 127.0), 1_000.0).unwrap().is_empty());
        let hits = f.index.query(&Point::new(38.0, 128.0), 1_000.0).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].version, 1);
    }

    #[tokio::test]
    async fn test_stale_update_conflicts_without_side_effects() {
        let f = fixture();
        let created = f.writes.create(draft(37.5, 127.0)).await.unwrap();
        f.writes
            .update(created.id, BusinessUpdate::new(draft(37.6, 127.0)).expecting(0))
            .await
            .unwrap();

        let err = f
            .writes
            .update(created.id, BusinessUpdate::new(draft(38.0, 128.0)).expecting(0))
            .await
            .unwrap_err();
        assert!(matches!(err, ProximityError::VersionConflict { actual: 1, .. }));
        assert_eq!(f.index.locate(&created.id).unwrap().unwrap().point, Point::new(37.6, 127.0));
    }

    #[tokio::test]
    async fn test_delete_then_delete_again() {
        let f = fixture();
        let created = f.writes.create(draft(37.5, 127.0)).await.unwrap();
        f.writes.delete(created.id).await.unwrap();

        assert!(f.index.version_of(&created.id).unwrap().is_none());
        assert!(matches!(
            f.writes.delete(created.id).await,
            Err(ProximityError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_seed_is_all_or_nothing() {
        let f = fixture();
        let drafts = vec![draft(37.5, 127.0), draft(37.5, 181.0)];
        let err = f.writes.seed(drafts).await.unwrap_err();
        assert!(err.to_string().contains("item 1"));
        assert_eq!(f.store.count().await.unwrap(), 0);

        let created = f
            .writes
            .seed((0..50).map(|i| draft(37.5, 127.0 + i as f64 * 0.001)).collect())
            .await
            .unwrap();
        assert_eq!(created.len(), 50);
        assert_eq!(f.index.len().unwrap(), 50);
    }
}
