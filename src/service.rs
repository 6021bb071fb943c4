use crate::admission::Admission;
use crate::cache::{Cache, MemoryCache};
use crate::config::Config;
use crate::consistency::CacheLayer;
use crate::coordinator::WriteCoordinator;
use crate::engine::QueryEngine;
use crate::error::{ProximityError, Result};
use crate::index::SpatialIndex;
use crate::reconcile::{InconsistencyLog, Reconciler, SyncStatus};
use crate::retry::RetryPolicy;
use crate::store::{AofStore, Store};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// The assembled engine: store, index, cache, read and write paths, plus
/// the background maintenance loop.
pub struct ProximityService {
    config: Config,
    store: Arc<dyn Store>,
    index: Arc<SpatialIndex>,
    cache: Arc<CacheLayer>,
    writes: WriteCoordinator,
    reads: QueryEngine,
    reconciler: Reconciler,
    admission: Admission,
    inconsistencies: Arc<InconsistencyLog>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl ProximityService {
    /// Open the configured store, then build everything on top of it
    pub async fn open(config: Config) -> Result<Arc<Self>> {
        config.validate()?;
        let store: Arc<dyn Store> = match &config.store.aof_path {
            Some(path) => Arc::new(AofStore::open(path, config.store.aof_config())?),
            None => {
                warn!("no store.aof_path configured, data will not survive a restart");
                Arc::new(AofStore::memory())
            }
        };
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new(config.cache.max_entries));
        Self::from_parts(config, store, cache).await
    }

    /// Assemble around caller-supplied store and cache.
    ///
    /// The index starts empty and is rebuilt from the store before this
    /// returns.
    pub async fn from_parts(
        config: Config,
        store: Arc<dyn Store>,
        cache: Arc<dyn Cache>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let index = Arc::new(SpatialIndex::new(config.index.precision)?);
        let cache = Arc::new(CacheLayer::new(cache, config.cache.clone()));
        let inconsistencies = Arc::new(InconsistencyLog::default());
        let store_timeout = config.store.timeout();

        let writes = WriteCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&index),
            Arc::clone(&cache),
            Arc::clone(&inconsistencies),
        )
        .with_retry(RetryPolicy::from(&config.retry))
        .with_store_timeout(store_timeout);
        let reads = QueryEngine::new(Arc::clone(&store), Arc::clone(&index), Arc::clone(&cache))
            .with_store_timeout(store_timeout);
        let reconciler = Reconciler::new(
            Arc::clone(&store),
            Arc::clone(&index),
            Arc::clone(&cache),
            Arc::clone(&inconsistencies),
        )
        .with_chunk_size(config.reconcile.chunk_size)
        .with_store_timeout(store_timeout)
        .with_prune_grace(config.index.prune_grace());
        let admission = Admission::new(
            config.server.max_in_flight,
            config.server.max_queued,
            config.server.queue_wait(),
        );

        let service = Self {
            config,
            store,
            index,
            cache,
            writes,
            reads,
            reconciler,
            admission,
            inconsistencies,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        };

        let report = service.reconciler.full_sync().await?;
        if report.status != SyncStatus::Success {
            // the maintenance sweep keeps filling the index from the store
            error!(?report, "initial index rebuild incomplete");
        }
        info!(
            businesses = report.total_processed,
            buckets = service.index.bucket_count()?,
            "proximity service ready"
        );

        Ok(Arc::new(service))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn writes(&self) -> &WriteCoordinator {
        &self.writes
    }

    pub fn reads(&self) -> &QueryEngine {
        &self.reads
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn admission(&self) -> &Admission {
        &self.admission
    }

    pub fn index(&self) -> &SpatialIndex {
        &self.index
    }

    pub fn cache(&self) -> &CacheLayer {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn inconsistencies(&self) -> &InconsistencyLog {
        &self.inconsistencies
    }

    /// Spawn the periodic sweep; a zero interval disables it
    pub fn start_maintenance(self: &Arc<Self>) {
        let period = Duration::from_secs(self.config.reconcile.interval_secs);
        if period.is_zero() {
            debug!("maintenance loop disabled");
            return;
        }

        let service = Arc::clone(self);
        let token = self.shutdown.clone();
        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // first tick fires immediately and startup already rebuilt the index
            ticker.tick().await;
            info!(interval_secs = period.as_secs(), "maintenance loop started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => service.run_maintenance().await,
                }
            }
            debug!("maintenance loop stopped");
        });
    }

    /// One sweep: reconcile the index, purge expired cache entries, sync
    /// and maybe compact the store.
    pub async fn run_maintenance(&self) {
        match self.reconciler.consistency_check().await {
            Ok(_) => {}
            Err(ProximityError::ReconcileInProgress) => {
                debug!("skipping sweep, reconciliation already running")
            }
            Err(e) => error!(error = %e, "consistency check failed"),
        }

        match self.cache.purge_expired().await {
            Ok(0) => {}
            Ok(purged) => debug!(purged, "purged expired cache entries"),
            Err(e) => warn!(error = %e, "cache purge failed"),
        }

        if let Err(e) = self.store.sync().await {
            error!(error = %e, "store sync failed");
        }
        match self.store.compact_if_needed().await {
            Ok(true) => info!("compacted store log"),
            Ok(false) => {}
            Err(e) => error!(error = %e, "store compaction failed"),
        }
    }

    /// Stop background work, stop admitting requests and flush the store
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.admission.close();
        self.store.sync().await?;
        info!("proximity service stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BusinessDraft, Category};

    #[tokio::test]
    async fn test_open_rebuilds_index_from_store() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.store.aof_path = Some(dir.path().join("store.aof"));
        config.reconcile.interval_secs = 0;

        let created = {
            let service = ProximityService::open(config.clone()).await.unwrap();
            let created = service
                .writes()
                .create(BusinessDraft::new("a", "Seoul", 37.5, 127.0, Category::Cafe))
                .await
                .unwrap();
            service.shutdown().await.unwrap();
            created
        };

        let service = ProximityService::open(config).await.unwrap();
        assert_eq!(service.index().version_of(&created.id).unwrap(), Some(0));
        assert_eq!(service.reads().get(&created.id).await.unwrap(), created);
    }

    #[tokio::test]
    async fn test_maintenance_loop_stops_on_shutdown() {
        let mut config = Config::default();
        config.reconcile.interval_secs = 1;
        let service = ProximityService::open(config).await.unwrap();
        service.start_maintenance();
        service.run_maintenance().await;
        service.shutdown().await.unwrap();
        assert!(service.admission().acquire().await.is_err());
    }
}
