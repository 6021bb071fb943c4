//! Index-vs-store reconciliation.
//!
//! The store is authoritative. `full_sync` re-derives every index entry
//! from a full store scan without ever emptying the index; `consistency_check`
//! does the same diff but first replays anything the write coordinator
//! recorded in the [`InconsistencyLog`] and then prunes stale forwarding
//! entries. Only one run may be in progress at a time.

use crate::consistency::{CacheLayer, with_timeout};
use crate::error::{Component, ProximityError, Result};
use crate::index::SpatialIndex;
use crate::store::Store;
use crate::types::{Business, BusinessId, Category};
use chrono::{DateTime, Utc};
use rustc_hash::FxHashSet;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};

const DEFAULT_LOG_CAPACITY: usize = 10_000;

/// A write whose index or cache step did not land
#[derive(Debug, Clone, PartialEq)]
pub struct InconsistencyRecord {
    pub id: BusinessId,
    pub component: Component,
    pub detail: String,
    pub recorded_at: DateTime<Utc>,
}

/// Bounded queue of inconsistencies awaiting the next sweep.
///
/// When full the oldest record is dropped; the sweep's full diff still
/// finds whatever it described.
pub struct InconsistencyLog {
    records: Mutex<VecDeque<InconsistencyRecord>>,
    capacity: usize,
}

impl Default for InconsistencyLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAPACITY)
    }
}

impl InconsistencyLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Record an `Inconsistent` error; other errors are ignored
    pub fn record(&self, err: &ProximityError) {
        let ProximityError::Inconsistent {
            id,
            component,
            detail,
        } = err
        else {
            return;
        };
        error!(id = %id, %component, detail = detail.as_str(), "inconsistent after write");

        let Ok(mut records) = self.records.lock() else {
            return;
        };
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(InconsistencyRecord {
            id: *id,
            component: *component,
            detail: detail.clone(),
            recorded_at: Utc::now(),
        });
    }

    pub fn drain(&self) -> Vec<InconsistencyRecord> {
        self.records
            .lock()
            .map(|mut records| records.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncKind {
    FullSync,
    ConsistencyCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Success,
    PartialFailure,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    #[serde(rename = "type")]
    pub kind: SyncKind,
    pub status: SyncStatus,
    pub total_processed: usize,
    pub added: usize,
    pub removed: usize,
    pub repaired: usize,
    pub errors: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

struct Tally {
    kind: SyncKind,
    started_at: DateTime<Utc>,
    clock: Instant,
    total_processed: usize,
    added: usize,
    removed: usize,
    repaired: usize,
    errors: usize,
}

impl Tally {
    fn start(kind: SyncKind) -> Self {
        Self {
            kind,
            started_at: Utc::now(),
            clock: Instant::now(),
            total_processed: 0,
            added: 0,
            removed: 0,
            repaired: 0,
            errors: 0,
        }
    }

    fn changed(&self) -> bool {
        self.added + self.removed + self.repaired > 0
    }

    fn finish(self, fatal: Option<ProximityError>) -> SyncReport {
        let status = match (&fatal, self.errors) {
            (Some(_), _) => SyncStatus::Failed,
            (None, 0) => SyncStatus::Success,
            (None, _) => SyncStatus::PartialFailure,
        };
        let report = SyncReport {
            kind: self.kind,
            status,
            total_processed: self.total_processed,
            added: self.added,
            removed: self.removed,
            repaired: self.repaired,
            errors: self.errors + usize::from(fatal.is_some()),
            started_at: self.started_at,
            finished_at: Utc::now(),
            duration_ms: self.clock.elapsed().as_millis() as u64,
        };
        match fatal {
            Some(e) => error!(kind = ?report.kind, error = %e, ?report, "reconciliation failed"),
            None => info!(kind = ?report.kind, ?report, "reconciliation finished"),
        }
        report
    }
}

struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Reconciler {
    store: Arc<dyn Store>,
    index: Arc<SpatialIndex>,
    cache: Arc<CacheLayer>,
    inconsistencies: Arc<InconsistencyLog>,
    chunk_size: usize,
    store_timeout: Duration,
    prune_grace: Duration,
    running: AtomicBool,
}

impl Reconciler {
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
            inconsistencies,
            chunk_size: 500,
            store_timeout: Duration::from_secs(1),
            prune_grace: Duration::from_secs(5),
            running: AtomicBool::new(false),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn with_prune_grace(mut self, grace: Duration) -> Self {
        self.prune_grace = grace;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Re-derive the whole index from the store, chunk by chunk.
    ///
    /// Entries are upserted in place and orphans removed at the end, so
    /// businesses already indexed stay visible to queries throughout.
    #[instrument(skip(self))]
    pub async fn full_sync(&self) -> Result<SyncReport> {
        let _guard = self.begin()?;
        let mut tally = Tally::start(SyncKind::FullSync);

        let mut seen = FxHashSet::default();
        let mut after = None;
        loop {
            let chunk = match self.scan(after).await {
                Ok(chunk) => chunk,
                Err(e) => {
                    self.cache.bump_generations(&Category::ALL);
                    return Ok(tally.finish(Some(e)));
                }
            };
            let Some(last) = chunk.last() else { break };
            after = Some(last.id);

            for business in &chunk {
                tally.total_processed += 1;
                seen.insert(business.id);
                if let Err(e) = self.repair(business, &mut tally) {
                    tally.errors += 1;
                    error!(id = %business.id, error = %e, "failed to index business");
                }
            }
        }

        if let Err(e) = self.remove_orphans(&seen, &mut tally).await {
            self.cache.bump_generations(&Category::ALL);
            return Ok(tally.finish(Some(e)));
        }

        self.cache.bump_generations(&Category::ALL);
        Ok(tally.finish(None))
    }

    /// Repair index entries that are missing, orphaned or behind the store
    #[instrument(skip(self))]
    pub async fn consistency_check(&self) -> Result<SyncReport> {
        let _guard = self.begin()?;
        let mut tally = Tally::start(SyncKind::ConsistencyCheck);

        for record in self.inconsistencies.drain() {
            if let Err(e) = self.cache.invalidate_business(&record.id).await {
                warn!(id = %record.id, error = %e, "entity cache invalidation failed during sweep");
            }
            match self.reload(&record.id, &mut tally).await {
                Ok(()) => {}
                Err(e) => {
                    tally.errors += 1;
                    error!(id = %record.id, error = %e, "failed to repair recorded inconsistency");
                }
            }
        }

        let mut seen = FxHashSet::default();
        let mut after = None;
        loop {
            let chunk = match self.scan(after).await {
                Ok(chunk) => chunk,
                Err(e) => {
                    self.bump_if_changed(&tally);
                    return Ok(tally.finish(Some(e)));
                }
            };
            let Some(last) = chunk.last() else { break };
            after = Some(last.id);

            for business in &chunk {
                tally.total_processed += 1;
                seen.insert(business.id);
                if let Err(e) = self.repair(business, &mut tally) {
                    tally.errors += 1;
                    error!(id = %business.id, error = %e, "failed to repair index entry");
                }
            }
        }

        if let Err(e) = self.remove_orphans(&seen, &mut tally).await {
            self.bump_if_changed(&tally);
            return Ok(tally.finish(Some(e)));
        }

        match self.index.prune(self.prune_grace) {
            Ok(stats) if stats != Default::default() => info!(?stats, "pruned index"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "index prune failed"),
        }

        self.bump_if_changed(&tally);
        Ok(tally.finish(None))
    }

    /// Drop index entries for ids the scan never saw, unless the store has
    /// them after all
    async fn remove_orphans(&self, seen: &FxHashSet<BusinessId>, tally: &mut Tally) -> Result<()> {
        let orphans: Vec<BusinessId> = self
            .index
            .entries()?
            .into_iter()
            .map(|(id, _)| id)
            .filter(|id| !seen.contains(id))
            .collect();
        for id in orphans {
            // created after the scan passed its position
            if let Err(e) = self.reload(&id, tally).await {
                tally.errors += 1;
                error!(id = %id, error = %e, "failed to remove orphaned index entry");
            }
        }
        Ok(())
    }

    fn begin(&self) -> Result<RunGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ProximityError::ReconcileInProgress)?;
        Ok(RunGuard(&self.running))
    }

    async fn scan(&self, after: Option<BusinessId>) -> Result<Vec<Business>> {
        with_timeout(
            self.store_timeout,
            Component::Store,
            self.store.scan(after, self.chunk_size),
        )
        .await
    }

    /// Bring the index entry for `business` up to the store's version
    fn repair(&self, business: &Business, tally: &mut Tally) -> Result<()> {
        match self.index.locate(&business.id)? {
            None => {
                if self.index.insert(business.id, business.point(), business.version)? {
                    tally.added += 1;
                }
            }
            Some(entry) if entry.version < business.version || entry.point != business.point() => {
                if self.index.insert(business.id, business.point(), business.version)? {
                    tally.repaired += 1;
                }
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// Re-derive the index entry for `id` from a fresh store read
    async fn reload(&self, id: &BusinessId, tally: &mut Tally) -> Result<()> {
        let current = with_timeout(self.store_timeout, Component::Store, self.store.get(id)).await?;
        match current {
            Some(business) => self.repair(&business, tally),
            None => {
                if let Some(entry) = self.index.locate(id)? {
                    if self.index.remove(*id, &entry.point, entry.version)? {
                        tally.removed += 1;
                    }
                }
                Ok(())
            }
        }
    }

    fn bump_if_changed(&self, tally: &Tally) {
        if tally.changed() {
            self.cache.bump_generations(&Category::ALL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::CacheConfig;
    use crate::spatial::Point;
    use crate::store::AofStore;
    use crate::types::BusinessDraft;

    struct Fixture {
        store: Arc<AofStore>,
        index: Arc<SpatialIndex>,
        log: Arc<InconsistencyLog>,
        reconciler: Reconciler,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(AofStore::memory());
        let index = Arc::new(SpatialIndex::new(5).unwrap());
        let cache = Arc::new(CacheLayer::new(
            Arc::new(MemoryCache::default()),
            CacheConfig::default(),
        ));
        let log = Arc::new(InconsistencyLog::default());
        let reconciler = Reconciler::new(store.clone(), index.clone(), cache, log.clone())
            .with_chunk_size(7)
            .with_prune_grace(Duration::ZERO);
        Fixture {
            store,
            index,
            log,
            reconciler,
        }
    }

    fn draft(i: usize) -> BusinessDraft {
        BusinessDraft::new(
            format!("b{}", i),
            "Seoul",
            37.5 + i as f64 * 0.001,
            127.0,
            Category::Cafe,
        )
    }

    #[tokio::test]
    async fn test_full_sync_rebuilds_index() {
        let f = fixture();
        f.store
            .insert_batch((0..20).map(draft).collect())
            .await
            .unwrap();
        let orphan = BusinessId::new();
        f.index.insert(orphan, Point::new(37.5, 127.0), 0).unwrap();

        let report = f.reconciler.full_sync().await.unwrap();
        assert_eq!(report.kind, SyncKind::FullSync);
        assert_eq!(report.status, SyncStatus::Success);
        assert_eq!(report.total_processed, 20);
        assert_eq!(report.added, 20);
        assert_eq!(f.index.len().unwrap(), 20);
        assert_eq!(f.index.version_of(&orphan).unwrap(), None);
    }

    #[tokio::test]
    async fn test_full_sync_upserts_in_place() {
        let f = fixture();
        let created = f
            .store
            .insert_batch((0..10).map(draft).collect())
            .await
            .unwrap();
        for business in &created {
            f.index
                .insert(business.id, business.point(), business.version)
                .unwrap();
        }
        let moved = f
            .store
            .update(&created[3].id, crate::types::BusinessUpdate::new(draft(40)))
            .await
            .unwrap()
            .current;

        let report = f.reconciler.full_sync().await.unwrap();
        assert_eq!(report.total_processed, 10);
        assert_eq!(report.added, 0);
        assert_eq!(report.repaired, 1);
        assert_eq!(report.removed, 0);
        assert_eq!(f.index.len().unwrap(), 10);
        assert_eq!(f.index.locate(&moved.id).unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_consistency_check_adds_removes_and_repairs() {
        let f = fixture();
        let created = f
            .store
            .insert_batch((0..10).map(draft).collect())
            .await
            .unwrap();
        // index only the first eight, one of them at a stale location
        for business in &created[..8] {
            f.index
                .insert(business.id, business.point(), business.version)
                .unwrap();
        }
        let moved = f
            .store
            .update(
                &created[0].id,
                crate::types::BusinessUpdate::new(draft(50)),
            )
            .await
            .unwrap()
            .current;
        let orphan = BusinessId::new();
        f.index.insert(orphan, Point::new(37.5, 127.0), 0).unwrap();

        let report = f.reconciler.consistency_check().await.unwrap();
        assert_eq!(report.status, SyncStatus::Success);
        assert_eq!(report.added, 2);
        assert_eq!(report.removed, 1);
        assert_eq!(report.repaired, 1);
        assert_eq!(f.index.len().unwrap(), 10);
        assert_eq!(f.index.locate(&moved.id).unwrap().unwrap().point, moved.point());

        let again = f.reconciler.consistency_check().await.unwrap();
        assert_eq!(again.added + again.removed + again.repaired, 0);
    }

    #[tokio::test]
    async fn test_recorded_inconsistencies_are_drained() {
        let f = fixture();
        let business = f.store.insert(draft(1)).await.unwrap();
        f.log.record(&ProximityError::Inconsistent {
            id: business.id,
            component: Component::Index,
            detail: "insert failed".into(),
        });
        assert_eq!(f.log.len(), 1);

        let report = f.reconciler.consistency_check().await.unwrap();
        assert!(f.log.is_empty());
        assert_eq!(report.added, 1);
        assert_eq!(f.index.version_of(&business.id).unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_only_one_run_at_a_time() {
        let f = fixture();
        let _guard = f.reconciler.begin().unwrap();
        assert!(f.reconciler.is_running());
        assert!(matches!(
            f.reconciler.full_sync().await,
            Err(ProximityError::ReconcileInProgress)
        ));
    }

    #[test]
    fn test_log_is_bounded() {
        let log = InconsistencyLog::with_capacity(2);
        for _ in 0..3 {
            log.record(&ProximityError::Inconsistent {
                id: BusinessId::new(),
                component: Component::Cache,
                detail: "invalidate failed".into(),
            });
        }
        log.record(&ProximityError::Overloaded);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_report_serializes_like_batch_result() {
        let report = Tally::start(SyncKind::ConsistencyCheck).finish(None);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["type"], "CONSISTENCY_CHECK");
        assert_eq!(json["status"], "SUCCESS");
        assert!(json.get("duration_ms").is_some());
    }
}
