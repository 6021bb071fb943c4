//! Geohash bucket index over business locations.
//!
//! The plane is cut into fixed-precision geohash cells. Each cell owns its
//! own lock, so a write only ever holds one bucket-local critical section
//! and queries against unrelated cells never wait on it. A second, sharded
//! table records where each id currently lives (its *placement*) together
//! with the store version it was placed at; every mutation for an id goes
//! through its placement shard, which orders writes per entity and lets
//! stale (lower-version) mutations be dropped.
//!
//! Moving an id between cells first rewrites the old cell's entry into a
//! *forwarding* entry carrying the new location, then inserts into the new
//! cell. A query that races the move therefore finds the id in at least one
//! of the cells it reads, always with coordinates no older than the ones it
//! would have seen before the move. Forwarding entries are pruned after a
//! grace period by [`SpatialIndex::prune`].

use crate::error::{ProximityError, Result};
use crate::spatial::{BoundingBox, BucketGrid, Point};
use crate::types::{BusinessId, Version};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::collections::hash_map::Entry;
use std::sync::{Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

const PLACEMENT_SHARDS: usize = 64;

/// A location recorded in a bucket
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexEntry {
    pub point: Point,
    pub version: Version,
    forwarded: bool,
}

impl IndexEntry {
    fn live(point: Point, version: Version) -> Self {
        Self {
            point,
            version,
            forwarded: false,
        }
    }

    fn forwarding(point: Point, version: Version) -> Self {
        Self {
            point,
            version,
            forwarded: true,
        }
    }

    /// Whether this entry sits in a bucket the id has moved out of
    pub fn is_forwarding(&self) -> bool {
        self.forwarded
    }
}

/// One radius-query hit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub id: BusinessId,
    pub point: Point,
    pub version: Version,
    pub distance_m: f64,
}

type Bucket = FxHashMap<BusinessId, IndexEntry>;

#[derive(Debug, Clone)]
struct Forward {
    bucket: String,
    since: Instant,
}

#[derive(Debug, Clone)]
enum Placement {
    Live {
        bucket: String,
        version: Version,
        forwards: SmallVec<[Forward; 2]>,
    },
    Removed {
        version: Version,
        since: Instant,
    },
}

impl Placement {
    fn version(&self) -> Version {
        match self {
            Placement::Live { version, .. } | Placement::Removed { version, .. } => *version,
        }
    }
}

/// Summary returned by [`SpatialIndex::prune`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub forwards_removed: usize,
    pub tombstones_removed: usize,
    pub buckets_removed: usize,
}

/// In-memory spatial index keyed by geohash bucket
pub struct SpatialIndex {
    grid: BucketGrid,
    buckets: RwLock<FxHashMap<String, RwLock<Bucket>>>,
    placements: Vec<Mutex<FxHashMap<BusinessId, Placement>>>,
}

impl SpatialIndex {
    /// Create an empty index bucketing at geohash `precision`
    pub fn new(precision: usize) -> Result<Self> {
        Ok(Self {
            grid: BucketGrid::new(precision)?,
            buckets: RwLock::new(FxHashMap::default()),
            placements: (0..PLACEMENT_SHARDS)
                .map(|_| Mutex::new(FxHashMap::default()))
                .collect(),
        })
    }

    pub fn grid(&self) -> &BucketGrid {
        &self.grid
    }

    /// Add `id` at `point`. Idempotent for the same version and bucket.
    ///
    /// Returns `false` when a newer version of `id` is already placed, or
    /// when `id` was removed at this version or later.
    pub fn insert(&self, id: BusinessId, point: Point, version: Version) -> Result<bool> {
        self.place(id, point, version, None)
    }

    /// Move `id` from `old` to `new`.
    ///
    /// `old` is only consulted when the index holds no placement for `id`.
    pub fn relocate(&self, id: BusinessId, old: Point, new: Point, version: Version) -> Result<bool> {
        self.place(id, new, version, Some(&old))
    }

    /// Remove `id`, leaving a tombstone so a late insert of an older
    /// version cannot resurrect it. A repeated remove is a no-op.
    ///
    /// Returns whether a live bucket entry was removed.
    pub fn remove(&self, id: BusinessId, point: &Point, version: Version) -> Result<bool> {
        let hint_bucket = self.grid.bucket_of(point)?;
        let mut shard = self.shard(&id)?;

        let (bucket, forwards) = match shard.get(&id) {
            Some(Placement::Removed { .. }) => return Ok(false),
            Some(placement) if placement.version() > version => return Ok(false),
            Some(Placement::Live {
                bucket, forwards, ..
            }) => (bucket.clone(), forwards.clone()),
            None => (hint_bucket, SmallVec::new()),
        };

        let removed = self
            .with_existing_bucket_mut(&bucket, |members| members.remove(&id).is_some())?
            .unwrap_or(false);
        for forward in &forwards {
            self.with_existing_bucket_mut(&forward.bucket, |members| {
                if members.get(&id).is_some_and(|entry| entry.forwarded) {
                    members.remove(&id);
                }
            })?;
        }

        shard.insert(
            id,
            Placement::Removed {
                version,
                since: Instant::now(),
            },
        );
        Ok(removed)
    }

    /// Bulk insert of freshly created ids, taking each bucket lock once.
    ///
    /// Ids that already have a placement fall back to [`SpatialIndex::insert`].
    pub fn insert_batch(&self, entries: &[(BusinessId, Point, Version)]) -> Result<usize> {
        let mut groups: FxHashMap<String, Vec<(BusinessId, IndexEntry)>> = FxHashMap::default();
        let mut placed = 0;

        for (id, point, version) in entries {
            let bucket = self.grid.bucket_of(point)?;
            let mut shard = self.shard(id)?;
            if shard.contains_key(id) {
                drop(shard);
                if self.insert(*id, *point, *version)? {
                    placed += 1;
                }
                continue;
            }
            shard.insert(
                *id,
                Placement::Live {
                    bucket: bucket.clone(),
                    version: *version,
                    forwards: SmallVec::new(),
                },
            );
            groups
                .entry(bucket)
                .or_default()
                .push((*id, IndexEntry::live(*point, *version)));
        }

        for (bucket, members) in groups {
            placed += members.len();
            self.with_bucket_mut(&bucket, |bucket| bucket.extend(members))?;
        }
        Ok(placed)
    }

    /// All ids within `radius_m` meters of `center`, nearest first.
    ///
    /// Equal distances are ordered by id. Only bucket read locks are taken,
    /// one bucket at a time.
    pub fn query(&self, center: &Point, radius_m: f64) -> Result<Vec<Neighbor>> {
        let bbox = BoundingBox::around(center, radius_m);
        let mut seen: FxHashMap<BusinessId, IndexEntry> = FxHashMap::default();
        let mut collect = |members: &Bucket| {
            for (id, entry) in members {
                match seen.entry(*id) {
                    Entry::Occupied(mut slot) => {
                        if entry.version > slot.get().version {
                            slot.insert(*entry);
                        }
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(*entry);
                    }
                }
            }
        };

        // A huge radius covers more cells than exist; walk the buckets instead
        if self.grid.cover_len(&bbox) > self.bucket_count()? as u64 {
            let buckets = self.read_buckets()?;
            for bucket in buckets.values() {
                let members = bucket.read().map_err(|_| ProximityError::Lock("bucket"))?;
                collect(&*members);
            }
        } else {
            for key in self.grid.cover(&bbox)? {
                let buckets = self.read_buckets()?;
                if let Some(bucket) = buckets.get(&key) {
                    let members = bucket.read().map_err(|_| ProximityError::Lock("bucket"))?;
                    collect(&*members);
                }
            }
        }

        let mut hits: Vec<Neighbor> = seen
            .into_iter()
            .filter(|(_, entry)| bbox.contains(&entry.point))
            .filter_map(|(id, entry)| {
                let distance_m = entry.point.distance_to(center);
                (distance_m <= radius_m).then_some(Neighbor {
                    id,
                    point: entry.point,
                    version: entry.version,
                    distance_m,
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            a.distance_m
                .total_cmp(&b.distance_m)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(hits)
    }

    /// Version `id` is currently placed at, if live
    pub fn version_of(&self, id: &BusinessId) -> Result<Option<Version>> {
        let shard = self.shard(id)?;
        Ok(match shard.get(id) {
            Some(Placement::Live { version, .. }) => Some(*version),
            _ => None,
        })
    }

    /// The live entry for `id`, read from its current bucket
    pub fn locate(&self, id: &BusinessId) -> Result<Option<IndexEntry>> {
        let shard = self.shard(id)?;
        let Some(Placement::Live { bucket, .. }) = shard.get(id) else {
            return Ok(None);
        };
        let buckets = self.read_buckets()?;
        match buckets.get(bucket) {
            Some(members) => {
                let members = members.read().map_err(|_| ProximityError::Lock("bucket"))?;
                Ok(members.get(id).copied())
            }
            None => Ok(None),
        }
    }

    /// Every live id with its placed version
    pub fn entries(&self) -> Result<Vec<(BusinessId, Version)>> {
        let mut out = Vec::new();
        for shard in &self.placements {
            let shard = shard.lock().map_err(|_| ProximityError::Lock("placement"))?;
            out.extend(shard.iter().filter_map(|(id, placement)| match placement {
                Placement::Live { version, .. } => Some((*id, *version)),
                Placement::Removed { .. } => None,
            }));
        }
        Ok(out)
    }

    /// Drop forwarding entries and tombstones older than `grace`, then
    /// any bucket left empty.
    pub fn prune(&self, grace: Duration) -> Result<PruneStats> {
        let mut stats = PruneStats::default();

        for shard in &self.placements {
            let mut shard = shard.lock().map_err(|_| ProximityError::Lock("placement"))?;
            let mut expired_tombstones = Vec::new();

            for (id, placement) in shard.iter_mut() {
                match placement {
                    Placement::Live { forwards, .. } => {
                        let mut kept = SmallVec::new();
                        for forward in forwards.drain(..) {
                            if forward.since.elapsed() < grace {
                                kept.push(forward);
                                continue;
                            }
                            self.with_existing_bucket_mut(&forward.bucket, |members| {
                                if members.get(id).is_some_and(|entry| entry.forwarded) {
                                    members.remove(id);
                                    stats.forwards_removed += 1;
                                }
                            })?;
                        }
                        *forwards = kept;
                    }
                    Placement::Removed { since, .. } => {
                        if since.elapsed() >= grace {
                            expired_tombstones.push(*id);
                        }
                    }
                }
            }

            for id in expired_tombstones {
                shard.remove(&id);
                stats.tombstones_removed += 1;
            }
        }

        let mut buckets = self
            .buckets
            .write()
            .map_err(|_| ProximityError::Lock("index"))?;
        let before = buckets.len();
        buckets.retain(|_, members| members.get_mut().map(|m| !m.is_empty()).unwrap_or(true));
        stats.buckets_removed = before - buckets.len();

        Ok(stats)
    }

    /// Remove everything, placements and tombstones included
    pub fn clear(&self) -> Result<()> {
        for shard in &self.placements {
            shard
                .lock()
                .map_err(|_| ProximityError::Lock("placement"))?
                .clear();
        }
        self.buckets
            .write()
            .map_err(|_| ProximityError::Lock("index"))?
            .clear();
        Ok(())
    }

    /// Number of live ids
    pub fn len(&self) -> Result<usize> {
        let mut total = 0;
        for shard in &self.placements {
            let shard = shard.lock().map_err(|_| ProximityError::Lock("placement"))?;
            total += shard
                .values()
                .filter(|p| matches!(p, Placement::Live { .. }))
                .count();
        }
        Ok(total)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn bucket_count(&self) -> Result<usize> {
        Ok(self.read_buckets()?.len())
    }

    fn place(
        &self,
        id: BusinessId,
        point: Point,
        version: Version,
        hint: Option<&Point>,
    ) -> Result<bool> {
        let bucket_key = self.grid.bucket_of(&point)?;
        let hint_bucket = hint.map(|p| self.grid.bucket_of(p)).transpose()?;
        let mut shard = self.shard(&id)?;

        let (old_bucket, mut forwards) = match shard.get(&id) {
            Some(Placement::Removed { version: removed, .. }) if *removed >= version => {
                return Ok(false);
            }
            Some(placement) if placement.version() > version => return Ok(false),
            Some(Placement::Live {
                bucket, forwards, ..
            }) => (Some(bucket.clone()), forwards.clone()),
            Some(Placement::Removed { .. }) => (None, SmallVec::new()),
            None => (hint_bucket, SmallVec::new()),
        };

        // Older forwarding entries follow the id to its newest location
        for forward in &forwards {
            self.with_existing_bucket_mut(&forward.bucket, |members| {
                if let Some(entry) = members.get_mut(&id) {
                    if entry.forwarded && entry.version <= version {
                        *entry = IndexEntry::forwarding(point, version);
                    }
                }
            })?;
        }

        if let Some(old) = old_bucket.filter(|old| *old != bucket_key) {
            self.with_existing_bucket_mut(&old, |members| {
                if let Some(entry) = members.get_mut(&id) {
                    if entry.version <= version {
                        *entry = IndexEntry::forwarding(point, version);
                    }
                }
            })?;
            forwards.retain(|forward| forward.bucket != old);
            forwards.push(Forward {
                bucket: old,
                since: Instant::now(),
            });
        }
        forwards.retain(|forward| forward.bucket != bucket_key);

        self.with_bucket_mut(&bucket_key, |members| {
            members.insert(id, IndexEntry::live(point, version));
        })?;

        shard.insert(
            id,
            Placement::Live {
                bucket: bucket_key,
                version,
                forwards,
            },
        );
        Ok(true)
    }

    fn shard(&self, id: &BusinessId) -> Result<MutexGuard<'_, FxHashMap<BusinessId, Placement>>> {
        let slot = (id.as_uuid().as_u128() % PLACEMENT_SHARDS as u128) as usize;
        self.placements[slot]
            .lock()
            .map_err(|_| ProximityError::Lock("placement"))
    }

    fn read_buckets(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, FxHashMap<String, RwLock<Bucket>>>> {
        self.buckets
            .read()
            .map_err(|_| ProximityError::Lock("index"))
    }

    /// Run `f` on the bucket at `key`, creating it if needed
    fn with_bucket_mut<R>(&self, key: &str, f: impl FnOnce(&mut Bucket) -> R) -> Result<R> {
        {
            let buckets = self.read_buckets()?;
            if let Some(bucket) = buckets.get(key) {
                let mut members = bucket.write().map_err(|_| ProximityError::Lock("bucket"))?;
                return Ok(f(&mut members));
            }
        }

        let mut buckets = self
            .buckets
            .write()
            .map_err(|_| ProximityError::Lock("index"))?;
        let bucket = buckets.entry(key.to_string()).or_default();
        let members = bucket.get_mut().map_err(|_| ProximityError::Lock("bucket"))?;
        Ok(f(members))
    }

    /// Run `f` on the bucket at `key` only if it exists
    fn with_existing_bucket_mut<R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut Bucket) -> R,
    ) -> Result<Option<R>> {
        let buckets = self.read_buckets()?;
        match buckets.get(key) {
            Some(bucket) => {
                let mut members = bucket.write().map_err(|_| ProximityError::Lock("bucket"))?;
                Ok(Some(f(&mut members)))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn index() -> SpatialIndex {
        SpatialIndex::new(5).unwrap()
    }

    #[test]
    fn test_insert_and_query() {
        let index = index();
        let a = BusinessId::new();
        let b = BusinessId::new();
        index.insert(a, Point::new(37.5, 127.0), 0).unwrap();
        index.insert(b, Point::new(37.503, 127.0), 0).unwrap();

        let hits = index.query(&Point::new(37.5, 127.0), 100.0).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, a);

        let hits = index.query(&Point::new(37.5, 127.0), 1_000.0).unwrap();
        assert_eq!(hits.iter().map(|h| h.id).collect::<Vec<_>>(), vec![a, b]);
        assert!(hits[0].distance_m <= hits[1].distance_m);
    }

    #[test]
    fn test_insert_is_idempotent() {
        let index = index();
        let id = BusinessId::new();
        let point = Point::new(37.5, 127.0);
        assert!(index.insert(id, point, 0).unwrap());
        assert!(index.insert(id, point, 0).unwrap());

        assert_eq!(index.len().unwrap(), 1);
        assert_eq!(index.query(&point, 10.0).unwrap().len(), 1);
    }

    #[test]
    fn test_stale_insert_is_ignored() {
        let index = index();
        let id = BusinessId::new();
        index.insert(id, Point::new(38.0, 128.0), 2).unwrap();
        assert!(!index.insert(id, Point::new(37.5, 127.0), 1).unwrap());

        assert_eq!(index.version_of(&id).unwrap(), Some(2));
        assert!(index.query(&Point::new(37.5, 127.0), 100.0).unwrap().is_empty());
    }

    #[test]
    fn test_ties_break_by_id() {
        let index = index();
        let point = Point::new(37.5, 127.0);
        let mut ids: Vec<BusinessId> = (0..5).map(|_| BusinessId::new()).collect();
        for id in &ids {
            index.insert(*id, point, 0).unwrap();
        }
        ids.sort();

        let hits = index.query(&point, 50.0).unwrap();
        assert_eq!(hits.iter().map(|h| h.id).collect::<Vec<_>>(), ids);
    }

    #[test]
    fn test_remove_and_duplicate_remove() {
        let index = index();
        let id = BusinessId::new();
        let point = Point::new(37.5, 127.0);
        index.insert(id, point, 0).unwrap();

        assert!(index.remove(id, &point, 0).unwrap());
        assert!(!index.remove(id, &point, 0).unwrap());
        assert!(index.query(&point, 100.0).unwrap().is_empty());
        assert_eq!(index.version_of(&id).unwrap(), None);
    }

    #[test]
    fn test_tombstone_blocks_late_insert() {
        let index = index();
        let id = BusinessId::new();
        let point = Point::new(37.5, 127.0);
        index.remove(id, &point, 3).unwrap();
        assert!(!index.insert(id, point, 2).unwrap());
        assert!(!index.insert(id, point, 3).unwrap());
        assert!(index.query(&point, 100.0).unwrap().is_empty());
    }

    #[test]
    fn test_relocate_moves_between_buckets() {
        let index = index();
        let id = BusinessId::new();
        let old = Point::new(37.5, 127.0);
        let new = Point::new(38.0, 128.0);
        index.insert(id, old, 0).unwrap();
        index.relocate(id, old, new, 1).unwrap();

        assert!(index.query(&old, 100.0).unwrap().is_empty());
        let hits = index.query(&new, 100.0).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].version, 1);

        // the old cell still holds a forwarding entry until pruned
        let stats = index.prune(Duration::ZERO).unwrap();
        assert_eq!(stats.forwards_removed, 1);
        assert_eq!(stats.buckets_removed, 1);
        assert_eq!(index.bucket_count().unwrap(), 1);
    }

    #[test]
    fn test_relocate_without_placement_uses_old_hint() {
        let index = index();
        let id = BusinessId::new();
        let old = Point::new(37.5, 127.0);
        let new = Point::new(37.6, 127.1);
        index.relocate(id, old, new, 1).unwrap();
        assert_eq!(index.locate(&id).unwrap().unwrap().point, new);
    }

    #[test]
    fn test_insert_batch() {
        let index = index();
        let entries: Vec<_> = (0..100)
            .map(|i| {
                (
                    BusinessId::new(),
                    Point::new(37.5 + i as f64 * 0.0001, 127.0),
                    0,
                )
            })
            .collect();
        assert_eq!(index.insert_batch(&entries).unwrap(), 100);
        assert_eq!(index.len().unwrap(), 100);
        assert_eq!(index.query(&Point::new(37.505, 127.0), 2_000.0).unwrap().len(), 100);
    }

    #[test]
    fn test_large_radius_scans_all_buckets() {
        let index = SpatialIndex::new(8).unwrap();
        let seoul = BusinessId::new();
        let busan = BusinessId::new();
        index.insert(seoul, Point::new(37.5665, 126.9780), 0).unwrap();
        index.insert(busan, Point::new(35.1796, 129.0756), 0).unwrap();

        let hits = index.query(&Point::new(37.5665, 126.9780), 400_000.0).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, seoul);
    }

    #[test]
    fn test_query_across_antimeridian() {
        let index = index();
        let id = BusinessId::new();
        index.insert(id, Point::new(0.0, -179.999), 0).unwrap();

        let hits = index.query(&Point::new(0.0, 179.999), 1_000.0).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].distance_m < 300.0);
    }

    #[test]
    fn test_concurrent_relocate_never_hides_id() {
        let index = Arc::new(index());
        let id = BusinessId::new();
        let a = Point::new(37.5, 127.0);
        let b = Point::new(37.5, 127.06);
        let center = Point::new(37.5, 127.03);
        index.insert(id, a, 0).unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let mover = {
            let index = Arc::clone(&index);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut version = 0;
                while !stop.load(Ordering::Relaxed) && version < 2_000 {
                    version += 1;
                    let (from, to) = if version % 2 == 1 { (a, b) } else { (b, a) };
                    index.relocate(id, from, to, version).unwrap();
                }
            })
        };

        // both locations are within 5 km of the center, so every query must see the id
        for _ in 0..500 {
            let hits = index.query(&center, 5_000.0).unwrap();
            assert_eq!(hits.iter().filter(|h| h.id == id).count(), 1);
        }
        stop.store(true, Ordering::Relaxed);
        mover.join().unwrap();
    }
}
