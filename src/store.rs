//! Durable source of truth for businesses.
//!
//! [`Store`] is the seam the write coordinator and query engine talk to.
//! [`AofStore`] keeps every record in memory, ordered by id, and appends each
//! mutation to an [`AofFile`] before applying it. Writers are serialized
//! through the log mutex so compare-and-swap updates are atomic; readers
//! only take the record map's read lock.

use crate::error::{ProximityError, Result};
use crate::persistence::{AofCommand, AofConfig, AofFile};
use crate::types::{Business, BusinessDraft, BusinessId, BusinessUpdate};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// The record of a successful update
#[derive(Debug, Clone, PartialEq)]
pub struct Revision {
    pub previous: Business,
    pub current: Business,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Persist a new business at version 0 with a fresh id
    async fn insert(&self, draft: BusinessDraft) -> Result<Business>;

    /// Persist many new businesses as one durable write
    async fn insert_batch(&self, drafts: Vec<BusinessDraft>) -> Result<Vec<Business>>;

    async fn get(&self, id: &BusinessId) -> Result<Option<Business>>;

    /// Fetch the records that exist among `ids`, in `ids` order
    async fn get_many(&self, ids: &[BusinessId]) -> Result<Vec<Business>>;

    /// Replace all fields, bumping the version by one.
    ///
    /// Fails with `VersionConflict` when `expected_version` is set and no
    /// longer current, and with `NotFound` when the id is absent.
    async fn update(&self, id: &BusinessId, update: BusinessUpdate) -> Result<Revision>;

    /// Remove a record, returning what was removed
    async fn delete(&self, id: &BusinessId) -> Result<Business>;

    /// Records with id strictly greater than `after`, in id order
    async fn scan(&self, after: Option<BusinessId>, limit: usize) -> Result<Vec<Business>>;

    async fn count(&self) -> Result<usize>;

    /// Force buffered writes to durable storage
    async fn sync(&self) -> Result<()>;

    /// Compact durable storage if it has grown past its threshold.
    /// Returns whether a compaction ran.
    async fn compact_if_needed(&self) -> Result<bool> {
        Ok(false)
    }
}

/// In-memory record map backed by an optional append-only file
pub struct AofStore {
    records: RwLock<BTreeMap<BusinessId, Business>>,
    aof: Mutex<Option<AofFile>>,
    closed: AtomicBool,
}

impl AofStore {
    /// Open (or create) a store at `path`, replaying its log
    pub fn open<P: AsRef<Path>>(path: P, config: AofConfig) -> Result<Self> {
        let mut aof = AofFile::open_with_config(path, config)?;
        let mut records = BTreeMap::new();

        for command in aof.replay()? {
            apply_command(&mut records, command);
        }

        info!(
            path = %aof.path().display(),
            records = records.len(),
            "opened store"
        );

        Ok(Self {
            records: RwLock::new(records),
            aof: Mutex::new(Some(aof)),
            closed: AtomicBool::new(false),
        })
    }

    /// A store with no persistence, for tests and ephemeral runs
    pub fn memory() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            aof: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Rewrite the log down to one record per live business
    pub fn compact(&self) -> Result<()> {
        let mut aof = self.lock_aof()?;
        if let Some(aof) = aof.as_mut() {
            let records = self.read_records()?;
            aof.rewrite(records.values())?;
        }
        Ok(())
    }

    /// Whether the log has outgrown its rewrite threshold
    pub fn needs_compaction(&self) -> Result<bool> {
        Ok(self
            .lock_aof()?
            .as_ref()
            .is_some_and(|aof| aof.needs_rewrite()))
    }

    /// Sync and detach the log. Later calls fail with `Closed`.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(mut aof) = self.lock_aof()?.take() {
            aof.sync()?;
        }
        debug!("closed store");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProximityError::Closed);
        }
        Ok(())
    }

    fn lock_aof(&self) -> Result<std::sync::MutexGuard<'_, Option<AofFile>>> {
        self.aof.lock().map_err(|_| ProximityError::Lock("aof"))
    }

    fn read_records(&self) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<BusinessId, Business>>> {
        self.records
            .read()
            .map_err(|_| ProximityError::Lock("store"))
    }

    fn write_records(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, BTreeMap<BusinessId, Business>>> {
        self.records
            .write()
            .map_err(|_| ProximityError::Lock("store"))
    }

    /// Log `command` (when persistent) then apply `apply` to memory, all
    /// under the writer lock.
    fn commit<T>(
        &self,
        prepare: impl FnOnce(&BTreeMap<BusinessId, Business>) -> Result<(AofCommand, T)>,
        apply: impl FnOnce(&mut BTreeMap<BusinessId, Business>, AofCommand),
    ) -> Result<T> {
        self.ensure_open()?;
        let mut aof = self.lock_aof()?;
        let (command, output) = prepare(&*self.read_records()?)?;
        if let Some(aof) = aof.as_mut() {
            aof.write_command(&command)?;
        }
        apply(&mut *self.write_records()?, command);
        Ok(output)
    }
}

fn apply_command(records: &mut BTreeMap<BusinessId, Business>, command: AofCommand) {
    match command {
        AofCommand::Put(business) => {
            records.insert(business.id, business);
        }
        AofCommand::PutBatch(batch) => {
            records.extend(batch.into_iter().map(|b| (b.id, b)));
        }
        AofCommand::Delete { id } => {
            records.remove(&id);
        }
    }
}

#[async_trait]
impl Store for AofStore {
    async fn insert(&self, draft: BusinessDraft) -> Result<Business> {
        self.commit(
            |_| {
                let business = Business::create(BusinessId::new(), draft, Utc::now());
                Ok((AofCommand::Put(business.clone()), business))
            },
            apply_command,
        )
    }

    async fn insert_batch(&self, drafts: Vec<BusinessDraft>) -> Result<Vec<Business>> {
        if drafts.is_empty() {
            return Ok(Vec::new());
        }
        self.commit(
            |_| {
                let now = Utc::now();
                let batch: Vec<Business> = drafts
                    .into_iter()
                    .map(|draft| Business::create(BusinessId::new(), draft, now))
                    .collect();
                Ok((AofCommand::PutBatch(batch.clone()), batch))
            },
            apply_command,
        )
    }

    async fn get(&self, id: &BusinessId) -> Result<Option<Business>> {
        self.ensure_open()?;
        Ok(self.read_records()?.get(id).cloned())
    }

    async fn get_many(&self, ids: &[BusinessId]) -> Result<Vec<Business>> {
        self.ensure_open()?;
        let records = self.read_records()?;
        Ok(ids.iter().filter_map(|id| records.get(id).cloned()).collect())
    }

    async fn update(&self, id: &BusinessId, update: BusinessUpdate) -> Result<Revision> {
        self.commit(
            |records| {
                let previous = records
                    .get(id)
                    .cloned()
                    .ok_or(ProximityError::NotFound(*id))?;
                if let Some(expected) = update.expected_version {
                    if expected != previous.version {
                        return Err(ProximityError::VersionConflict {
                            id: *id,
                            expected,
                            actual: previous.version,
                        });
                    }
                }
                let current = previous.revise(update.fields, Utc::now());
                Ok((
                    AofCommand::Put(current.clone()),
                    Revision { previous, current },
                ))
            },
            apply_command,
        )
    }

    async fn delete(&self, id: &BusinessId) -> Result<Business> {
        self.commit(
            |records| {
                let removed = records
                    .get(id)
                    .cloned()
                    .ok_or(ProximityError::NotFound(*id))?;
                Ok((AofCommand::Delete { id: *id }, removed))
            },
            apply_command,
        )
    }

    async fn scan(&self, after: Option<BusinessId>, limit: usize) -> Result<Vec<Business>> {
        self.ensure_open()?;
        let records = self.read_records()?;
        let lower = match after {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        Ok(records
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(_, b)| b.clone())
            .collect())
    }

    async fn count(&self) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.read_records()?.len())
    }

    async fn sync(&self) -> Result<()> {
        if let Some(aof) = self.lock_aof()?.as_mut() {
            aof.sync()?;
        }
        Ok(())
    }

    async fn compact_if_needed(&self) -> Result<bool> {
        if !self.needs_compaction()? {
            return Ok(false);
        }
        self.compact()?;
        Ok(true)
    }
}
