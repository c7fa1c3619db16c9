//! The engine: the one owned structure shared by the dispatcher, the
//! eviction pass and the worker pool
//!
//! Lock order: the index lock may be held while taking the queue lock,
//! never the other way around. Neither is held across an await.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};

use crate::cache::{
    blob_name, BlobStore, CacheIndex, CacheState, EntryKind, EvictionManager, EvictionReport,
    PathEntry,
};
use crate::mirror::{ContentMirror, Listing, MirrorError, RemoteEntry};
use crate::path;
use crate::sync::{reconcile, ReconcileReport};
use crate::writeback::{ChangeOp, JobDispatcher, JobReceiver, PendingChange, RepoLock, WriteBackQueue};

pub const GIGABYTE: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Disk budget for resident blobs
    pub cache_budget_bytes: u64,
    /// Time between listing refreshes
    pub sync_interval: Duration,
    /// Size of the repository worker pool
    pub workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_budget_bytes: 10 * GIGABYTE,
            sync_interval: Duration::from_secs(5 * 60),
            workers: 5,
        }
    }
}

impl EngineConfig {
    pub fn from_gigabytes(cache_gb: u64, sync_minutes: u64, workers: usize) -> Self {
        Self {
            cache_budget_bytes: cache_gb.saturating_mul(GIGABYTE),
            sync_interval: Duration::from_secs(sync_minutes.saturating_mul(60)),
            workers,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("mirror error: {0}")]
    Mirror(#[from] MirrorError),
    #[error("cache i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Point-in-time view of the cache, for `statfs` and status output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    pub resident_bytes: u64,
    pub budget_bytes: u64,
    pub files: usize,
    pub directories: usize,
    pub remote_only: usize,
    pub cached_clean: usize,
    pub cached_dirty: usize,
    pub tombstoned: usize,
    pub pending_changes: usize,
    pub refreshes: u64,
    pub last_refresh: Option<DateTime<Utc>>,
}

/// What startup restoration found
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub remote_files: usize,
    /// Blobs reused as clean cache entries
    pub cached: usize,
    /// Blobs with no remote counterpart, left on disk untouched
    pub orphaned: Vec<String>,
    /// Blobs whose size no longer matches the remote, removed
    pub stale: usize,
}

#[derive(Debug, Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

#[derive(Debug)]
struct EngineInner {
    config: EngineConfig,
    index: Mutex<CacheIndex>,
    queue: Mutex<WriteBackQueue>,
    blobs: BlobStore,
    eviction: EvictionManager,
    mirror: Arc<dyn ContentMirror>,
    jobs: JobDispatcher,
    /// A listing refresh is queued or running
    sync_requested: AtomicBool,
}

impl Engine {
    /// Build an engine storing blobs under `blob_dir`
    ///
    /// The returned receiver feeds the worker pool.
    pub fn new(
        config: EngineConfig,
        mirror: Arc<dyn ContentMirror>,
        blob_dir: impl Into<PathBuf>,
    ) -> io::Result<(Self, JobReceiver)> {
        let blobs = BlobStore::new(blob_dir)?;
        let (jobs, receiver) = JobDispatcher::new();
        let engine = Self {
            inner: Arc::new(EngineInner {
                eviction: EvictionManager::new(config.cache_budget_bytes),
                config,
                index: Mutex::new(CacheIndex::new()),
                queue: Mutex::new(WriteBackQueue::new()),
                blobs,
                mirror,
                jobs,
                sync_requested: AtomicBool::new(false),
            }),
        };
        Ok((engine, receiver))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn mirror(&self) -> &Arc<dyn ContentMirror> {
        &self.inner.mirror
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.inner.blobs
    }

    pub fn index(&self) -> MutexGuard<'_, CacheIndex> {
        self.inner.index.lock()
    }

    pub fn queue(&self) -> MutexGuard<'_, WriteBackQueue> {
        self.inner.queue.lock()
    }

    /// Trim resident blobs to the budget
    pub fn evict(&self) -> EvictionReport {
        let mut index = self.index();
        let pinned = self.queue().pending_paths();
        self.inner
            .eviction
            .evict_to_fit(&mut index, &self.inner.blobs, &pinned)
    }

    /// Queue a change for the remote
    ///
    /// Scratch files never reach the remote; renames into or out of scratch
    /// names turn into a plain write or delete. Safe to call while holding
    /// the index lock.
    pub fn enqueue(&self, file_path: &str, op: ChangeOp, generation: u64, remote_known: bool) {
        let (file_path, op) = match op {
            ChangeOp::Rename { to } => {
                match (path::is_scratch(file_path), path::is_scratch(&to)) {
                    (true, true) => return,
                    (true, false) => (to, ChangeOp::Write),
                    (false, true) => (file_path.to_string(), ChangeOp::Delete),
                    (false, false) => (file_path.to_string(), ChangeOp::Rename { to }),
                }
            }
            op if path::is_scratch(file_path) => {
                tracing::debug!("not queueing {:?} of scratch file {}", op, file_path);
                return;
            }
            op => (file_path.to_string(), op),
        };

        let mut queue = self.queue();
        let op = match op {
            // nothing on the remote to move, upload the destination instead
            ChangeOp::Rename { to } if !remote_known && !queue.has_pending(&file_path) => {
                return self.schedule(queue.enqueue(&to, ChangeOp::Write, generation, false));
            }
            ChangeOp::Delete if !remote_known && !queue.has_pending(&file_path) => return,
            op => op,
        };
        let lane = queue.enqueue(&file_path, op, generation, remote_known);
        drop(queue);
        self.schedule(lane);
    }

    fn schedule(&self, lane: Option<String>) {
        if let Some(lane) = lane {
            if let Err(e) = self.inner.jobs.dispatch_lane(lane) {
                tracing::error!("failed to schedule write-back: {}", e);
            }
        }
    }

    /// Take the next change of a lane; None if the lane has nothing to do
    pub fn begin_change(&self, lane: &str) -> Option<PendingChange> {
        self.queue().begin(lane)
    }

    /// Release a lane after applying its change, handing it back if needed
    pub fn finish_change(&self, lane: &str) {
        let more = self.queue().finish(lane);
        if more {
            self.schedule(Some(lane.to_string()));
        }
    }

    /// Commit and push one change
    ///
    /// Failures are terminal: the change is dropped and the entry keeps its
    /// local state.
    pub async fn apply_change(&self, change: &PendingChange, lock: &RepoLock) {
        let result = match &change.op {
            ChangeOp::Create | ChangeOp::Write => self.push_content(change, lock).await,
            ChangeOp::Delete => self.push_delete(change, lock).await,
            ChangeOp::Rename { to } => self.push_rename(change, to, lock).await,
        };

        match result {
            Ok(()) => tracing::debug!("applied {}", change),
            Err(e) => tracing::error!("dropping change {}: {}", change, e),
        }
    }

    /// Current local content of a resident file
    fn local_content(&self, file_path: &str) -> Result<Option<Bytes>, MirrorError> {
        let resident = self
            .index()
            .lookup(file_path)
            .map(|e| e.is_file() && e.state.is_resident())
            .unwrap_or(false);
        if !resident {
            return Ok(None);
        }
        match self.inner.blobs.read_all(file_path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn push_content(&self, change: &PendingChange, lock: &RepoLock) -> Result<(), MirrorError> {
        let Some(data) = self.local_content(&change.path)? else {
            tracing::debug!("skipping {}: no local content", change);
            return Ok(());
        };

        {
            let _repo = lock.acquire().await;
            let remote = self.inner.mirror.push_file(&change.path, data).await?;
            self.settle(&change.path, change.generation, &remote);
        }
        self.evict();
        Ok(())
    }

    async fn push_delete(&self, change: &PendingChange, lock: &RepoLock) -> Result<(), MirrorError> {
        let _repo = lock.acquire().await;
        match self.inner.mirror.remove_file(&change.path).await {
            Ok(()) => {}
            Err(MirrorError::NotFound(_)) => {
                tracing::debug!("{} already absent remotely", change.path);
            }
            Err(e) => return Err(e),
        }
        self.forget_remote(&change.path);
        Ok(())
    }

    async fn push_rename(
        &self,
        change: &PendingChange,
        to: &str,
        lock: &RepoLock,
    ) -> Result<(), MirrorError> {
        {
            let _repo = lock.acquire().await;
            let remote = self.inner.mirror.rename_file(&change.path, to).await?;
            self.forget_remote(&change.path);
            self.settle(to, change.generation, &remote);
        }
        self.evict();
        Ok(())
    }

    /// Record that the remote holds `remote` for a path
    fn settle(&self, file_path: &str, generation: u64, remote: &RemoteEntry) {
        let mut index = self.index();
        let queued = self.queue().has_queued(file_path);
        if queued || !index.mark_clean(file_path, generation, remote) {
            index.update(file_path, |e| {
                if e.is_file() {
                    e.object_id = Some(remote.object_id.clone());
                }
            });
        }
    }

    /// Record that the remote no longer holds a locally deleted path
    fn forget_remote(&self, file_path: &str) {
        let mut index = self.index();
        let tombstoned = index
            .entry(file_path)
            .map(|e| e.state == CacheState::Tombstoned)
            .unwrap_or(false);
        if tombstoned {
            index.update(file_path, |e| e.object_id = None);
        }
    }

    /// Ask the pool for a listing refresh unless one is already outstanding
    pub fn request_sync(&self) -> bool {
        if self
            .inner
            .sync_requested
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if let Err(e) = self.inner.jobs.dispatch_sync() {
            tracing::error!("failed to schedule listing refresh: {}", e);
            self.inner.sync_requested.store(false, Ordering::Release);
            return false;
        }
        true
    }

    /// Pull the listing and reconcile it, both under the repository lock
    ///
    /// Pushes settle the index under the same lock, so a listing is never
    /// older than an entry it reconciles. A failed pull keeps the previous
    /// (stale) listing.
    pub async fn sync_listing(&self, lock: &RepoLock) -> Option<ReconcileReport> {
        let _repo = lock.acquire().await;
        let listing = self.inner.mirror.pull_listing().await;
        self.inner.sync_requested.store(false, Ordering::Release);

        match listing {
            Ok(listing) => Some(self.reconcile(&listing)),
            Err(e) => {
                tracing::warn!("listing refresh failed, keeping previous listing: {}", e);
                None
            }
        }
    }

    /// Fold a listing into the index, then trim the cache
    pub fn reconcile(&self, listing: &Listing) -> ReconcileReport {
        let report = {
            let mut index = self.index();
            let pending = self.queue().pending_paths();
            reconcile(&mut index, &self.inner.blobs, listing, &pending)
        };
        if !report.is_empty() {
            tracing::info!(
                added = report.added.len(),
                updated = report.updated.len(),
                tombstoned = report.tombstoned.len(),
                purged = report.purged.len(),
                "reconciled remote listing"
            );
        }
        self.evict();
        report
    }

    /// Rebuild the index from the remote listing and the blobs on disk
    pub async fn restore(&self) -> Result<RestoreReport, EngineError> {
        let listing = self.inner.mirror.pull_listing().await?;
        let by_blob: HashMap<String, &String> =
            listing.keys().map(|p| (blob_name(p), p)).collect();

        let mut report = RestoreReport {
            remote_files: listing.len(),
            ..Default::default()
        };
        let mut resident = Vec::new();
        for (name, size) in self.inner.blobs.scan()? {
            match by_blob.get(&name) {
                Some(file_path) if listing[*file_path].size == size => {
                    resident.push((*file_path).clone());
                }
                Some(file_path) => {
                    tracing::warn!("cached copy of {} is stale, dropping it", file_path);
                    self.inner.blobs.remove(file_path)?;
                    report.stale += 1;
                }
                None => {
                    tracing::error!("orphaned blob {} ({} bytes), skipping", name, size);
                    report.orphaned.push(name);
                }
            }
        }

        {
            let mut index = self.index();
            for (file_path, remote) in &listing {
                let mut entry = PathEntry::remote(file_path, remote);
                if resident.contains(file_path) {
                    entry.state = CacheState::CachedClean;
                }
                index.upsert(entry);
            }
            index.record_refresh(&listing);
        }
        report.cached = resident.len();

        tracing::info!(
            "restored {} remote files, {} cached locally",
            report.remote_files,
            report.cached
        );
        self.evict();
        Ok(report)
    }

    pub fn stats(&self) -> EngineStats {
        let index = self.index();
        let pending_changes = self.queue().depth();
        EngineStats {
            resident_bytes: index.resident_bytes(),
            budget_bytes: self.inner.eviction.budget_bytes(),
            files: index.count(EntryKind::File),
            directories: index.count(EntryKind::Directory),
            remote_only: index.count_state(CacheState::RemoteOnly),
            cached_clean: index.count_state(CacheState::CachedClean),
            cached_dirty: index.count_state(CacheState::CachedDirty),
            tombstoned: index.count_state(CacheState::Tombstoned),
            pending_changes,
            refreshes: index.snapshot().refresh,
            last_refresh: index.snapshot().refreshed_at,
        }
    }

    /// Wait until the write-back queue is empty or the timeout passes
    ///
    /// Returns whether the queue drained.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.queue().is_empty() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::MemoryMirror;
    use tempfile::TempDir;

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.cache_budget_bytes, 10 * GIGABYTE);
        assert_eq!(config.sync_interval, Duration::from_secs(300));
        assert_eq!(config.workers, 5);
        assert_eq!(EngineConfig::from_gigabytes(10, 5, 5), config);
    }

    #[tokio::test]
    async fn test_restore_reuses_matching_blobs() {
        let dir = TempDir::new().unwrap();
        let mirror = MemoryMirror::new();
        mirror.put_remote("/kept.txt", "12345");
        mirror.put_remote("/stale.txt", "new content");
        mirror.put_remote("/remote.txt", "r");

        let blobs = BlobStore::new(dir.path()).unwrap();
        blobs.write_all("/kept.txt", b"12345").unwrap();
        blobs.write_all("/stale.txt", b"old").unwrap();
        blobs.write_all("/orphan.txt", b"lost").unwrap();

        let (engine, _rx) =
            Engine::new(EngineConfig::default(), Arc::new(mirror), dir.path()).unwrap();
        let report = engine.restore().await.unwrap();

        assert_eq!(report.remote_files, 3);
        assert_eq!(report.cached, 1);
        assert_eq!(report.stale, 1);
        assert_eq!(report.orphaned, vec![blob_name("/orphan.txt")]);

        let index = engine.index();
        assert_eq!(index.lookup("/kept.txt").unwrap().state, CacheState::CachedClean);
        assert_eq!(index.lookup("/stale.txt").unwrap().state, CacheState::RemoteOnly);
        assert_eq!(index.lookup("/remote.txt").unwrap().state, CacheState::RemoteOnly);
        assert!(index.lookup("/orphan.txt").is_none());
        assert_eq!(index.resident_bytes(), 5);
    }

    #[tokio::test]
    async fn test_scratch_files_are_never_queued() {
        let dir = TempDir::new().unwrap();
        let (engine, _rx) = Engine::new(
            EngineConfig::default(),
            Arc::new(MemoryMirror::new()),
            dir.path(),
        )
        .unwrap();

        engine.enqueue("/.notes.swp", ChangeOp::Create, 0, false);
        engine.enqueue("/notes.txt~", ChangeOp::Write, 1, false);
        assert!(engine.queue().is_empty());

        // a scratch file renamed onto a real name is uploaded
        engine.enqueue(
            "/.notes.swp",
            ChangeOp::Rename {
                to: "/notes.txt".to_string(),
            },
            2,
            false,
        );
        assert!(engine.queue().has_queued_content("/notes.txt"));
    }

    #[tokio::test]
    async fn test_request_sync_is_not_stacked() {
        let dir = TempDir::new().unwrap();
        let (engine, rx) = Engine::new(
            EngineConfig::default(),
            Arc::new(MemoryMirror::new()),
            dir.path(),
        )
        .unwrap();

        assert!(engine.request_sync());
        assert!(!engine.request_sync());
        assert!(rx.try_recv().is_some());
        assert!(rx.try_recv().is_none());

        engine.sync_listing(&RepoLock::new()).await.unwrap();
        assert!(engine.request_sync());
    }
}
