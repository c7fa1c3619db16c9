//! In-memory index of the virtual tree
//!
//! Keyed by normalized path. Besides the entries themselves the index keeps
//! the recency order of resident files (scanned from the least recent end
//! by eviction), the running total of resident bytes, and the snapshot of
//! the last successful listing refresh.
//!
//! The index does no I/O. Callers hold the engine's index lock for the
//! duration of one metadata change and do blob or network work outside it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::entry::{CacheState, EntryKind, PathEntry};
use crate::mirror::{Listing, ObjectId, RemoteEntry};
use crate::path::{self, ROOT};

/// Listing state as of the last successful refresh
#[derive(Debug, Clone, Default)]
pub struct SyncSnapshot {
    /// Number of completed refreshes
    pub refresh: u64,
    pub refreshed_at: Option<DateTime<Utc>>,
    pub objects: BTreeMap<String, ObjectId>,
}

#[derive(Debug)]
pub struct CacheIndex {
    entries: BTreeMap<String, PathEntry>,
    /// recency rank -> path, resident files only
    recency: BTreeMap<u64, String>,
    tick: u64,
    resident_bytes: u64,
    snapshot: SyncSnapshot,
}

impl Default for CacheIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheIndex {
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(ROOT.to_string(), PathEntry::directory(ROOT));
        Self {
            entries,
            recency: BTreeMap::new(),
            tick: 0,
            resident_bytes: 0,
            snapshot: SyncSnapshot::default(),
        }
    }

    /// Visible entry for a path; tombstones are hidden
    pub fn lookup(&self, file_path: &str) -> Option<&PathEntry> {
        self.entry(file_path)
            .filter(|e| e.state != CacheState::Tombstoned)
    }

    /// Entry for a path including tombstones
    pub fn entry(&self, file_path: &str) -> Option<&PathEntry> {
        self.entries.get(&path::normalize(file_path))
    }

    /// Insert or replace an entry, creating missing ancestor directories
    pub fn upsert(&mut self, mut entry: PathEntry) {
        entry.path = path::normalize(&entry.path);
        for ancestor in path::ancestors(&entry.path) {
            let live_dir = self
                .entries
                .get(&ancestor)
                .map(|e| e.is_dir() && e.state != CacheState::Tombstoned)
                .unwrap_or(false);
            if !live_dir {
                if let Some(old) = self.entries.remove(&ancestor) {
                    self.forget(&old);
                }
                self.entries
                    .insert(ancestor.clone(), PathEntry::directory(&ancestor));
            }
        }

        if let Some(old) = self.entries.remove(&entry.path) {
            self.forget(&old);
        }
        self.resident_bytes += entry.resident_bytes();
        if entry.is_file() && entry.state.is_resident() {
            self.tick += 1;
            entry.recency = self.tick;
            self.recency.insert(entry.recency, entry.path.clone());
        }
        self.entries.insert(entry.path.clone(), entry);
    }

    /// Drop an entry's contribution to the recency order and byte total
    fn forget(&mut self, entry: &PathEntry) {
        self.resident_bytes = self.resident_bytes.saturating_sub(entry.resident_bytes());
        if entry.recency != 0 {
            self.recency.remove(&entry.recency);
        }
    }

    /// Apply a change to an existing entry, keeping the accounting straight
    pub fn update<F>(&mut self, file_path: &str, f: F) -> Option<&PathEntry>
    where
        F: FnOnce(&mut PathEntry),
    {
        let key = path::normalize(file_path);
        let mut entry = self.entries.remove(&key)?;
        self.forget(&entry);

        let was_resident = entry.is_file() && entry.state.is_resident();
        let recency = entry.recency;
        f(&mut entry);
        entry.path = key.clone();

        self.resident_bytes += entry.resident_bytes();
        if entry.is_file() && entry.state.is_resident() {
            if was_resident && recency != 0 {
                entry.recency = recency;
            } else {
                self.tick += 1;
                entry.recency = self.tick;
            }
            self.recency.insert(entry.recency, key.clone());
        } else {
            entry.recency = 0;
        }

        self.entries.insert(key.clone(), entry);
        self.entries.get(&key)
    }

    /// Move a resident entry to the most recent end
    pub fn touch(&mut self, file_path: &str) {
        let key = path::normalize(file_path);
        let tick = self.tick + 1;
        let Some(entry) = self.entries.get_mut(&key) else {
            return;
        };
        if !(entry.is_file() && entry.state.is_resident()) {
            return;
        }
        self.recency.remove(&entry.recency);
        entry.recency = tick;
        self.recency.insert(tick, key);
        self.tick = tick;
    }

    /// Record a local content change; returns the new generation
    pub fn mark_dirty(&mut self, file_path: &str, size: u64) -> Option<u64> {
        let entry = self.update(file_path, |e| {
            e.state = CacheState::CachedDirty;
            e.size = size;
            e.generation += 1;
            e.modified = Utc::now().timestamp();
        })?;
        let generation = entry.generation;
        self.touch(file_path);
        Some(generation)
    }

    /// Record that content of the given generation reached the remote
    ///
    /// Returns false and leaves the entry dirty when it changed again since.
    pub fn mark_clean(&mut self, file_path: &str, generation: u64, remote: &RemoteEntry) -> bool {
        let Some(current) = self.entry(file_path) else {
            return false;
        };
        if current.generation != generation || current.state != CacheState::CachedDirty {
            return false;
        }
        self.update(file_path, |e| {
            e.object_id = Some(remote.object_id.clone());
            e.state = CacheState::CachedClean;
        });
        true
    }

    /// Record that a resident entry's blob is gone
    pub fn mark_evicted(&mut self, file_path: &str) {
        self.update(file_path, |e| {
            if e.state.is_resident() {
                e.state = CacheState::RemoteOnly;
            }
        });
    }

    /// Record that a fetched blob is now resident
    pub fn mark_fetched(&mut self, file_path: &str, size: u64) {
        self.update(file_path, |e| {
            if e.state == CacheState::RemoteOnly {
                e.state = CacheState::CachedClean;
                e.size = size;
            }
        });
        self.touch(file_path);
    }

    /// Hide an entry until reconciliation confirms it is gone remotely
    pub fn tombstone(&mut self, file_path: &str) {
        self.update(file_path, |e| {
            e.state = CacheState::Tombstoned;
            e.open_handles = 0;
        });
    }

    /// Purge an entry outright
    pub fn remove(&mut self, file_path: &str) -> Option<PathEntry> {
        let entry = self.entries.remove(&path::normalize(file_path))?;
        self.forget(&entry);
        Some(entry)
    }

    /// Visible children of a directory, ordered by name
    pub fn list(&self, dir_path: &str) -> Option<Vec<PathEntry>> {
        let dir = path::normalize(dir_path);
        let entry = self.lookup(&dir)?;
        if !entry.is_dir() {
            return None;
        }

        Some(
            self.descendant_entries(&dir)
                .filter(|e| path::parent(&e.path) == dir)
                .filter(|e| e.state != CacheState::Tombstoned)
                .cloned()
                .collect(),
        )
    }

    /// Every entry strictly below a directory, tombstones included
    fn descendant_entries<'a>(&'a self, dir: &str) -> impl Iterator<Item = &'a PathEntry> + 'a {
        let prefix = if dir == ROOT {
            ROOT.to_string()
        } else {
            format!("{}/", dir)
        };
        self.entries
            .range(prefix.clone()..)
            .take_while(move |(k, _)| k.starts_with(&prefix))
            .map(|(_, e)| e)
            .filter(|e| e.path != ROOT)
    }

    /// Paths of visible entries strictly below a directory
    pub fn descendants(&self, dir_path: &str) -> Vec<String> {
        let dir = path::normalize(dir_path);
        self.descendant_entries(&dir)
            .filter(|e| e.state != CacheState::Tombstoned)
            .map(|e| e.path.clone())
            .collect()
    }

    pub fn acquire(&mut self, file_path: &str) {
        if let Some(entry) = self.entries.get_mut(&path::normalize(file_path)) {
            entry.open_handles += 1;
        }
    }

    pub fn release(&mut self, file_path: &str) {
        if let Some(entry) = self.entries.get_mut(&path::normalize(file_path)) {
            entry.open_handles = entry.open_handles.saturating_sub(1);
        }
    }

    /// Resident file paths from least to most recently used
    pub fn lru_order(&self) -> impl Iterator<Item = &String> {
        self.recency.values()
    }

    pub fn resident_bytes(&self) -> u64 {
        self.resident_bytes
    }

    pub fn snapshot(&self) -> &SyncSnapshot {
        &self.snapshot
    }

    /// Record a successful listing refresh
    pub fn record_refresh(&mut self, listing: &Listing) {
        self.snapshot.refresh += 1;
        self.snapshot.refreshed_at = Some(Utc::now());
        self.snapshot.objects = listing
            .iter()
            .map(|(p, e)| (p.clone(), e.object_id.clone()))
            .collect();
    }

    /// All entries, tombstones included
    pub fn iter(&self) -> impl Iterator<Item = &PathEntry> {
        self.entries.values()
    }

    pub fn count(&self, kind: EntryKind) -> usize {
        self.entries
            .values()
            .filter(|e| e.kind == kind && e.state != CacheState::Tombstoned)
            .count()
    }

    pub fn count_state(&self, state: CacheState) -> usize {
        self.entries
            .values()
            .filter(|e| e.is_file() && e.state == state)
            .count()
    }
}
