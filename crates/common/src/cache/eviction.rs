//! Disk budget enforcement
//!
//! True LRU over the resident files of the index. Only clean files with no
//! open handle and no queued change are candidates; when none remain the
//! budget is simply exceeded until a later pass.

use std::collections::HashSet;

use super::blobs::BlobStore;
use super::entry::{CacheState, PathEntry};
use super::index::CacheIndex;

/// Outcome of one eviction pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EvictionReport {
    pub evicted: Vec<String>,
    pub freed_bytes: u64,
    /// Still over budget with no candidate left
    pub blocked: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct EvictionManager {
    budget_bytes: u64,
}

impl EvictionManager {
    pub fn new(budget_bytes: u64) -> Self {
        Self { budget_bytes }
    }

    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    fn can_evict(entry: &PathEntry, pinned: &HashSet<String>) -> bool {
        entry.is_file()
            && entry.state == CacheState::CachedClean
            && entry.open_handles == 0
            && !pinned.contains(&entry.path)
    }

    /// Evictable entries from least to most recently used
    fn candidates(&self, index: &CacheIndex, pinned: &HashSet<String>) -> Vec<(String, u64)> {
        index
            .lru_order()
            .filter_map(|p| index.entry(p))
            .filter(|e| Self::can_evict(e, pinned))
            .map(|e| (e.path.clone(), e.size))
            .collect()
    }

    /// Evict until resident bytes fit the budget or no candidate remains
    ///
    /// `pinned` holds the paths with an outstanding change. Blob removal
    /// happens while the caller holds the index lock, so an entry and its
    /// blob disappear together.
    pub fn evict_to_fit(
        &self,
        index: &mut CacheIndex,
        blobs: &BlobStore,
        pinned: &HashSet<String>,
    ) -> EvictionReport {
        let mut report = EvictionReport::default();
        if index.resident_bytes() <= self.budget_bytes {
            return report;
        }

        // one scan per pass; the index lock keeps the order stable meanwhile
        let mut candidates = self.candidates(index, pinned).into_iter();
        while index.resident_bytes() > self.budget_bytes {
            let Some((victim, size)) = candidates.next() else {
                report.blocked = true;
                tracing::debug!(
                    "eviction blocked: {} resident bytes over a budget of {}",
                    index.resident_bytes(),
                    self.budget_bytes
                );
                break;
            };

            if let Err(e) = blobs.remove(&victim) {
                tracing::warn!("failed to remove blob for {}: {}", victim, e);
                continue;
            }

            index.mark_evicted(&victim);
            tracing::debug!("evicted {} ({} bytes)", victim, size);
            report.freed_bytes += size;
            report.evicted.push(victim);
        }

        report
    }
}
