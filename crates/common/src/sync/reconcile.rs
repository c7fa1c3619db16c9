//! Folding a fresh remote listing into the cache index
//!
//! Local activity always wins over the listing: a path with an outstanding
//! change or unpushed local content is left alone until that work settles.

use std::collections::HashSet;

use crate::cache::{BlobStore, CacheIndex, CacheState, PathEntry};
use crate::mirror::Listing;

/// What one reconciliation changed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// New remote files, now RemoteOnly
    pub added: Vec<String>,
    /// Files whose remote content changed; local blobs dropped
    pub updated: Vec<String>,
    /// Files gone remotely, hidden until the next pass confirms it
    pub tombstoned: Vec<String>,
    /// Tombstones confirmed gone and removed from the index
    pub purged: Vec<String>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.updated.is_empty()
            && self.tombstoned.is_empty()
            && self.purged.is_empty()
    }
}

/// Apply `listing` to the index
///
/// `pending` holds every path an outstanding change touches. Blobs of
/// invalidated entries are removed while the caller holds the index lock.
pub fn reconcile(
    index: &mut CacheIndex,
    blobs: &BlobStore,
    listing: &Listing,
    pending: &HashSet<String>,
) -> ReconcileReport {
    let mut report = ReconcileReport::default();

    for (file_path, remote) in listing {
        if pending.contains(file_path) {
            continue;
        }

        let Some(entry) = index.entry(file_path).cloned() else {
            index.upsert(PathEntry::remote(file_path, remote));
            report.added.push(file_path.clone());
            continue;
        };

        if entry.is_dir() {
            tracing::warn!(
                "remote file {} collides with a local directory, skipping",
                file_path
            );
            continue;
        }

        match entry.state {
            CacheState::Tombstoned => {
                // back on the remote with nothing pending locally
                index.upsert(PathEntry::remote(file_path, remote));
                report.added.push(file_path.clone());
            }
            CacheState::CachedDirty => {}
            _ if entry.object_id.as_ref() == Some(&remote.object_id) => {}
            _ if entry.open_handles > 0 => {
                tracing::debug!("{} changed remotely but is open, keeping stale copy", file_path);
            }
            CacheState::CachedClean => {
                if let Err(e) = blobs.remove(file_path) {
                    tracing::warn!("failed to drop stale blob for {}: {}", file_path, e);
                    continue;
                }
                index.upsert(PathEntry::remote(file_path, remote));
                report.updated.push(file_path.clone());
            }
            CacheState::RemoteOnly => {
                index.upsert(PathEntry::remote(file_path, remote));
                report.updated.push(file_path.clone());
            }
        }
    }

    let absent: Vec<PathEntry> = index
        .iter()
        .filter(|e| e.is_file() && !listing.contains_key(&e.path))
        .cloned()
        .collect();

    for entry in absent {
        if pending.contains(&entry.path) {
            continue;
        }
        match entry.state {
            CacheState::Tombstoned => {
                index.remove(&entry.path);
                report.purged.push(entry.path);
            }
            // unpushed local content, or a file the remote never held
            CacheState::CachedDirty => {}
            _ if entry.object_id.is_none() => {}
            CacheState::CachedClean | CacheState::RemoteOnly => {
                if entry.state == CacheState::CachedClean {
                    if let Err(e) = blobs.remove(&entry.path) {
                        tracing::warn!("failed to drop blob for {}: {}", entry.path, e);
                        continue;
                    }
                }
                index.tombstone(&entry.path);
                report.tombstoned.push(entry.path);
            }
        }
    }

    index.record_refresh(listing);
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::{ObjectId, RemoteEntry};
    use tempfile::TempDir;

    fn remote(id: &str, size: u64) -> RemoteEntry {
        RemoteEntry {
            object_id: ObjectId::new(id),
            size,
            modified: 0,
        }
    }

    fn setup() -> (TempDir, BlobStore, CacheIndex) {
        let dir = TempDir::new().unwrap();
        let blobs = BlobStore::new(dir.path()).unwrap();
        (dir, blobs, CacheIndex::new())
    }

    #[test]
    fn test_new_remote_entries_are_remote_only() {
        let (_dir, blobs, mut index) = setup();
        let mut listing = Listing::new();
        listing.insert("/docs/a.md".to_string(), remote("a", 3));

        let report = reconcile(&mut index, &blobs, &listing, &HashSet::new());

        assert_eq!(report.added, vec!["/docs/a.md"]);
        assert_eq!(
            index.lookup("/docs/a.md").unwrap().state,
            CacheState::RemoteOnly
        );
        assert!(index.lookup("/docs").unwrap().is_dir());
        assert_eq!(index.snapshot().refresh, 1);
    }

    #[test]
    fn test_changed_id_invalidates_clean_blob() {
        let (_dir, blobs, mut index) = setup();
        blobs.write_all("/a", b"old").unwrap();
        let mut entry = PathEntry::remote("/a", &remote("v1", 3));
        entry.state = CacheState::CachedClean;
        index.upsert(entry);

        let mut listing = Listing::new();
        listing.insert("/a".to_string(), remote("v2", 5));
        let report = reconcile(&mut index, &blobs, &listing, &HashSet::new());

        assert_eq!(report.updated, vec!["/a"]);
        let entry = index.lookup("/a").unwrap();
        assert_eq!(entry.state, CacheState::RemoteOnly);
        assert_eq!(entry.object_id, Some(ObjectId::new("v2")));
        assert_eq!(entry.size, 5);
        assert!(!blobs.exists("/a"));
        assert_eq!(index.resident_bytes(), 0);
    }

    #[test]
    fn test_dirty_entries_keep_local_content() {
        let (_dir, blobs, mut index) = setup();
        index.upsert(PathEntry::remote("/a", &remote("v1", 3)));
        index.mark_fetched("/a", 3);
        index.mark_dirty("/a", 4);

        let mut listing = Listing::new();
        listing.insert("/a".to_string(), remote("v2", 9));
        let report = reconcile(&mut index, &blobs, &listing, &HashSet::new());

        assert!(report.is_empty());
        let entry = index.lookup("/a").unwrap();
        assert_eq!(entry.state, CacheState::CachedDirty);
        assert_eq!(entry.size, 4);
    }

    #[test]
    fn test_missing_entries_tombstone_then_purge() {
        let (_dir, blobs, mut index) = setup();
        index.upsert(PathEntry::remote("/gone", &remote("g", 1)));
        let listing = Listing::new();

        let first = reconcile(&mut index, &blobs, &listing, &HashSet::new());
        assert_eq!(first.tombstoned, vec!["/gone"]);
        assert!(index.lookup("/gone").is_none());
        assert!(index.entry("/gone").is_some());

        let second = reconcile(&mut index, &blobs, &listing, &HashSet::new());
        assert_eq!(second.purged, vec!["/gone"]);
        assert!(index.entry("/gone").is_none());
    }

    #[test]
    fn test_pending_paths_are_left_alone() {
        let (_dir, blobs, mut index) = setup();
        index.upsert(PathEntry::remote("/renamed-away", &remote("r", 1)));
        index.tombstone("/renamed-away");
        let mut listing = Listing::new();
        listing.insert("/renamed-away".to_string(), remote("r", 1));
        listing.insert("/incoming".to_string(), remote("i", 1));
        let pending: HashSet<String> = ["/renamed-away".to_string(), "/incoming".to_string()]
            .into_iter()
            .collect();

        let report = reconcile(&mut index, &blobs, &listing, &pending);

        assert!(report.is_empty());
        assert!(index.lookup("/renamed-away").is_none());
        assert!(index.entry("/incoming").is_none());
    }

    #[test]
    fn test_local_only_files_survive() {
        let (_dir, blobs, mut index) = setup();
        index.upsert(PathEntry::local_file("/.notes.swp"));

        let report = reconcile(&mut index, &blobs, &Listing::new(), &HashSet::new());

        assert!(report.is_empty());
        assert!(index.lookup("/.notes.swp").is_some());
    }
}
