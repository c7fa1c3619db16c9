use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use super::{ContentMirror, Listing, MirrorError, ObjectId, RemoteEntry};
use crate::path;

/// In-process remote used for tests and dry runs
///
/// Behaves like a remote with a single authoritative listing. Offers hooks
/// to simulate other clients (`put_remote`, `remove_remote`), to make
/// operations fail, and to observe how pushes overlap.
#[derive(Debug, Clone, Default)]
pub struct MemoryMirror {
    inner: Arc<MemoryMirrorInner>,
}

#[derive(Debug, Default)]
struct MemoryMirrorInner {
    files: Mutex<BTreeMap<String, (RemoteEntry, Bytes)>>,
    failing_paths: Mutex<HashSet<String>>,
    offline: Mutex<bool>,
    push_delay: Mutex<Option<Duration>>,
    fetch_delay: Mutex<Option<Duration>>,
    listing_delay: Mutex<Option<Duration>>,
    /// Applied repository operations, in order
    log: Mutex<Vec<String>>,
    pushes_in_flight: AtomicUsize,
    max_concurrent_pushes: AtomicUsize,
    fetch_count: AtomicUsize,
}

impl MemoryMirror {
    pub fn new() -> Self {
        Self::default()
    }

    fn object_id(data: &[u8]) -> ObjectId {
        ObjectId::new(hex::encode(Sha256::digest(data)))
    }

    fn entry_for(data: &[u8]) -> RemoteEntry {
        RemoteEntry {
            object_id: Self::object_id(data),
            size: data.len() as u64,
            modified: chrono::Utc::now().timestamp(),
        }
    }

    /// Place a file on the remote as if another client had pushed it
    pub fn put_remote(&self, file_path: &str, data: impl Into<Bytes>) -> RemoteEntry {
        let data = data.into();
        let entry = Self::entry_for(&data);
        self.inner
            .files
            .lock()
            .insert(path::normalize(file_path), (entry.clone(), data));
        entry
    }

    /// Remove a file from the remote as if another client had deleted it
    pub fn remove_remote(&self, file_path: &str) {
        self.inner.files.lock().remove(&path::normalize(file_path));
    }

    /// Current remote content of a path
    pub fn remote_content(&self, file_path: &str) -> Option<Bytes> {
        self.inner
            .files
            .lock()
            .get(&path::normalize(file_path))
            .map(|(_, data)| data.clone())
    }

    /// Make every push, remove or rename touching this path fail
    pub fn fail_path(&self, file_path: &str) {
        self.inner
            .failing_paths
            .lock()
            .insert(path::normalize(file_path));
    }

    /// Let pushes touching any path succeed again
    pub fn clear_failures(&self) {
        self.inner.failing_paths.lock().clear();
    }

    /// Make every operation fail until switched back
    pub fn set_offline(&self, offline: bool) {
        *self.inner.offline.lock() = offline;
    }

    /// Hold every push for this long, widening overlap windows
    pub fn set_push_delay(&self, delay: Duration) {
        *self.inner.push_delay.lock() = Some(delay);
    }

    /// Hold every fetch for this long
    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.inner.fetch_delay.lock() = Some(delay);
    }

    /// Hold every listing pull for this long after taking its snapshot
    pub fn set_listing_delay(&self, delay: Duration) {
        *self.inner.listing_delay.lock() = Some(delay);
    }

    /// Repository operations applied so far, e.g. `push /a.txt`
    pub fn operations(&self) -> Vec<String> {
        self.inner.log.lock().clone()
    }

    /// Highest number of push-style operations ever running at once
    pub fn max_concurrent_pushes(&self) -> usize {
        self.inner.max_concurrent_pushes.load(Ordering::SeqCst)
    }

    /// Number of blob fetches served
    pub fn fetch_count(&self) -> usize {
        self.inner.fetch_count.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<(), MirrorError> {
        if *self.inner.offline.lock() {
            return Err(MirrorError::Unavailable("remote is offline".to_string()));
        }
        Ok(())
    }

    fn check_path(&self, file_path: &str) -> Result<(), MirrorError> {
        if self.inner.failing_paths.lock().contains(file_path) {
            return Err(MirrorError::Unavailable(format!(
                "push rejected for {}",
                file_path
            )));
        }
        Ok(())
    }

    /// Run a push-style operation, tracking how many overlap
    async fn pushing<T>(
        &self,
        op: impl FnOnce() -> Result<T, MirrorError>,
    ) -> Result<T, MirrorError> {
        let now = self.inner.pushes_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner
            .max_concurrent_pushes
            .fetch_max(now, Ordering::SeqCst);

        let delay = *self.inner.push_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let result = op();
        self.inner.pushes_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl ContentMirror for MemoryMirror {
    async fn pull_listing(&self) -> Result<Listing, MirrorError> {
        self.check_online()?;
        let listing: Listing = self
            .inner
            .files
            .lock()
            .iter()
            .map(|(p, (entry, _))| (p.clone(), entry.clone()))
            .collect();

        let delay = *self.inner.listing_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(listing)
    }

    async fn fetch_blob(&self, file_path: &str, entry: &RemoteEntry) -> Result<Bytes, MirrorError> {
        self.check_online()?;
        let delay = *self.inner.fetch_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.fetch_count.fetch_add(1, Ordering::SeqCst);

        let files = self.inner.files.lock();
        // objects are content addressed, so any path holding the id will do
        let by_id = files
            .values()
            .find(|(current, _)| current.object_id == entry.object_id);
        match (by_id, files.get(&path::normalize(file_path))) {
            (Some((_, data)), _) => Ok(data.clone()),
            // a stale id still resolves to the newest content, like a branch tip
            (None, Some((_, data))) => Ok(data.clone()),
            (None, None) => Err(MirrorError::NotFound(file_path.to_string())),
        }
    }

    async fn push_file(&self, file_path: &str, data: Bytes) -> Result<RemoteEntry, MirrorError> {
        self.check_online()?;
        let file_path = path::normalize(file_path);
        self.check_path(&file_path)?;

        self.pushing(|| {
            let entry = Self::entry_for(&data);
            self.inner
                .files
                .lock()
                .insert(file_path.clone(), (entry.clone(), data));
            self.inner.log.lock().push(format!("push {}", file_path));
            Ok(entry)
        })
        .await
    }

    async fn remove_file(&self, file_path: &str) -> Result<(), MirrorError> {
        self.check_online()?;
        let file_path = path::normalize(file_path);
        self.check_path(&file_path)?;

        self.pushing(|| {
            if self.inner.files.lock().remove(&file_path).is_none() {
                return Err(MirrorError::NotFound(file_path.clone()));
            }
            self.inner.log.lock().push(format!("remove {}", file_path));
            Ok(())
        })
        .await
    }

    async fn rename_file(&self, from: &str, to: &str) -> Result<RemoteEntry, MirrorError> {
        self.check_online()?;
        let from = path::normalize(from);
        let to = path::normalize(to);
        self.check_path(&from)?;
        self.check_path(&to)?;

        self.pushing(|| {
            let mut files = self.inner.files.lock();
            let (entry, data) = files
                .remove(&from)
                .ok_or_else(|| MirrorError::NotFound(from.clone()))?;
            files.insert(to.clone(), (entry.clone(), data));
            self.inner
                .log
                .lock()
                .push(format!("rename {} -> {}", from, to));
            Ok(entry)
        })
        .await
    }
}
