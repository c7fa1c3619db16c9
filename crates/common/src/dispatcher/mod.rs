//! Operation dispatcher: the filesystem-facing surface of the engine
//!
//! Metadata calls (`lookup`, `getattr`, `readdir`) are answered from the
//! index alone. `open` and `read` are the only calls that may wait on the
//! network, and only when the file is not resident. Every mutating call
//! updates the local cache, queues a change and returns without touching
//! the remote.
//!
//! Concurrent misses of the same path share one fetch: the first caller
//! takes the path's fetch gate, later callers wait on it and then find the
//! blob resident.

mod handles;

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::cache::{CacheIndex, CacheState, PathEntry};
use crate::engine::{Engine, EngineStats};
use crate::mirror::{MirrorError, RemoteEntry};
use crate::path::{self, ROOT};
use crate::writeback::ChangeOp;

pub use handles::{FileHandle, HandleTable};

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("no such file or directory: {0}")]
    NotFound(String),
    #[error("is a directory: {0}")]
    IsDirectory(String),
    #[error("not a directory: {0}")]
    NotDirectory(String),
    #[error("directory not empty: {0}")]
    NotEmpty(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("bad file handle: {0}")]
    BadHandle(u64),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("repository error: {0}")]
    Repository(#[from] MirrorError),
    #[error("cache i/o error: {0}")]
    Io(#[from] io::Error),
}

type FetchGate = Arc<tokio::sync::Mutex<()>>;

#[derive(Debug)]
pub struct Dispatcher {
    engine: Engine,
    handles: Mutex<HandleTable>,
    fetches: Mutex<HashMap<String, FetchGate>>,
}

impl Dispatcher {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            handles: Mutex::new(HandleTable::new()),
            fetches: Mutex::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn lookup(&self, file_path: &str) -> Result<PathEntry, FsError> {
        let file_path = path::normalize(file_path);
        tracing::debug!("LOOKUP {}", file_path);
        self.entry(file_path)
    }

    pub fn getattr(&self, file_path: &str) -> Result<PathEntry, FsError> {
        let file_path = path::normalize(file_path);
        tracing::debug!("GETATTR {}", file_path);
        self.entry(file_path)
    }

    fn entry(&self, file_path: String) -> Result<PathEntry, FsError> {
        self.engine
            .index()
            .lookup(&file_path)
            .cloned()
            .ok_or(FsError::NotFound(file_path))
    }

    /// Children of a directory from the current index; never waits on the network
    pub fn readdir(&self, dir_path: &str) -> Result<Vec<PathEntry>, FsError> {
        let dir_path = path::normalize(dir_path);
        tracing::debug!("READDIR {}", dir_path);
        let index = self.engine.index();
        match index.lookup(&dir_path) {
            None => Err(FsError::NotFound(dir_path)),
            Some(entry) if !entry.is_dir() => Err(FsError::NotDirectory(dir_path)),
            Some(_) => Ok(index.list(&dir_path).unwrap_or_default()),
        }
    }

    /// Open a file, fetching it first when only the remote holds it
    pub async fn open(&self, file_path: &str) -> Result<FileHandle, FsError> {
        let file_path = path::normalize(file_path);
        tracing::debug!("OPEN {}", file_path);
        {
            let mut index = self.engine.index();
            let entry = index
                .lookup(&file_path)
                .ok_or_else(|| FsError::NotFound(file_path.clone()))?;
            if entry.is_dir() {
                return Err(FsError::IsDirectory(file_path));
            }
            // holding a handle keeps the blob from being evicted once fetched
            index.acquire(&file_path);
        }

        if let Err(e) = self.ensure_resident(&file_path).await {
            self.engine.index().release(&file_path);
            return Err(e);
        }
        Ok(self.handles.lock().open(&file_path, false))
    }

    pub async fn read(&self, fh: FileHandle, offset: u64, size: usize) -> Result<Bytes, FsError> {
        let file_path = self.handle_path(fh)?;
        self.ensure_resident(&file_path).await?;
        let data = self.engine.blobs().read(&file_path, offset, size)?;
        self.engine.index().touch(&file_path);
        Ok(data)
    }

    /// Whole content of a file, opening and releasing a handle around the read
    pub async fn read_file(&self, file_path: &str) -> Result<Bytes, FsError> {
        let fh = self.open(file_path).await?;
        let result = self.read(fh, 0, usize::MAX).await;
        self.release(fh)?;
        result
    }

    /// Write through to the local blob and queue the change
    pub async fn write(&self, fh: FileHandle, offset: u64, data: &[u8]) -> Result<usize, FsError> {
        let file_path = self.handle_path(fh)?;
        tracing::debug!("WRITE {} ({} bytes at {})", file_path, data.len(), offset);

        // partial writes need the current content underneath
        self.ensure_resident(&file_path).await?;
        self.engine.evict();
        let size = self.engine.blobs().write_at(&file_path, offset, data)?;

        {
            let mut index = self.engine.index();
            let generation = index
                .mark_dirty(&file_path, size)
                .ok_or_else(|| FsError::NotFound(file_path.clone()))?;
            let remote_known = Self::remote_known(&index, &file_path);
            self.engine
                .enqueue(&file_path, ChangeOp::Write, generation, remote_known);
        }
        self.handles.lock().mark_wrote(fh);
        Ok(data.len())
    }

    /// Create an empty file and open it
    pub fn create(&self, file_path: &str) -> Result<FileHandle, FsError> {
        let file_path = path::normalize(file_path);
        tracing::debug!("CREATE {}", file_path);
        if file_path == ROOT {
            return Err(FsError::AlreadyExists(file_path));
        }

        {
            let index = self.engine.index();
            Self::check_parent(&index, &file_path)?;
            if index.lookup(&file_path).is_some() {
                return Err(FsError::AlreadyExists(file_path));
            }
        }

        self.engine.evict();
        self.engine.blobs().create(&file_path)?;

        {
            let mut index = self.engine.index();
            let previous = index.entry(&file_path).cloned();
            let mut entry = PathEntry::local_file(&file_path);
            entry.open_handles = 1;
            if let Some(previous) = previous {
                // a tombstone may still be on the remote
                entry.generation = previous.generation + 1;
                entry.object_id = previous.object_id;
            }
            let generation = entry.generation;
            let remote_known = entry.object_id.is_some();
            index.upsert(entry);
            self.engine
                .enqueue(&file_path, ChangeOp::Create, generation, remote_known);
        }

        Ok(self.handles.lock().open(&file_path, true))
    }

    pub fn unlink(&self, file_path: &str) -> Result<(), FsError> {
        let file_path = path::normalize(file_path);
        tracing::debug!("UNLINK {}", file_path);

        let mut index = self.engine.index();
        let entry = index
            .lookup(&file_path)
            .cloned()
            .ok_or_else(|| FsError::NotFound(file_path.clone()))?;
        if entry.is_dir() {
            return Err(FsError::IsDirectory(file_path));
        }

        self.engine.blobs().remove(&file_path)?;
        index.tombstone(&file_path);

        let remote_known = entry.object_id.is_some();
        self.engine
            .enqueue(&file_path, ChangeOp::Delete, entry.generation, remote_known);
        if !remote_known && !self.engine.queue().has_pending(&file_path) {
            // never reached the remote, nothing left to confirm
            index.remove(&file_path);
        }
        Ok(())
    }

    /// Rename a file or a directory, replacing an existing destination file
    pub fn rename(&self, from: &str, to: &str) -> Result<(), FsError> {
        let from = path::normalize(from);
        let to = path::normalize(to);
        tracing::debug!("RENAME {} -> {}", from, to);
        if from == to {
            return Ok(());
        }
        if from == ROOT || to == ROOT || path::is_descendant(&to, &from) {
            return Err(FsError::InvalidPath(to));
        }

        let mut index = self.engine.index();
        let source = index
            .lookup(&from)
            .cloned()
            .ok_or_else(|| FsError::NotFound(from.clone()))?;
        Self::check_parent(&index, &to)?;
        let dest = index.lookup(&to).cloned();

        if source.is_dir() {
            if let Some(dest) = dest {
                if !dest.is_dir() {
                    return Err(FsError::NotDirectory(to));
                }
                if !index.list(&to).unwrap_or_default().is_empty() {
                    return Err(FsError::NotEmpty(to));
                }
                index.remove(&to);
            }
            self.move_directory(&mut index, &from, &to)?;
        } else {
            if dest.as_ref().map(|d| d.is_dir()).unwrap_or(false) {
                return Err(FsError::IsDirectory(to));
            }
            self.move_file(&mut index, &from, &to)?;
        }

        self.handles.lock().rebase(&from, &to);
        Ok(())
    }

    /// Move every entry below a directory, one queued rename per file
    fn move_directory(&self, index: &mut CacheIndex, from: &str, to: &str) -> Result<(), FsError> {
        index.upsert(PathEntry::directory(to));

        let mut old_dirs = vec![from.to_string()];
        for old in index.descendants(from) {
            let new = path::rebase(&old, from, to);
            let is_dir = index.lookup(&old).map(|e| e.is_dir()).unwrap_or(false);
            if is_dir {
                index.upsert(PathEntry::directory(&new));
                old_dirs.push(old);
            } else {
                self.move_file(index, &old, &new)?;
            }
        }

        for dir in old_dirs.iter().rev() {
            index.remove(dir);
        }
        Ok(())
    }

    fn move_file(&self, index: &mut CacheIndex, from: &str, to: &str) -> Result<(), FsError> {
        let source = index
            .lookup(from)
            .cloned()
            .ok_or_else(|| FsError::NotFound(from.to_string()))?;
        let replaced = index.lookup(to).cloned();

        if replaced.is_some() {
            self.engine.blobs().remove(to)?;
        }
        if source.state.is_resident() {
            self.engine.blobs().rename(from, to)?;
        }

        let generation = source
            .generation
            .max(replaced.as_ref().map(|r| r.generation).unwrap_or(0))
            + 1;
        let mut moved = source.clone();
        moved.path = to.to_string();
        moved.generation = generation;
        index.upsert(moved);

        let remote_known = source.object_id.is_some();
        if remote_known {
            index.tombstone(from);
        } else {
            index.remove(from);
        }

        self.engine.enqueue(
            from,
            ChangeOp::Rename { to: to.to_string() },
            generation,
            remote_known,
        );
        if source.state == CacheState::CachedDirty {
            // the remote copy being moved predates the local edits
            if let Some(generation) = index.mark_dirty(to, source.size) {
                let known = remote_known || replaced.and_then(|r| r.object_id).is_some();
                self.engine.enqueue(to, ChangeOp::Write, generation, known);
            }
        }
        Ok(())
    }

    /// Close a handle; queues a write if the handle wrote and nothing is pending
    pub fn release(&self, fh: FileHandle) -> Result<(), FsError> {
        let (file_path, wrote) = self
            .handles
            .lock()
            .close(fh)
            .ok_or(FsError::BadHandle(fh.0))?;
        tracing::debug!("RELEASE {}", file_path);

        let mut index = self.engine.index();
        index.release(&file_path);
        if wrote {
            self.ensure_pending(&index, &file_path);
        }
        Ok(())
    }

    pub fn flush(&self, fh: FileHandle) -> Result<(), FsError> {
        let (file_path, wrote) = self
            .handles
            .lock()
            .state(fh)
            .ok_or(FsError::BadHandle(fh.0))?;
        tracing::debug!("FLUSH {}", file_path);

        if wrote {
            let index = self.engine.index();
            self.ensure_pending(&index, &file_path);
        }
        Ok(())
    }

    /// Queue a write for a dirty entry with nothing outstanding
    fn ensure_pending(&self, index: &CacheIndex, file_path: &str) {
        let Some(entry) = index.lookup(file_path) else {
            return;
        };
        if entry.state != CacheState::CachedDirty || self.engine.queue().has_pending(file_path) {
            return;
        }
        self.engine.enqueue(
            file_path,
            ChangeOp::Write,
            entry.generation,
            entry.object_id.is_some(),
        );
    }

    /// Create a directory; directories exist only in the local index
    pub fn mkdir(&self, dir_path: &str) -> Result<PathEntry, FsError> {
        let dir_path = path::normalize(dir_path);
        tracing::debug!("MKDIR {}", dir_path);

        let mut index = self.engine.index();
        Self::check_parent(&index, &dir_path)?;
        if dir_path == ROOT || index.lookup(&dir_path).is_some() {
            return Err(FsError::AlreadyExists(dir_path));
        }
        let entry = PathEntry::directory(&dir_path);
        index.upsert(entry.clone());
        Ok(entry)
    }

    pub fn rmdir(&self, dir_path: &str) -> Result<(), FsError> {
        let dir_path = path::normalize(dir_path);
        tracing::debug!("RMDIR {}", dir_path);
        if dir_path == ROOT {
            return Err(FsError::InvalidPath(dir_path));
        }

        let mut index = self.engine.index();
        let entry = index
            .lookup(&dir_path)
            .ok_or_else(|| FsError::NotFound(dir_path.clone()))?;
        if !entry.is_dir() {
            return Err(FsError::NotDirectory(dir_path));
        }
        if !index.list(&dir_path).unwrap_or_default().is_empty() {
            return Err(FsError::NotEmpty(dir_path));
        }
        index.remove(&dir_path);
        Ok(())
    }

    /// Resize a file and queue the change
    pub async fn truncate(&self, file_path: &str, size: u64) -> Result<(), FsError> {
        let file_path = path::normalize(file_path);
        tracing::debug!("TRUNCATE {} to {}", file_path, size);

        let entry = self.entry(file_path.clone())?;
        if entry.is_dir() {
            return Err(FsError::IsDirectory(file_path));
        }

        // an in-flight fetch must not land on top of the resized blob
        self.with_fetch_gate(&file_path, async {
            self.engine.index().acquire(&file_path);
            let result = self.resize(&file_path, size).await;
            self.engine.index().release(&file_path);
            result
        })
        .await
    }

    /// Resize under the fetch gate, with the entry pinned against eviction
    async fn resize(&self, file_path: &str, size: u64) -> Result<(), FsError> {
        if size == 0 {
            // nothing of the old content survives, skip the fetch
            self.engine.evict();
            self.engine.blobs().create(file_path)?;
        } else {
            self.fetch(file_path).await?;
            self.engine.evict();
            self.engine.blobs().truncate(file_path, size)?;
        }

        let mut index = self.engine.index();
        let generation = index
            .mark_dirty(file_path, size)
            .ok_or_else(|| FsError::NotFound(file_path.to_string()))?;
        let remote_known = Self::remote_known(&index, file_path);
        self.engine
            .enqueue(file_path, ChangeOp::Write, generation, remote_known);
        Ok(())
    }

    pub fn stats(&self) -> EngineStats {
        self.engine.stats()
    }

    /// Number of open handles
    pub fn open_handles(&self) -> usize {
        self.handles.lock().len()
    }

    fn handle_path(&self, fh: FileHandle) -> Result<String, FsError> {
        self.handles.lock().path(fh).ok_or(FsError::BadHandle(fh.0))
    }

    fn remote_known(index: &CacheIndex, file_path: &str) -> bool {
        index
            .entry(file_path)
            .map(|e| e.object_id.is_some())
            .unwrap_or(false)
    }

    fn check_parent(index: &CacheIndex, file_path: &str) -> Result<(), FsError> {
        let parent = path::parent(file_path);
        match index.lookup(&parent) {
            None => Err(FsError::NotFound(parent)),
            Some(entry) if !entry.is_dir() => Err(FsError::NotDirectory(parent)),
            Some(_) => Ok(()),
        }
    }

    fn fetch_gate(&self, file_path: &str) -> FetchGate {
        self.fetches
            .lock()
            .entry(file_path.to_string())
            .or_default()
            .clone()
    }

    /// Make sure a file's blob is on disk, fetching it if needed
    async fn ensure_resident(&self, file_path: &str) -> Result<(), FsError> {
        {
            let mut index = self.engine.index();
            let entry = index
                .lookup(file_path)
                .ok_or_else(|| FsError::NotFound(file_path.to_string()))?;
            if entry.state.is_resident() {
                index.touch(file_path);
                return Ok(());
            }
        }

        self.with_fetch_gate(file_path, self.fetch(file_path)).await
    }

    /// Run `op` holding the path's fetch gate
    async fn with_fetch_gate<T>(&self, file_path: &str, op: impl Future<Output = T>) -> T {
        let gate = self.fetch_gate(file_path);
        let result = {
            let _turn = gate.lock().await;
            op.await
        };

        let mut fetches = self.fetches.lock();
        if fetches
            .get(file_path)
            .map(|g| Arc::ptr_eq(g, &gate))
            .unwrap_or(false)
        {
            fetches.remove(file_path);
        }
        result
    }

    async fn fetch(&self, file_path: &str) -> Result<(), FsError> {
        let remote = {
            let mut index = self.engine.index();
            let entry = index
                .lookup(file_path)
                .ok_or_else(|| FsError::NotFound(file_path.to_string()))?;
            if entry.state.is_resident() {
                // another caller fetched it while we waited
                index.touch(file_path);
                return Ok(());
            }
            RemoteEntry {
                object_id: entry
                    .object_id
                    .clone()
                    .ok_or_else(|| FsError::NotFound(file_path.to_string()))?,
                size: entry.size,
                modified: entry.modified,
            }
        };

        tracing::debug!("FETCH {}", file_path);
        let data = match self.engine.mirror().fetch_blob(file_path, &remote).await {
            Ok(data) => data,
            Err(MirrorError::NotFound(_)) => {
                // renamed locally, the remote still has it under the old name
                let source = self.engine.queue().rename_source(file_path);
                match source {
                    Some(source) => self.engine.mirror().fetch_blob(&source, &remote).await?,
                    None => return Err(FsError::NotFound(file_path.to_string())),
                }
            }
            Err(e) => return Err(e.into()),
        };

        self.engine.evict();
        self.engine.blobs().stage(file_path, &data)?;

        // the blob is only replaced if nothing touched the entry meanwhile
        let mut index = self.engine.index();
        let wanted = index
            .lookup(file_path)
            .map(|e| e.state == CacheState::RemoteOnly && e.object_id.as_ref() == Some(&remote.object_id))
            .unwrap_or(false);
        if wanted {
            self.engine.blobs().commit_staged(file_path)?;
            index.mark_fetched(file_path, data.len() as u64);
        } else {
            tracing::debug!("{} changed during fetch, discarding", file_path);
            self.engine.blobs().discard_staged(file_path)?;
        }
        Ok(())
    }
}
