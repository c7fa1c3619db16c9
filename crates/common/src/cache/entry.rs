use serde::{Deserialize, Serialize};

use crate::mirror::{ObjectId, RemoteEntry};
use crate::path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
}

/// Where a path's content currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheState {
    /// Known from the listing, no local blob
    RemoteOnly,
    /// Local blob matches the remote
    CachedClean,
    /// Local blob carries changes the remote has not seen yet
    CachedDirty,
    /// Deleted locally or missing remotely, waiting for reconciliation
    Tombstoned,
}

impl CacheState {
    /// Whether a local blob backs this state
    pub fn is_resident(&self) -> bool {
        matches!(self, CacheState::CachedClean | CacheState::CachedDirty)
    }
}

/// One file or directory in the virtual tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathEntry {
    /// Normalized absolute path
    pub path: String,
    pub kind: EntryKind,
    /// Size in bytes (zero for directories)
    pub size: u64,
    /// Remote object backing the last known remote version, if any
    pub object_id: Option<ObjectId>,
    /// Last modification, unix seconds
    pub modified: i64,
    pub state: CacheState,
    /// Position in the recency order; higher is more recent
    pub recency: u64,
    /// Handles currently open on this path
    pub open_handles: u32,
    /// Bumped on every local content change
    pub generation: u64,
}

impl PathEntry {
    /// A file known only from the remote listing
    pub fn remote(file_path: &str, remote: &RemoteEntry) -> Self {
        Self {
            path: path::normalize(file_path),
            kind: EntryKind::File,
            size: remote.size,
            object_id: Some(remote.object_id.clone()),
            modified: remote.modified,
            state: CacheState::RemoteOnly,
            recency: 0,
            open_handles: 0,
            generation: 0,
        }
    }

    /// A file created locally that the remote has never seen
    pub fn local_file(file_path: &str) -> Self {
        Self {
            path: path::normalize(file_path),
            kind: EntryKind::File,
            size: 0,
            object_id: None,
            modified: chrono::Utc::now().timestamp(),
            state: CacheState::CachedDirty,
            recency: 0,
            open_handles: 0,
            generation: 0,
        }
    }

    pub fn directory(dir_path: &str) -> Self {
        Self {
            path: path::normalize(dir_path),
            kind: EntryKind::Directory,
            size: 0,
            object_id: None,
            modified: chrono::Utc::now().timestamp(),
            state: CacheState::CachedClean,
            recency: 0,
            open_handles: 0,
            generation: 0,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn name(&self) -> String {
        path::file_name(&self.path)
    }

    pub fn segments(&self) -> Vec<String> {
        path::segments(&self.path)
    }

    /// Bytes this entry counts against the cache budget
    pub fn resident_bytes(&self) -> u64 {
        if self.is_file() && self.state.is_resident() {
            self.size
        } else {
            0
        }
    }
}
