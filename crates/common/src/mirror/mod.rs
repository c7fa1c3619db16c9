//! Content mirror: the engine's view of the remote repository
//!
//! A mirror owns the local working copy of the remote and exposes the few
//! primitives the engine needs: pull the authoritative listing, fetch one
//! file's bytes, and commit+push a write, delete or rename of one file.
//!
//! Fetches are safe to run concurrently. Push-style operations mutate the
//! shared working copy and are only ever called while the worker pool holds
//! the repository lock.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

mod git;
mod memory;

pub use git::{GitMirror, GitMirrorConfig};
pub use memory::MemoryMirror;

/// Remote object reference for a file's content
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the remote knows about one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// Content identifier of the current version
    pub object_id: ObjectId,
    /// Size in bytes
    pub size: u64,
    /// Last modification, unix seconds
    pub modified: i64,
}

/// The authoritative file listing: normalized path → remote entry
pub type Listing = BTreeMap<String, RemoteEntry>;

#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("{command} failed with status {status}: {stderr}")]
    Command {
        command: String,
        status: i32,
        stderr: String,
    },
    #[error("authentication rejected by remote: {0}")]
    Auth(String),
    #[error("remote object not found: {0}")]
    NotFound(String),
    #[error("remote unavailable: {0}")]
    Unavailable(String),
    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("mirror i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ContentMirror: Send + Sync + fmt::Debug + 'static {
    /// Pull the latest remote state into the mirror and return the listing
    async fn pull_listing(&self) -> Result<Listing, MirrorError>;

    /// Fetch the content of one file at the given remote version
    ///
    /// Does not mutate shared working-copy state and may run concurrently
    /// with any other mirror call.
    async fn fetch_blob(&self, path: &str, entry: &RemoteEntry) -> Result<Bytes, MirrorError>;

    /// Commit and push new content for a path, creating it if needed
    async fn push_file(&self, path: &str, data: Bytes) -> Result<RemoteEntry, MirrorError>;

    /// Commit and push the removal of a path
    async fn remove_file(&self, path: &str) -> Result<(), MirrorError>;

    /// Move a path on the remote, replacing any existing destination
    async fn rename_file(&self, from: &str, to: &str) -> Result<RemoteEntry, MirrorError>;
}
