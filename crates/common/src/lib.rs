/**
 * Local cache: the index of the virtual tree,
 *  on-disk blobs for resident files, and the
 *  LRU eviction enforcing the disk budget.
 */
pub mod cache;
/**
 * Filesystem-facing operations on top of the
 *  engine. Reads may block on a fetch; everything
 *  else answers from local state.
 */
pub mod dispatcher;
pub mod engine;
/**
 * The remote side: a content mirror trait plus
 *  a git-backed and an in-memory implementation.
 */
pub mod mirror;
pub mod path;
/**
 * Periodic listing refresh and reconciliation
 *  of the remote listing into the index.
 */
pub mod sync;
/**
 * Helper for setting build version information
 *  at compile time.
 */
pub mod version;
/**
 * Background write-back: the per-path change
 *  queue, the job channel and the repository
 *  worker pool.
 */
pub mod writeback;

pub mod prelude {
    pub use crate::cache::{CacheState, EntryKind, PathEntry};
    pub use crate::dispatcher::{Dispatcher, FileHandle, FsError};
    pub use crate::engine::{Engine, EngineConfig, EngineError, EngineStats};
    pub use crate::mirror::{ContentMirror, GitMirror, GitMirrorConfig, MemoryMirror, MirrorError};
    pub use crate::sync::SyncScheduler;
    pub use crate::version::build_info;
    pub use crate::writeback::{RepoLock, WorkerPool};
}
