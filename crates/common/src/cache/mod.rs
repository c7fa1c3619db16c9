//! Local cache: the index of the virtual tree, the blobs backing resident
//! files, and the eviction policy keeping those blobs within the disk budget.

mod blobs;
mod entry;
mod eviction;
mod index;

pub use blobs::{blob_name, BlobStore};
pub use entry::{CacheState, EntryKind, PathEntry};
pub use eviction::{EvictionManager, EvictionReport};
pub use index::{CacheIndex, SyncSnapshot};
