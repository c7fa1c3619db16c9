//! Write-back: queued local mutations and the workers that push them
//!
//! Mutating filesystem calls return as soon as the local cache is updated.
//! The change lands in the [`WriteBackQueue`], a lane token goes onto the
//! job channel, and a [`WorkerPool`] worker later commits and pushes it.
//! A failed push drops the change; nothing is retried.

mod change;
pub mod jobs;
mod pool;
mod queue;

pub use change::{ChangeOp, PendingChange};
pub use jobs::{Job, JobDispatcher, JobReceiver};
pub use pool::{RepoLock, WorkerPool};
pub use queue::WriteBackQueue;
