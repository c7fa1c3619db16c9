//! Fixed pool of repository workers
//!
//! Every worker pulls jobs off the shared channel. Anything that mutates the
//! mirror (commit, push, pull) runs while holding the pool's repository
//! lock, so at most one such operation is ever in progress. Settling the
//! index after a push and reconciling a pulled listing also happen under
//! the lock; reading local blobs does not.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;

use super::jobs::{Job, JobReceiver};
use crate::engine::Engine;

/// Mutual-exclusion token for repository-mutating work
#[derive(Debug, Clone, Default)]
pub struct RepoLock {
    inner: Arc<Mutex<()>>,
}

impl RepoLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self) -> MutexGuard<'_, ()> {
        self.inner.lock().await
    }

    /// Whether some worker currently holds the lock
    pub fn is_held(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

#[derive(Debug)]
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    lock: RepoLock,
}

impl WorkerPool {
    /// Spawn `engine.config().workers` workers on the current runtime
    pub fn spawn(engine: Engine, receiver: JobReceiver, shutdown: watch::Receiver<()>) -> Self {
        let lock = RepoLock::new();
        let workers = engine.config().workers.max(1);

        let handles = (0..workers)
            .map(|id| {
                let engine = engine.clone();
                let receiver = receiver.clone();
                let lock = lock.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    worker_loop(id, engine, receiver, lock, shutdown).await;
                })
            })
            .collect();

        tracing::info!("started {} repository workers", workers);
        Self { handles, lock }
    }

    pub fn repo_lock(&self) -> &RepoLock {
        &self.lock
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every worker to exit
    pub async fn join(self) {
        for result in join_all(self.handles).await {
            if let Err(e) = result {
                tracing::error!("repository worker panicked: {}", e);
            }
        }
    }

    /// Join handles, for callers that manage shutdown themselves
    pub fn into_handles(self) -> Vec<JoinHandle<()>> {
        self.handles
    }
}

async fn worker_loop(
    id: usize,
    engine: Engine,
    receiver: JobReceiver,
    lock: RepoLock,
    mut shutdown: watch::Receiver<()>,
) {
    tracing::debug!("worker {} started", id);
    loop {
        tokio::select! {
            job = receiver.recv() => {
                let Some(job) = job else {
                    break;
                };
                run_job(id, &engine, &lock, job).await;
            }
            _ = shutdown.changed() => {
                break;
            }
        }
    }
    tracing::debug!("worker {} stopped", id);
}

async fn run_job(id: usize, engine: &Engine, lock: &RepoLock, job: Job) {
    match job {
        Job::ApplyLane { lane } => {
            let Some(change) = engine.begin_change(&lane) else {
                return;
            };
            tracing::debug!("worker {} applying {}", id, change);
            engine.apply_change(&change, lock).await;
            engine.finish_change(&lane);
        }
        Job::SyncListing => {
            tracing::debug!("worker {} refreshing listing", id);
            engine.sync_listing(lock).await;
        }
    }
}
