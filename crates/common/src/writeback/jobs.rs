//! Background job channel for the repository worker pool
//!
//! A lightweight job queue over flume channels. The dispatcher side is
//! cloned into the engine and the sync scheduler; the receiver side is
//! shared by every worker of the pool.

use anyhow::Result;

/// Work the repository workers pick up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    /// Apply the next change of a write-back lane
    ///
    /// A lane has at most one live token at a time; the worker that finishes
    /// a change dispatches the token again while the lane still has work.
    ApplyLane {
        /// Lane key in the write-back queue
        lane: String,
    },

    /// Pull the remote listing and reconcile it into the cache index
    SyncListing,
}

/// Job dispatcher that can be cloned and shared across tasks
#[derive(Debug, Clone)]
pub struct JobDispatcher {
    tx: flume::Sender<Job>,
}

impl JobDispatcher {
    /// Create a new job dispatcher and receiver pair
    ///
    /// Returns a tuple of (dispatcher, receiver). The dispatcher can be cloned
    /// and shared, while the receiver is handed to the worker pool.
    pub fn new() -> (Self, JobReceiver) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, JobReceiver { rx })
    }

    /// Dispatch a job to the worker pool
    ///
    /// This is non-blocking and will succeed unless every receiver has been
    /// dropped.
    pub fn dispatch(&self, job: Job) -> Result<()> {
        tracing::trace!("JOB_DISPATCHER: Dispatching job: {:?}", job);
        self.tx
            .send(job)
            .map_err(|_| anyhow::anyhow!("job receiver has been dropped"))
    }

    /// Dispatch a lane token
    pub fn dispatch_lane(&self, lane: String) -> Result<()> {
        self.dispatch(Job::ApplyLane { lane })
    }

    /// Dispatch a listing refresh
    pub fn dispatch_sync(&self) -> Result<()> {
        self.dispatch(Job::SyncListing)
    }

    /// Jobs waiting for a worker
    pub fn backlog(&self) -> usize {
        self.tx.len()
    }
}

/// Job receiver for the worker pool
///
/// Cloning yields another handle on the same queue; each job is delivered
/// to exactly one handle.
#[derive(Debug, Clone)]
pub struct JobReceiver {
    rx: flume::Receiver<Job>,
}

impl JobReceiver {
    /// Receive the next job
    ///
    /// Returns None when all senders have been dropped (graceful shutdown).
    pub async fn recv(&self) -> Option<Job> {
        self.rx.recv_async().await.ok()
    }

    /// Try to receive a job without waiting
    ///
    /// Returns None if no jobs are available or all senders have been dropped.
    pub fn try_recv(&self) -> Option<Job> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dispatch_and_receive() {
        let (dispatcher, receiver) = JobDispatcher::new();
        dispatcher.dispatch_lane("/a".to_string()).unwrap();
        dispatcher.dispatch_sync().unwrap();
        assert_eq!(dispatcher.backlog(), 2);

        assert_eq!(
            receiver.recv().await,
            Some(Job::ApplyLane {
                lane: "/a".to_string()
            })
        );
        assert_eq!(receiver.try_recv(), Some(Job::SyncListing));
        assert_eq!(receiver.try_recv(), None);
    }

    #[tokio::test]
    async fn test_recv_ends_when_dispatchers_drop() {
        let (dispatcher, receiver) = JobDispatcher::new();
        drop(dispatcher);
        assert_eq!(receiver.recv().await, None);
    }

    #[test]
    fn test_dispatch_fails_without_receiver() {
        let (dispatcher, receiver) = JobDispatcher::new();
        drop(receiver);
        assert!(dispatcher.dispatch_sync().is_err());
    }
}
