use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::engine::{Engine, EngineConfig};

/// Timer that periodically asks the worker pool for a listing refresh
#[derive(Debug)]
pub struct SyncScheduler {
    handle: JoinHandle<()>,
}

impl SyncScheduler {
    /// Start ticking every `period`, first tick one period from now
    ///
    /// A zero period falls back to the default refresh interval.
    pub fn spawn(engine: Engine, period: Duration, mut shutdown: watch::Receiver<()>) -> Self {
        let period = if period.is_zero() {
            let fallback = EngineConfig::default().sync_interval;
            tracing::warn!(
                "sync period of zero is invalid, refreshing every {}s instead",
                fallback.as_secs()
            );
            fallback
        } else {
            period
        };

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!("listing refresh every {}s", period.as_secs());

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !engine.request_sync() {
                            tracing::debug!("refresh still outstanding, skipping tick");
                        }
                    }
                    _ = shutdown.changed() => {
                        break;
                    }
                }
            }
            tracing::debug!("sync scheduler stopped");
        });

        Self { handle }
    }

    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            tracing::error!("sync scheduler panicked: {}", e);
        }
    }

    pub fn into_handle(self) -> JoinHandle<()> {
        self.handle
    }
}
