pub mod utils;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use common::dispatcher::Dispatcher;
use common::engine::{Engine, EngineError};
use common::mirror::{GitMirror, GitMirrorConfig, MirrorError};
use common::sync::SyncScheduler;
use common::writeback::WorkerPool;

use crate::service_config::redact;
use crate::ServiceConfig;

const FINAL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// How long shutdown waits for queued changes to reach the remote
const DRAIN_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("repository error: {0}")]
    Mirror(#[from] MirrorError),

    #[error("failed to restore cache: {0}")]
    Engine(#[from] EngineError),

    #[error("failed to mount at {path:?}: {source}")]
    Mount {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Handle for gracefully shutting down a running mount.
pub struct ShutdownHandle {
    graceful_waiter: tokio::task::JoinHandle<()>,
    engine: Engine,
    pool: WorkerPool,
    scheduler: SyncScheduler,
    /// Stops the workers once the queue has drained
    worker_tx: watch::Sender<()>,
    shutdown_tx: watch::Sender<()>,
    #[cfg(feature = "fuse")]
    session: fuser::BackgroundSession,
}

impl ShutdownHandle {
    /// Block until shutdown is signalled, then unmount, drain and join.
    pub async fn wait(self) {
        let _ = self.graceful_waiter.await;

        #[cfg(feature = "fuse")]
        drop(self.session);

        tracing::info!(
            pending = self.engine.stats().pending_changes,
            "draining write-back queue"
        );
        if !self.engine.wait_for_drain(DRAIN_TIMEOUT).await {
            tracing::warn!(
                pending = self.engine.stats().pending_changes,
                "write-back queue did not drain within {} seconds, local changes remain cached",
                DRAIN_TIMEOUT.as_secs()
            );
        }
        let _ = self.worker_tx.send(());

        let mut handles = self.pool.into_handles();
        handles.push(self.scheduler.into_handle());
        if timeout(FINAL_SHUTDOWN_TIMEOUT, join_all(handles))
            .await
            .is_err()
        {
            tracing::error!(
                "Failed to shut down within {} seconds",
                FINAL_SHUTDOWN_TIMEOUT.as_secs()
            );
            std::process::exit(4);
        }
        tracing::info!("gitmount stopped");
    }

    /// Trigger shutdown programmatically.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Initialize logging, panic handler, and build info reporting.
/// Returns guards that must be kept alive for the duration of the program.
fn init_logging(
    service_config: &ServiceConfig,
) -> Vec<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::fmt::format::FmtSpan;

    let mut guards = Vec::new();

    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    guards.push(stdout_guard);

    let stdout_env_filter = EnvFilter::builder()
        .with_default_directive(service_config.log_level.into())
        .from_env_lossy();

    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(stdout_writer)
        .with_filter(stdout_env_filter);

    if let Some(log_dir) = &service_config.log_dir {
        if let Err(e) = std::fs::create_dir_all(log_dir) {
            eprintln!(
                "Warning: Failed to create log directory {:?}: {}",
                log_dir, e
            );
        }

        let file_appender = tracing_appender::rolling::daily(log_dir, "gitmount.log");
        let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        guards.push(file_guard);

        let file_env_filter = EnvFilter::builder()
            .with_default_directive(service_config.log_level.into())
            .from_env_lossy();

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_span_events(FmtSpan::CLOSE)
            .with_filter(file_env_filter);

        tracing_subscriber::registry()
            .with(stdout_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry().with(stdout_layer).init();
    }

    utils::register_panic_logger();
    utils::report_build_info();

    guards
}

/// Open the mirror, restore the cache, start workers and scheduler, and mount.
///
/// The returned `ShutdownHandle` must be kept alive; dropping it unmounts
/// without draining.
pub async fn start_service(
    service_config: &ServiceConfig,
) -> Result<(Engine, ShutdownHandle), MountError> {
    let (graceful_waiter, shutdown_tx, shutdown_rx) = utils::graceful_shutdown_blocker()?;

    tracing::info!(
        "opening mirror of {} in {:?}",
        redact(&service_config.remote_url),
        service_config.mirror_dir
    );
    let mirror = GitMirror::open(GitMirrorConfig::new(
        &service_config.mirror_dir,
        service_config.remote_url.clone(),
    ))
    .await?;

    let (engine, receiver) = Engine::new(
        service_config.engine.clone(),
        Arc::new(mirror),
        &service_config.blob_dir,
    )?;
    let report = engine.restore().await?;
    if !report.orphaned.is_empty() {
        tracing::warn!(
            "{} cached blobs have no remote counterpart and were left on disk",
            report.orphaned.len()
        );
    }

    let (worker_tx, worker_rx) = watch::channel(());
    let pool = WorkerPool::spawn(engine.clone(), receiver, worker_rx);
    let scheduler = SyncScheduler::spawn(
        engine.clone(),
        service_config.engine.sync_interval,
        shutdown_rx,
    );

    let dispatcher = Arc::new(Dispatcher::new(engine.clone()));

    #[cfg(feature = "fuse")]
    let session = crate::fuse::mount(dispatcher, &service_config.mount_point).map_err(
        |source| MountError::Mount {
            path: service_config.mount_point.clone(),
            source,
        },
    )?;

    #[cfg(not(feature = "fuse"))]
    {
        drop(dispatcher);
        tracing::warn!("built without FUSE support, running without a mount");
    }

    tracing::info!(
        workers = pool.size(),
        budget_bytes = service_config.engine.cache_budget_bytes,
        "Running: {} mounted at {:?}",
        redact(&service_config.remote_url),
        service_config.mount_point
    );

    let handle = ShutdownHandle {
        graceful_waiter,
        engine: engine.clone(),
        pool,
        scheduler,
        worker_tx,
        shutdown_tx,
        #[cfg(feature = "fuse")]
        session,
    };

    Ok((engine, handle))
}

/// Mount and serve until a shutdown signal is received.
pub async fn spawn_service(service_config: &ServiceConfig) -> Result<(), MountError> {
    let _guards = init_logging(service_config);
    let (_, handle) = match start_service(service_config).await {
        Ok(started) => started,
        Err(e) => {
            tracing::error!("failed to start: {}", e);
            return Err(e);
        }
    };
    handle.wait().await;
    Ok(())
}
