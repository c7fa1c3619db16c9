//! Shared test utilities for engine integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use common::dispatcher::Dispatcher;
use common::engine::{Engine, EngineConfig};
use common::mirror::MemoryMirror;
use common::writeback::{JobReceiver, WorkerPool};
use tempfile::TempDir;
use tokio::sync::watch;

pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TestEnv {
    pub dispatcher: Arc<Dispatcher>,
    pub engine: Engine,
    pub mirror: MemoryMirror,
    /// Held until `start_pool`, so dispatched lane tokens have somewhere to go
    receiver: Option<JobReceiver>,
    pool: Option<WorkerPool>,
    shutdown_tx: watch::Sender<()>,
    _temp: TempDir,
}

impl TestEnv {
    /// Start the worker pool; changes queued so far start draining
    pub fn start_pool(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            let pool = WorkerPool::spawn(
                self.engine.clone(),
                receiver,
                self.shutdown_tx.subscribe(),
            );
            self.pool = Some(pool);
        }
    }

    /// Wait for the write-back queue to empty, failing the test on timeout
    pub async fn drain(&self) {
        assert!(
            self.engine.wait_for_drain(DRAIN_TIMEOUT).await,
            "write-back queue did not drain"
        );
    }

    pub async fn write_file(&self, path: &str, data: &[u8]) {
        let fh = match self.dispatcher.create(path) {
            Ok(fh) => fh,
            Err(_) => self.dispatcher.open(path).await.unwrap(),
        };
        self.dispatcher.truncate(path, 0).await.unwrap();
        self.dispatcher.write(fh, 0, data).await.unwrap();
        self.dispatcher.release(fh).unwrap();
    }

    pub async fn read_string(&self, path: &str) -> String {
        let data = self.dispatcher.read_file(path).await.unwrap();
        String::from_utf8(data.to_vec()).unwrap()
    }

    pub fn names(&self, dir: &str) -> Vec<String> {
        self.dispatcher
            .readdir(dir)
            .unwrap()
            .into_iter()
            .map(|e| e.name())
            .collect()
    }

    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(pool) = self.pool.take() {
            pool.join().await;
        }
    }
}

pub fn config(budget_bytes: u64, workers: usize) -> EngineConfig {
    EngineConfig {
        cache_budget_bytes: budget_bytes,
        sync_interval: Duration::from_secs(300),
        workers,
    }
}

/// Set up an engine over `mirror` and load its listing, without workers
pub async fn setup_with(mirror: MemoryMirror, config: EngineConfig) -> TestEnv {
    let temp = TempDir::new().unwrap();
    let (engine, receiver) =
        Engine::new(config, Arc::new(mirror.clone()), temp.path().join("blobs")).unwrap();
    engine.restore().await.unwrap();
    let (shutdown_tx, _) = watch::channel(());

    TestEnv {
        dispatcher: Arc::new(Dispatcher::new(engine.clone())),
        engine,
        mirror,
        receiver: Some(receiver),
        pool: None,
        shutdown_tx,
        _temp: temp,
    }
}

/// Set up an engine over an empty remote
pub async fn setup(config: EngineConfig) -> TestEnv {
    setup_with(MemoryMirror::new(), config).await
}
