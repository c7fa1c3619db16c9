use clap::Args;

use gitmount_daemon::state::{AppConfig, AppState, StateError};

#[derive(Args, Debug, Clone)]
pub struct Init {
    /// Disk budget for cached file content, in gigabytes
    #[arg(long, default_value_t = 10)]
    pub cache_size: u64,

    /// Minutes between listing refreshes
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
    pub sync_freq: u64,

    /// Size of the repository worker pool
    #[arg(long, default_value_t = 5)]
    pub workers: usize,

    /// Also write daily log files under the gitmount directory
    #[arg(long)]
    pub log_to_file: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("init failed: {0}")]
    StateFailed(#[from] StateError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Init {
    type Error = InitError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let config = AppConfig {
            cache_size_gb: self.cache_size,
            sync_freq_minutes: self.sync_freq,
            workers: self.workers,
            log_to_file: self.log_to_file,
        };

        let state = AppState::init(ctx.git_directory.clone(), Some(config))?;

        let output = format!(
            "Initialized gitmount directory at: {}\n\
             - Mirror: {}\n\
             - Blobs: {}\n\
             - Config: {}\n\
             - Cache size: {} GB\n\
             - Sync frequency: {} min\n\
             - Workers: {}",
            state.git_dir.display(),
            state.mirror_path.display(),
            state.blobs_path.display(),
            state.config_path.display(),
            state.config.cache_size_gb,
            state.config.sync_freq_minutes,
            state.config.workers,
        );

        Ok(output)
    }
}
