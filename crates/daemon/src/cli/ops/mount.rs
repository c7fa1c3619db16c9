use std::path::PathBuf;

use clap::Args;
use tokio::io::{AsyncBufReadExt, BufReader};

use common::engine::EngineConfig;
use gitmount_daemon::service_config::{self, ConfigError};
use gitmount_daemon::state::{AppState, StateError};
use gitmount_daemon::{spawn_service, ServiceConfig};

/// Environment variable checked for the access token before prompting
pub const TOKEN_ENV: &str = "GITMOUNT_GIT_TOKEN";

#[derive(Args, Debug, Clone)]
pub struct Mount {
    /// Username for the remote
    pub username: String,

    /// Remote repository (e.g. github.com/user/repo.git)
    pub remote: String,

    /// Directory to mount the repository on
    pub mount_point: PathBuf,

    /// Disk budget for cached file content in gigabytes (overrides config)
    #[arg(long)]
    pub cache_size: Option<u64>,

    /// Minutes between listing refreshes (overrides config)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub sync_freq: Option<u64>,

    /// Size of the repository worker pool (overrides config)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Also write daily log files under the gitmount directory
    #[arg(long)]
    pub log_to_file: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("mount failed: {0}")]
    Service(#[from] gitmount_daemon::MountError),
    #[error("could not read token: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Mount {
    type Error = MountError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let state = AppState::load_or_init(ctx.git_directory.clone())?;

        let log_level = self
            .log_level
            .parse::<tracing::Level>()
            .map_err(|_| MountError::InvalidLogLevel(self.log_level.clone()))?;

        let cache_size = self.cache_size.unwrap_or(state.config.cache_size_gb);
        let sync_freq = self.sync_freq.unwrap_or(state.config.sync_freq_minutes);
        let workers = self.workers.unwrap_or(state.config.workers);
        let log_to_file = self.log_to_file || state.config.log_to_file;

        let token = read_token().await?;
        let remote_url = service_config::remote_url(&self.remote, &self.username, &token)?;

        let config = ServiceConfig {
            remote_url,
            mount_point: self.mount_point.clone(),
            mirror_dir: state.mirror_path.clone(),
            blob_dir: state.blobs_path.clone(),
            engine: EngineConfig::from_gigabytes(cache_size, sync_freq, workers),
            log_level,
            log_dir: log_to_file.then(|| state.logs_path.clone()),
        };

        spawn_service(&config).await?;

        Ok(format!("unmounted {}", self.mount_point.display()))
    }
}

/// Token from the environment, else one line from stdin
async fn read_token() -> Result<String, std::io::Error> {
    if let Ok(token) = std::env::var(TOKEN_ENV) {
        return Ok(token);
    }

    eprint!("Token (or set {}): ", TOKEN_ENV);
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await?;
    Ok(line.trim().to_string())
}
