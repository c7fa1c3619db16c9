use std::{fs, path::PathBuf};

use serde::{Deserialize, Serialize};

pub const APP_NAME: &str = "gitmount";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const MIRROR_DIR_NAME: &str = "mirror";
pub const BLOBS_DIR_NAME: &str = "blobs";
pub const LOGS_DIR_NAME: &str = "logs";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Disk budget for cached file content, in gigabytes
    #[serde(default = "default_cache_size")]
    pub cache_size_gb: u64,
    /// Minutes between listing refreshes
    #[serde(default = "default_sync_freq")]
    pub sync_freq_minutes: u64,
    /// Size of the repository worker pool
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Write a daily log file under the logs directory
    #[serde(default)]
    pub log_to_file: bool,
}

fn default_cache_size() -> u64 {
    10
}

fn default_sync_freq() -> u64 {
    5
}

fn default_workers() -> usize {
    5
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cache_size_gb: default_cache_size(),
            sync_freq_minutes: default_sync_freq(),
            workers: default_workers(),
            log_to_file: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppState {
    /// Path to the gitmount directory (~/.gitmount)
    pub git_dir: PathBuf,
    /// Local working copy of the remote
    pub mirror_path: PathBuf,
    /// Cached file content
    pub blobs_path: PathBuf,
    pub logs_path: PathBuf,
    pub config_path: PathBuf,
    /// Loaded configuration
    pub config: AppConfig,
}

impl AppState {
    /// Get the gitmount directory path (custom or default ~/.gitmount)
    pub fn git_dir(custom_path: Option<PathBuf>) -> Result<PathBuf, StateError> {
        if let Some(path) = custom_path {
            return Ok(path);
        }

        let home = dirs::home_dir().ok_or(StateError::NoHomeDirectory)?;
        Ok(home.join(format!(".{}", APP_NAME)))
    }

    pub fn exists(custom_path: Option<PathBuf>) -> Result<bool, StateError> {
        let git_dir = Self::git_dir(custom_path)?;
        Ok(git_dir.join(CONFIG_FILE_NAME).exists())
    }

    /// Initialize a new gitmount state directory
    pub fn init(
        custom_path: Option<PathBuf>,
        config: Option<AppConfig>,
    ) -> Result<Self, StateError> {
        let git_dir = Self::git_dir(custom_path)?;
        let config_path = git_dir.join(CONFIG_FILE_NAME);
        if config_path.exists() {
            return Err(StateError::AlreadyInitialized);
        }

        fs::create_dir_all(&git_dir)?;
        let state = Self::paths(git_dir, config.unwrap_or_default());
        fs::create_dir_all(&state.mirror_path)?;
        fs::create_dir_all(&state.blobs_path)?;
        fs::create_dir_all(&state.logs_path)?;

        let config_toml = toml::to_string_pretty(&state.config)?;
        fs::write(&state.config_path, config_toml)?;

        Ok(state)
    }

    /// Load existing state from the gitmount directory
    pub fn load(custom_path: Option<PathBuf>) -> Result<Self, StateError> {
        let git_dir = Self::git_dir(custom_path)?;
        if !git_dir.exists() {
            return Err(StateError::NotInitialized);
        }

        let config_path = git_dir.join(CONFIG_FILE_NAME);
        if !config_path.exists() {
            return Err(StateError::MissingFile(CONFIG_FILE_NAME.to_string()));
        }
        let config_toml = fs::read_to_string(&config_path)?;
        let config: AppConfig = toml::from_str(&config_toml)?;

        let state = Self::paths(git_dir, config);
        // the cache directories are disposable, recreate them if removed
        fs::create_dir_all(&state.mirror_path)?;
        fs::create_dir_all(&state.blobs_path)?;
        Ok(state)
    }

    /// Load the state directory, initializing it with defaults on first use
    pub fn load_or_init(custom_path: Option<PathBuf>) -> Result<Self, StateError> {
        match Self::load(custom_path.clone()) {
            Err(StateError::NotInitialized) => {
                tracing::info!("no gitmount directory yet, initializing one");
                Self::init(custom_path, None)
            }
            other => other,
        }
    }

    fn paths(git_dir: PathBuf, config: AppConfig) -> Self {
        Self {
            mirror_path: git_dir.join(MIRROR_DIR_NAME),
            blobs_path: git_dir.join(BLOBS_DIR_NAME),
            logs_path: git_dir.join(LOGS_DIR_NAME),
            config_path: git_dir.join(CONFIG_FILE_NAME),
            git_dir,
            config,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("gitmount directory not initialized. Run 'gitmount init' first")]
    NotInitialized,

    #[error("gitmount directory already initialized")]
    AlreadyInitialized,

    #[error("no home directory found")]
    NoHomeDirectory,

    #[error("missing required file: {0}")]
    MissingFile(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_then_load() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("state");
        let config = AppConfig {
            cache_size_gb: 2,
            sync_freq_minutes: 1,
            workers: 3,
            log_to_file: true,
        };

        let created = AppState::init(Some(dir.clone()), Some(config.clone())).unwrap();
        assert!(created.blobs_path.is_dir());
        assert!(created.mirror_path.is_dir());

        let loaded = AppState::load(Some(dir.clone())).unwrap();
        assert_eq!(loaded.config, config);
        assert_eq!(loaded.git_dir, dir);

        assert!(matches!(
            AppState::init(Some(dir), None),
            Err(StateError::AlreadyInitialized)
        ));
    }

    #[test]
    fn test_load_missing() {
        let temp = TempDir::new().unwrap();
        assert!(matches!(
            AppState::load(Some(temp.path().join("nope"))),
            Err(StateError::NotInitialized)
        ));
        assert!(matches!(
            AppState::load(Some(temp.path().to_path_buf())),
            Err(StateError::MissingFile(_))
        ));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: AppConfig = toml::from_str("workers = 8\n").unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.cache_size_gb, 10);
        assert_eq!(config.sync_freq_minutes, 5);
        assert!(!config.log_to_file);
    }

    #[test]
    fn test_load_or_init() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("fresh");
        let state = AppState::load_or_init(Some(dir.clone())).unwrap();
        assert_eq!(state.config, AppConfig::default());
        assert!(AppState::exists(Some(dir)).unwrap());
    }
}
