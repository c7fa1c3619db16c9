// Service modules
pub mod process;
pub mod service_config;

// App state (configuration, paths)
pub mod state;

// Kernel bridge
#[cfg(feature = "fuse")]
pub mod fuse;

pub use process::{spawn_service, start_service, MountError, ShutdownHandle};
pub use service_config::Config as ServiceConfig;
pub use state::{AppConfig, AppState, StateError};
