use std::fmt;

use serde::Serialize;

/// Build metadata captured at compile time
#[derive(Debug, Clone, Serialize)]
pub struct BuildInfo {
    pub version: &'static str,
    pub repo_version: &'static str,
    pub build_profile: &'static str,
    pub build_features: &'static str,
}

pub fn build_info() -> BuildInfo {
    BuildInfo {
        version: env!("CARGO_PKG_VERSION"),
        repo_version: option_env!("REPO_VERSION").unwrap_or("unknown"),
        build_profile: option_env!("BUILD_PROFILE").unwrap_or("unknown"),
        build_features: option_env!("BUILD_FEATURES").unwrap_or("none"),
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gitmount {} ({}, {} build, features: {})",
            self.version, self.repo_version, self.build_profile, self.build_features
        )
    }
}
