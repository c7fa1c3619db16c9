pub use clap::Parser;

use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "gitmount")]
#[command(about = "Mount a remote git repository as a local directory with a bounded disk cache")]
#[command(version)]
pub struct Args {
    /// Directory for the local mirror and cache storage (defaults to ~/.gitmount)
    #[arg(long, global = true, env = "GITMOUNT_DIR")]
    pub git_directory: Option<PathBuf>,

    #[command(subcommand)]
    pub command: crate::Command,
}
