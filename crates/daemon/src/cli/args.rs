pub use clap::Parser;

use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "nfsrods")]
#[command(about = "Expose a remote object store through a handle-based filesystem protocol")]
pub struct Args {
    /// Path to the nfsrods config directory (defaults to ~/.nfsrods)
    #[arg(long, global = true)]
    pub config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: crate::Command,
}
