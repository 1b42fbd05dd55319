use std::path::Path;
use std::sync::Arc;

use clap::Args;

use common::prelude::{BackendError, MemoryBackend};
use nfsrods::state::AppState;
use nfsrods::vfs::SystemIdentitySource;
use nfsrods::{spawn_service, ServiceConfig};

#[derive(Args, Debug, Clone)]
pub struct Daemon {
    /// Directory for log files (logs to stdout only if not set)
    #[arg(long)]
    pub log_dir: Option<std::path::PathBuf>,

    /// Default log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    pub log_level: tracing::Level,
}

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("state error: {0}")]
    StateError(#[from] nfsrods::state::StateError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("daemon failed: {0}")]
    Failed(#[from] nfsrods::process::ServiceError),
}

/// Create every missing collection on the way to `path`
fn seed_collection_chain(backend: &MemoryBackend, path: &Path, owner: &str) -> Result<(), BackendError> {
    let mut ancestors: Vec<&Path> = path.ancestors().collect();
    ancestors.reverse();
    for collection in ancestors.into_iter().skip(1) {
        match backend.add_collection(collection, owner) {
            Ok(()) | Err(BackendError::AlreadyExists(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Daemon {
    type Error = DaemonError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let state = AppState::load(ctx.config_path.clone())?;
        let config = ServiceConfig {
            app: state.config.clone(),
            log_level: self.log_level,
            log_dir: self.log_dir.clone(),
        };

        // the wire client for the remote store lives outside this crate;
        // the daemon runs against the in-memory store
        let admin = state.config.backend.proxy_admin_account.username.clone();
        let backend = MemoryBackend::new(&state.config.backend.zone, &admin);
        seed_collection_chain(&backend, &state.config.nfs_server.backend_mount_point, &admin)?;

        spawn_service(&config, Arc::new(backend), Arc::new(SystemIdentitySource)).await?;
        Ok("daemon ended".to_string())
    }
}
