use std::path::PathBuf;

use clap::Args;

use nfsrods::state::{AppConfig, AppState};

#[derive(Args, Debug, Clone)]
pub struct Init {
    /// Backend host
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// Backend port
    #[arg(long, default_value_t = 1247)]
    pub port: u16,

    /// Backend zone
    #[arg(long, default_value = "tempZone")]
    pub zone: String,

    /// Collection exported as the filesystem root (defaults to /<zone>/home)
    #[arg(long)]
    pub mount_point: Option<PathBuf>,

    /// Proxy administrator account name
    #[arg(long, default_value = "rods")]
    pub proxy_user: String,
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("init failed: {0}")]
    StateFailed(#[from] nfsrods::state::StateError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Init {
    type Error = InitError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let mut config = AppConfig::default();
        config.backend.host = self.host.clone();
        config.backend.port = self.port;
        config.backend.zone = self.zone.clone();
        config.backend.proxy_admin_account.username = self.proxy_user.clone();
        config.nfs_server.backend_mount_point = self
            .mount_point
            .clone()
            .unwrap_or_else(|| PathBuf::from("/").join(&self.zone).join("home"));

        let state = AppState::init(ctx.config_path.clone(), Some(config))?;

        let output = format!(
            "Initialized nfsrods directory at: {}\n\
             - Config: {}\n\
             - Backend: {}:{} (zone {})\n\
             - Mount point: {}\n\
             - Proxy account: {}",
            state.nfsrods_dir.display(),
            state.config_path.display(),
            state.config.backend.host,
            state.config.backend.port,
            state.config.backend.zone,
            state.config.nfs_server.backend_mount_point.display(),
            state.config.backend.proxy_admin_account.username,
        );

        Ok(output)
    }
}
