pub mod utils;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use common::prelude::Backend;

use crate::vfs::{AclAllowlist, IdMapper, IdentitySource, NfsVfs};
use crate::ServiceConfig;

const FINAL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle for gracefully shutting down the adapter's background tasks.
pub struct ShutdownHandle {
    graceful_waiter: tokio::task::JoinHandle<()>,
    handles: Vec<tokio::task::JoinHandle<()>>,
    shutdown_tx: watch::Sender<()>,
}

impl ShutdownHandle {
    /// Block until the service shuts down (via signal or explicit shutdown).
    pub async fn wait(self) {
        shutdown_and_join(self.graceful_waiter, self.handles).await;
    }

    /// Trigger shutdown programmatically.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("failed to install signal handlers: {0}")]
    Signals(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] crate::state::StateError),

    #[error("failed to start adapter: {0}")]
    Vfs(#[from] crate::vfs::VfsError),
}

/// Initialize logging, panic handler, and build info reporting.
/// Returns guards that must be kept alive for the duration of the program.
pub fn init_logging(
    service_config: &ServiceConfig,
) -> Vec<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::fmt::format::FmtSpan;

    let mut guards = Vec::new();

    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    guards.push(stdout_guard);

    let stdout_env_filter = EnvFilter::builder()
        .with_default_directive(service_config.log_level.into())
        .from_env_lossy();

    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(stdout_writer)
        .with_filter(stdout_env_filter);

    if let Some(log_dir) = &service_config.log_dir {
        if let Err(e) = std::fs::create_dir_all(log_dir) {
            eprintln!(
                "Warning: Failed to create log directory {:?}: {}",
                log_dir, e
            );
        }

        let file_appender = tracing_appender::rolling::daily(log_dir, "nfsrods.log");
        let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        guards.push(file_guard);

        let file_env_filter = EnvFilter::builder()
            .with_default_directive(service_config.log_level.into())
            .from_env_lossy();

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_span_events(FmtSpan::CLOSE)
            .with_filter(file_env_filter);

        tracing_subscriber::registry()
            .with(stdout_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry().with(stdout_layer).init();
    }

    utils::register_panic_logger();
    utils::report_build_info();

    guards
}

/// Wait for shutdown and join all handles with timeout.
async fn shutdown_and_join(
    graceful_waiter: tokio::task::JoinHandle<()>,
    handles: Vec<tokio::task::JoinHandle<()>>,
) {
    let _ = graceful_waiter.await;

    if timeout(FINAL_SHUTDOWN_TIMEOUT, join_all(handles))
        .await
        .is_err()
    {
        tracing::error!(
            "Failed to shut down within {} seconds",
            FINAL_SHUTDOWN_TIMEOUT.as_secs()
        );
        std::process::exit(4);
    }
}

/// Build the adapter over `backend` and spawn its background tasks.
///
/// The returned [`NfsVfs`] is what the protocol engine drives. The
/// `ShutdownHandle` must be kept alive; dropping it does not stop the tasks.
pub async fn start_service(
    service_config: &ServiceConfig,
    backend: Arc<dyn Backend>,
    identities: Arc<dyn IdentitySource>,
) -> Result<(Arc<NfsVfs>, ShutdownHandle), ServiceError> {
    let config = &service_config.app;
    config.validate()?;
    let (graceful_waiter, shutdown_tx, shutdown_rx) = utils::graceful_shutdown_blocker()?;
    let admin = config.admin_account();

    let ids = Arc::new(IdMapper::new(backend.clone(), identities, admin.clone()));
    let allowlist = Arc::new(AclAllowlist::new(
        backend.clone(),
        admin,
        config.backend.allowlist_attribute.clone(),
    ));
    if let Err(e) = allowlist.refresh().await {
        tracing::warn!(error = %e, "initial allow-list refresh failed");
    }

    let vfs = Arc::new(NfsVfs::new(backend, ids.clone(), allowlist.clone(), config.vfs_options()).await?);

    let handles = vec![
        ids.spawn_purge_task(config.identity_refresh_interval(), shutdown_rx.clone()),
        allowlist.spawn_refresh_task(config.allowlist_refresh_interval(), shutdown_rx),
    ];

    tracing::info!(
        port = config.nfs_server.port,
        mount_point = %config.nfs_server.backend_mount_point.display(),
        backend = %format!("{}:{}", config.backend.host, config.backend.port),
        zone = %config.backend.zone,
        "adapter ready"
    );

    let handle = ShutdownHandle {
        graceful_waiter,
        handles,
        shutdown_tx,
    };
    Ok((vfs, handle))
}

/// Runs the adapter until a shutdown signal is received. Use for CLI binary usage.
pub async fn spawn_service(
    service_config: &ServiceConfig,
    backend: Arc<dyn Backend>,
    identities: Arc<dyn IdentitySource>,
) -> Result<(), ServiceError> {
    let _guards = init_logging(service_config);
    let (_vfs, handle) = match start_service(service_config, backend, identities).await {
        Ok(started) => started,
        Err(e) => {
            tracing::error!("error starting adapter: {}", e);
            return Err(e);
        }
    };
    handle.wait().await;
    Ok(())
}
