// Adapter modules
pub mod process;
pub mod service_config;
pub mod vfs;

// App state (configuration, paths)
pub mod state;

pub use process::{spawn_service, start_service, ShutdownHandle};
pub use service_config::Config as ServiceConfig;
pub use state::{AppConfig, AppState, StateError};
pub use vfs::{NfsVfs, VfsError};
