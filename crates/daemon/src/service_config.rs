use std::path::PathBuf;

use crate::state::AppConfig;

#[derive(Debug, Clone)]
pub struct Config {
    /// Parsed config file
    pub app: AppConfig,

    // logging
    pub log_level: tracing::Level,
    /// Directory for log files (optional, logs to stdout only if not set)
    pub log_dir: Option<PathBuf>,
}
