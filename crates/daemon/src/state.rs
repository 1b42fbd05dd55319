use std::time::Duration;
use std::{fs, path::PathBuf};

use serde::{Deserialize, Serialize};

use common::prelude::Account;

use crate::vfs::{CacheTtls, VfsOptions, DEFAULT_ALLOWLIST_ATTRIBUTE};

pub const APP_NAME: &str = "nfsrods";
pub const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub nfs_server: NfsServerConfig,
    #[serde(default)]
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NfsServerConfig {
    /// Port the protocol engine listens on
    #[serde(default = "default_nfs_port")]
    pub port: u16,
    /// Backend collection exposed as the root of the export
    #[serde(default = "default_mount_point")]
    pub backend_mount_point: PathBuf,
    #[serde(default = "default_user_information_refresh")]
    pub user_information_refresh_time_in_milliseconds: u64,
    #[serde(default = "default_short_refresh")]
    pub file_information_refresh_time_in_milliseconds: u64,
    #[serde(default = "default_short_refresh")]
    pub user_access_refresh_time_in_milliseconds: u64,
    #[serde(default = "default_long_refresh")]
    pub object_type_refresh_time_in_milliseconds: u64,
    #[serde(default = "default_long_refresh")]
    pub user_permissions_refresh_time_in_milliseconds: u64,
    #[serde(default = "default_long_refresh")]
    pub user_type_refresh_time_in_milliseconds: u64,
    #[serde(default = "default_list_refresh")]
    pub list_operation_query_results_refresh_time_in_milliseconds: u64,
    #[serde(default = "default_allowlist_refresh")]
    pub allowlist_refresh_time_in_milliseconds: u64,
    #[serde(default = "default_true")]
    pub allow_overwrite_of_existing_files: bool,
}

fn default_nfs_port() -> u16 {
    2049
}

fn default_mount_point() -> PathBuf {
    PathBuf::from("/tempZone/home")
}

fn default_user_information_refresh() -> u64 {
    3_600_000
}

fn default_short_refresh() -> u64 {
    1_000
}

fn default_long_refresh() -> u64 {
    300_000
}

fn default_list_refresh() -> u64 {
    30_000
}

fn default_allowlist_refresh() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

impl Default for NfsServerConfig {
    fn default() -> Self {
        Self {
            port: default_nfs_port(),
            backend_mount_point: default_mount_point(),
            user_information_refresh_time_in_milliseconds: default_user_information_refresh(),
            file_information_refresh_time_in_milliseconds: default_short_refresh(),
            user_access_refresh_time_in_milliseconds: default_short_refresh(),
            object_type_refresh_time_in_milliseconds: default_long_refresh(),
            user_permissions_refresh_time_in_milliseconds: default_long_refresh(),
            user_type_refresh_time_in_milliseconds: default_long_refresh(),
            list_operation_query_results_refresh_time_in_milliseconds: default_list_refresh(),
            allowlist_refresh_time_in_milliseconds: default_allowlist_refresh(),
            allow_overwrite_of_existing_files: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_host")]
    pub host: String,
    #[serde(default = "default_backend_port")]
    pub port: u16,
    #[serde(default = "default_zone")]
    pub zone: String,
    #[serde(default = "default_resource")]
    pub default_resource: String,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_in_seconds: u64,
    /// Account metadata attribute that grants ACL access below a prefix
    #[serde(default = "default_allowlist_attribute")]
    pub allowlist_attribute: String,
    #[serde(default)]
    pub proxy_admin_account: ProxyAdminAccount,
}

fn default_backend_host() -> String {
    "localhost".to_string()
}

fn default_backend_port() -> u16 {
    1247
}

fn default_zone() -> String {
    "tempZone".to_string()
}

fn default_resource() -> String {
    "demoResc".to_string()
}

fn default_connection_timeout() -> u64 {
    600
}

fn default_allowlist_attribute() -> String {
    DEFAULT_ALLOWLIST_ATTRIBUTE.to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: default_backend_host(),
            port: default_backend_port(),
            zone: default_zone(),
            default_resource: default_resource(),
            connection_timeout_in_seconds: default_connection_timeout(),
            allowlist_attribute: default_allowlist_attribute(),
            proxy_admin_account: ProxyAdminAccount::default(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProxyAdminAccount {
    #[serde(default = "default_admin_name")]
    pub username: String,
    #[serde(default = "default_admin_name")]
    pub password: String,
}

fn default_admin_name() -> String {
    "rods".to_string()
}

impl Default for ProxyAdminAccount {
    fn default() -> Self {
        Self {
            username: default_admin_name(),
            password: default_admin_name(),
        }
    }
}

impl std::fmt::Debug for ProxyAdminAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyAdminAccount")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl AppConfig {
    /// Parse and validate a TOML document
    pub fn from_toml(source: &str) -> Result<Self, StateError> {
        let config: AppConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), StateError> {
        if self.backend.connection_timeout_in_seconds == 0 {
            return Err(StateError::InvalidConfig(
                "backend.connection_timeout_in_seconds must be positive".to_string(),
            ));
        }
        let intervals = [
            (
                "nfs_server.user_information_refresh_time_in_milliseconds",
                self.nfs_server.user_information_refresh_time_in_milliseconds,
            ),
            (
                "nfs_server.allowlist_refresh_time_in_milliseconds",
                self.nfs_server.allowlist_refresh_time_in_milliseconds,
            ),
        ];
        if let Some((key, _)) = intervals.iter().find(|(_, millis)| *millis == 0) {
            return Err(StateError::InvalidConfig(format!("{} must be positive", key)));
        }
        let zone_root = PathBuf::from("/").join(&self.backend.zone);
        if !self.nfs_server.backend_mount_point.starts_with(&zone_root) {
            return Err(StateError::InvalidConfig(format!(
                "nfs_server.backend_mount_point {} is outside zone {}",
                self.nfs_server.backend_mount_point.display(),
                self.backend.zone
            )));
        }
        Ok(())
    }

    pub fn cache_ttls(&self) -> CacheTtls {
        let server = &self.nfs_server;
        CacheTtls {
            attributes: Duration::from_millis(server.file_information_refresh_time_in_milliseconds),
            access: Duration::from_millis(server.user_access_refresh_time_in_milliseconds),
            object_type: Duration::from_millis(server.object_type_refresh_time_in_milliseconds),
            permissions: Duration::from_millis(server.user_permissions_refresh_time_in_milliseconds),
            listing: Duration::from_millis(
                server.list_operation_query_results_refresh_time_in_milliseconds,
            ),
            user_type: Duration::from_millis(server.user_type_refresh_time_in_milliseconds),
        }
    }

    pub fn vfs_options(&self) -> VfsOptions {
        VfsOptions {
            mount_point: self.nfs_server.backend_mount_point.clone(),
            zone: self.backend.zone.clone(),
            allow_overwrite: self.nfs_server.allow_overwrite_of_existing_files,
            ttls: self.cache_ttls(),
        }
    }

    /// The proxy admin account, acting as itself
    pub fn admin_account(&self) -> Account {
        let admin = &self.backend.proxy_admin_account;
        Account {
            host: self.backend.host.clone(),
            port: self.backend.port,
            zone: self.backend.zone.clone(),
            default_resource: self.backend.default_resource.clone(),
            proxy_user: admin.username.clone(),
            proxy_password: admin.password.clone(),
            client_user: admin.username.clone(),
            home: PathBuf::from("/").join(&self.backend.zone).join("home"),
        }
    }

    pub fn identity_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.nfs_server.user_information_refresh_time_in_milliseconds)
    }

    pub fn allowlist_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.nfs_server.allowlist_refresh_time_in_milliseconds)
    }
}

#[derive(Debug, Clone)]
pub struct AppState {
    /// Path to the nfsrods directory (~/.nfsrods)
    pub nfsrods_dir: PathBuf,
    /// Path to the config file
    pub config_path: PathBuf,
    /// Loaded configuration
    pub config: AppConfig,
}

impl AppState {
    /// Get the nfsrods directory path (custom or default ~/.nfsrods)
    pub fn nfsrods_dir(custom_path: Option<PathBuf>) -> Result<PathBuf, StateError> {
        if let Some(path) = custom_path {
            return Ok(path);
        }

        let home = dirs::home_dir().ok_or(StateError::NoHomeDirectory)?;
        Ok(home.join(format!(".{}", APP_NAME)))
    }

    /// Initialize a new nfsrods directory holding a config file
    pub fn init(custom_path: Option<PathBuf>, config: Option<AppConfig>) -> Result<Self, StateError> {
        let nfsrods_dir = Self::nfsrods_dir(custom_path)?;
        if nfsrods_dir.join(CONFIG_FILE_NAME).exists() {
            return Err(StateError::AlreadyInitialized);
        }

        let config = config.unwrap_or_default();
        config.validate()?;

        fs::create_dir_all(&nfsrods_dir)?;
        let config_path = nfsrods_dir.join(CONFIG_FILE_NAME);
        fs::write(&config_path, toml::to_string_pretty(&config)?)?;

        Ok(Self {
            nfsrods_dir,
            config_path,
            config,
        })
    }

    /// Load existing state from the nfsrods directory
    pub fn load(custom_path: Option<PathBuf>) -> Result<Self, StateError> {
        let nfsrods_dir = Self::nfsrods_dir(custom_path)?;
        if !nfsrods_dir.exists() {
            return Err(StateError::NotInitialized);
        }

        let config_path = nfsrods_dir.join(CONFIG_FILE_NAME);
        if !config_path.exists() {
            return Err(StateError::MissingFile(CONFIG_FILE_NAME.to_string()));
        }

        let config = AppConfig::from_toml(&fs::read_to_string(&config_path)?)?;
        Ok(Self {
            nfsrods_dir,
            config_path,
            config,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("nfsrods directory not initialized. Run 'nfsrods init' first")]
    NotInitialized,

    #[error("nfsrods directory already initialized")]
    AlreadyInitialized,

    #[error("no home directory found")]
    NoHomeDirectory,

    #[error("missing required file: {0}")]
    MissingFile(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
}
