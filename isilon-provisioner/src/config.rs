//! Configuration management for the Isilon provisioner
//!
//! Settings are resolved from:
//! 1. Environment variables (highest priority, `ISI_*` names)
//! 2. Configuration file (TOML format)
//! 3. Default values (lowest priority)

use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Provisioner name the controller matches storage classes against
pub const DEFAULT_PROVISIONER_NAME: &str = "example.com/isilon";

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    /// Appliance connection settings
    pub isilon: IsilonConfig,
    /// Provisioning behaviour
    pub provisioner: ProvisionerSettings,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Appliance connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IsilonConfig {
    /// Appliance address, also published as the NFS server
    pub server: String,
    /// Platform API port
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Group that owns newly created volumes
    pub group: Option<String>,
    /// Directory under `/ifs` that holds every provisioned volume
    pub export_root: String,
    /// Accept self-signed appliance certificates
    pub insecure: bool,
    /// Per-request timeout
    pub timeout_secs: u64,
}

/// Provisioning behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerSettings {
    /// Provisioner name
    pub name: String,
    /// Identity stamped on every volume we create; defaults to the server name
    pub identity: Option<String>,
    /// Apply a hard quota equal to the requested capacity
    pub quota_enabled: bool,
    /// Where the export root is mounted locally, if not at the same path
    pub mount_root: Option<PathBuf>,
}

impl Default for IsilonConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: 8080,
            user: String::new(),
            password: String::new(),
            group: None,
            export_root: String::new(),
            insecure: true,
            timeout_secs: 30,
        }
    }
}

impl Default for ProvisionerSettings {
    fn default() -> Self {
        Self {
            name: DEFAULT_PROVISIONER_NAME.to_string(),
            identity: None,
            quota_enabled: false,
            mount_root: None,
        }
    }
}

impl IsilonConfig {
    /// Platform API base URL
    pub fn endpoint(&self) -> String {
        format!("https://{}:{}", self.server, self.port)
    }
}

impl ProvisionerConfig {
    /// Load configuration from the environment and an optional config file
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::find_config_file() {
            Some(path) => Self::load_from_file(&path)?,
            None => Self::default(),
        };

        config.apply_env_overrides();

        Ok(config)
    }

    /// Load configuration from a specific file path
    pub fn load_from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.clone(), e.to_string()))?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let paths = [
            std::env::var("ISI_PROVISIONER_CONFIG").ok().map(PathBuf::from),
            Some(PathBuf::from("/etc/isilon-provisioner/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        paths.into_iter().flatten().find(|p| p.exists())
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable source
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.is_empty());

        // Appliance
        if let Some(server) = var("ISI_SERVER") {
            self.isilon.server = server;
        }
        if let Some(port) = var("ISI_PORT") {
            if let Ok(port) = port.parse() {
                self.isilon.port = port;
            }
        }
        if let Some(path) = var("ISI_PATH") {
            self.isilon.export_root = path;
        }
        if let Some(user) = var("ISI_USER") {
            self.isilon.user = user;
        }
        if let Some(pass) = var("ISI_PASS") {
            self.isilon.password = pass;
        }
        if let Some(group) = var("ISI_GROUP") {
            self.isilon.group = Some(group);
        }
        if let Some(insecure) = var("ISI_INSECURE") {
            self.isilon.insecure = insecure.parse().unwrap_or(true);
        }

        // Provisioner; any non-empty value turns quotas on
        if var("ISI_QUOTA_ENABLE").is_some() {
            self.provisioner.quota_enabled = true;
        }
        if let Some(identity) = var("ISI_IDENTITY") {
            self.provisioner.identity = Some(identity);
        }
        if let Some(root) = var("ISI_MOUNT_ROOT") {
            self.provisioner.mount_root = Some(PathBuf::from(root));
        }

        // Logging
        if let Some(level) = var("ISI_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(dir) = var("ISI_LOG_DIR") {
            self.logging.file_path = Some(dir);
        }
    }

    /// Identity of this provisioner instance
    pub fn identity(&self) -> String {
        self.provisioner
            .identity
            .clone()
            .filter(|i| !i.is_empty())
            .unwrap_or_else(|| self.isilon.server.clone())
    }

    /// Local directory the export root is reachable under
    pub fn mount_root(&self) -> PathBuf {
        self.provisioner
            .mount_root
            .clone()
            .unwrap_or_else(|| PathBuf::from(&self.isilon.export_root))
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        let mut config = Self::default();
        config.isilon.server = "isilon.example.com".to_string();
        config.isilon.user = "admin".to_string();
        config.isilon.export_root = "/ifs/kubernetes".to_string();
        toml::to_string_pretty(&config).unwrap_or_default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.isilon.server.is_empty() {
            return Err(ConfigError::Validation("ISI_SERVER not set".to_string()));
        }
        if self.isilon.export_root.is_empty() {
            return Err(ConfigError::Validation("ISI_PATH not set".to_string()));
        }
        if !self.isilon.export_root.starts_with('/') {
            return Err(ConfigError::Validation(format!(
                "Export root must be an absolute path: {}",
                self.isilon.export_root
            )));
        }
        if self.isilon.user.is_empty() {
            return Err(ConfigError::Validation("ISI_USER not set".to_string()));
        }
        if self.isilon.password.is_empty() {
            return Err(ConfigError::Validation("ISI_PASS not set".to_string()));
        }
        if self.isilon.port == 0 {
            return Err(ConfigError::Validation("Port cannot be 0".to_string()));
        }

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0:?}: {1}")]
    FileRead(PathBuf, String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Config validation failed: {0}")]
    Validation(String),
}
