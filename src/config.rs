// Host Settings
//
// This module provides the settings file for the vmkeeper host: storage
// locations, registry defaults, cache placement, server and logging options.
// Supports TOML format with environment variable overrides.
// Settings are loaded from the XDG config directory: ~/.config/vmkeeper/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::units::{GB, MB};

/// Name of the storage location used when none is configured.
pub const DEFAULT_LOCATION: &str = "default";

/// Main settings structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// VM storage locations
    pub storage: StorageConfig,

    /// Image registry defaults
    pub registry: RegistryConfig,

    /// Content cache placement
    pub cache: CacheConfig,

    /// HTTP API server
    pub server: ServerConfig,

    /// Lifecycle defaults and timeouts
    pub vm: VmDefaults,

    /// Remote display options
    pub display: DisplayConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// Named storage locations. Each location is a root directory holding VM directories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Name of the location used when a command does not name one
    pub default: String,

    /// Location name -> root directory
    pub locations: BTreeMap<String, String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let mut locations = BTreeMap::new();
        locations.insert(
            DEFAULT_LOCATION.to_string(),
            home_dir().join(".vmkeeper").join("vms").display().to_string(),
        );
        Self {
            default: DEFAULT_LOCATION.to_string(),
            locations,
        }
    }
}

/// Registry configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    /// Registry host (e.g., "ghcr.io")
    pub host: String,

    /// Organization images are resolved under
    pub organization: String,

    /// Talk plain HTTP instead of HTTPS (local registries only)
    pub insecure: bool,

    /// Per-request timeout in seconds for token and manifest calls
    pub timeout_secs: u64,

    /// Upper bound on concurrent blob downloads across all pulls
    pub max_concurrent_downloads: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            host: "ghcr.io".to_string(),
            organization: "vmkeeper".to_string(),
            insecure: false,
            timeout_secs: 30,
            max_concurrent_downloads: 4,
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding cached blobs and the local image index
    pub directory: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: home_dir().join(".vmkeeper").join("cache").display().to_string(),
        }
    }
}

/// HTTP API server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7777,
        }
    }
}

/// Lifecycle defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VmDefaults {
    /// Graceful shutdown bound before `stop` reports a timeout
    pub stop_timeout_secs: u64,

    /// How long a mutating operation waits for another process holding the VM lock
    pub lock_timeout_secs: u64,

    pub cpu_count: u32,

    /// Memory in bytes
    pub memory: u64,

    /// Disk size in bytes
    pub disk_size: u64,

    /// Display resolution, WIDTHxHEIGHT
    pub display: String,
}

impl Default for VmDefaults {
    fn default() -> Self {
        Self {
            stop_timeout_secs: 60,
            lock_timeout_secs: 30,
            cpu_count: 4,
            memory: 8 * GB,
            disk_size: 50 * GB,
            display: "1024x768".to_string(),
        }
    }
}

/// Remote display configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DisplayConfig {
    /// Address the display relay listens on
    pub bind_address: String,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            storage: StorageConfig::default(),
            registry: RegistryConfig::default(),
            cache: CacheConfig::default(),
            server: ServerConfig::default(),
            vm: VmDefaults::default(),
            display: DisplayConfig::default(),
        }
    }
}

fn home_dir() -> PathBuf {
    if let Some(dirs) = directories::BaseDirs::new() {
        dirs.home_dir().to_path_buf()
    } else {
        PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".to_string()))
    }
}

/// Expand a leading `~/` against the user's home directory.
pub fn expand_path(raw: &str) -> PathBuf {
    if raw == "~" {
        return home_dir();
    }
    match raw.strip_prefix("~/") {
        Some(rest) => home_dir().join(rest),
        None => PathBuf::from(raw),
    }
}

impl Settings {
    /// Load settings from the default XDG config directory
    ///
    /// If the file does not exist, returns default settings.
    pub fn load() -> Result<Self> {
        Self::load_from_path(Self::config_path())
    }

    /// Load settings from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed or fails validation.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Settings file not found at {:?}, using defaults", path);
            let settings = Self::default().apply_env_overrides();
            settings.validate()?;
            return Ok(settings);
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file from {:?}", path))?;

        let settings: Settings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse settings file from {:?}", path))?;

        let settings = settings.apply_env_overrides();
        settings.validate()?;

        tracing::debug!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    /// Persist settings, replacing the file atomically.
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.validate()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create settings directory {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize settings")?;
        let tmp = path.with_extension(format!("toml.tmp-{}", uuid::Uuid::new_v4()));
        fs::write(&tmp, content).with_context(|| format!("Failed to write {:?}", tmp))?;
        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(e).with_context(|| format!("Failed to publish settings to {:?}", path));
        }
        Ok(())
    }

    /// Get the default settings file path
    ///
    /// Returns `~/.config/vmkeeper/config.toml` on Linux/Mac
    pub fn config_path() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("dev", "vmkeeper", "vmkeeper") {
            proj_dirs.config_dir().join("config.toml")
        } else {
            home_dir().join(".config").join("vmkeeper").join("config.toml")
        }
    }

    /// Apply environment variable overrides
    ///
    /// Environment variables take precedence over file values:
    /// - VMKEEPER_LOG_LEVEL
    /// - VMKEEPER_LOG_FORMAT
    /// - VMKEEPER_REGISTRY
    /// - VMKEEPER_ORGANIZATION
    /// - VMKEEPER_CACHE_DIR
    /// - VMKEEPER_SERVER_PORT
    /// - VMKEEPER_STOP_TIMEOUT_SECS
    fn apply_env_overrides(mut self) -> Self {
        if let Ok(level) = std::env::var("VMKEEPER_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("VMKEEPER_LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Ok(host) = std::env::var("VMKEEPER_REGISTRY") {
            if !host.is_empty() {
                self.registry.host = host;
            }
        }
        if let Ok(org) = std::env::var("VMKEEPER_ORGANIZATION") {
            if !org.is_empty() {
                self.registry.organization = org;
            }
        }
        if let Ok(dir) = std::env::var("VMKEEPER_CACHE_DIR") {
            if !dir.is_empty() {
                self.cache.directory = dir;
            }
        }
        if let Ok(port) = std::env::var("VMKEEPER_SERVER_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                if port > 0 {
                    self.server.port = port;
                }
            }
        }
        if let Ok(secs) = std::env::var("VMKEEPER_STOP_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse::<u64>() {
                if secs > 0 {
                    self.vm.stop_timeout_secs = secs;
                }
            }
        }

        self
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        if self.storage.locations.is_empty() {
            anyhow::bail!("At least one storage location must be configured");
        }
        if !self.storage.locations.contains_key(&self.storage.default) {
            anyhow::bail!(
                "Default storage location '{}' is not configured",
                self.storage.default
            );
        }
        for (name, path) in &self.storage.locations {
            if name.is_empty() || name.contains('/') {
                anyhow::bail!("Invalid storage location name: '{}'", name);
            }
            if path.is_empty() {
                anyhow::bail!("Storage location '{}' has an empty path", name);
            }
        }

        if self.registry.host.is_empty() {
            anyhow::bail!("Registry host must not be empty");
        }
        if self.registry.organization.is_empty() {
            anyhow::bail!("Registry organization must not be empty");
        }
        if self.registry.timeout_secs == 0 {
            anyhow::bail!("Registry timeout must be > 0");
        }
        if self.registry.max_concurrent_downloads == 0 {
            anyhow::bail!("max_concurrent_downloads must be > 0");
        }
        if self.cache.directory.is_empty() {
            anyhow::bail!("Cache directory must not be empty");
        }
        if self.server.port == 0 {
            anyhow::bail!("Server port must be > 0");
        }
        if self.vm.stop_timeout_secs == 0 {
            anyhow::bail!("Stop timeout must be > 0");
        }
        if self.vm.lock_timeout_secs == 0 {
            anyhow::bail!("Lock timeout must be > 0");
        }
        if self.vm.cpu_count == 0 {
            anyhow::bail!("Default CPU count must be > 0");
        }
        if self.vm.memory < 512 * MB {
            anyhow::bail!("Default memory must be at least 512MB");
        }

        Ok(())
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }

    pub fn cache_dir(&self) -> PathBuf {
        expand_path(&self.cache.directory)
    }

    /// Register a new storage location. The directory is created if missing.
    pub fn add_location(&mut self, name: &str, path: &Path) -> Result<()> {
        if self.storage.locations.contains_key(name) {
            anyhow::bail!("Storage location '{}' already exists", name);
        }
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create storage location {:?}", path))?;
        self.storage
            .locations
            .insert(name.to_string(), path.display().to_string());
        Ok(())
    }

    /// Remove a storage location. The default location cannot be removed.
    /// VM directories under it are left on disk.
    pub fn remove_location(&mut self, name: &str) -> Result<()> {
        if self.storage.default == name {
            anyhow::bail!("Cannot remove the default storage location '{}'", name);
        }
        if self.storage.locations.remove(name).is_none() {
            anyhow::bail!("Storage location '{}' does not exist", name);
        }
        Ok(())
    }

    pub fn set_default_location(&mut self, name: &str) -> Result<()> {
        if !self.storage.locations.contains_key(name) {
            anyhow::bail!("Storage location '{}' does not exist", name);
        }
        self.storage.default = name.to_string();
        Ok(())
    }
}
