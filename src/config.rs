//! Studio Configuration
//!
//! Configuration can be loaded from:
//! - Default values
//! - Config file (~/.config/scene-studio/config.toml)
//! - Environment variables (`SCENE_STUDIO_CLOUD_ENDPOINT`, `SCENE_STUDIO_DB`)

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub const ENV_CLOUD_ENDPOINT: &str = "SCENE_STUDIO_CLOUD_ENDPOINT";
pub const ENV_LOCAL_DB: &str = "SCENE_STUDIO_DB";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StudioConfig {
    /// On-device SQLite database
    pub local_db_path: PathBuf,

    /// Bundled default content
    pub assets: AssetsConfig,

    /// Cloud document store
    pub cloud: CloudConfig,

    /// Export settings
    pub export: ExportConfig,

    /// Log level for the CLI
    pub log_level: LogLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetsConfig {
    /// JSON list of default scenes
    pub scenes_file: PathBuf,

    /// Directory of default position images
    pub positions_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// `mem://` for an embedded store, `ws://host:port` for a server
    pub endpoint: String,

    pub namespace: String,

    pub database: String,

    pub username: Option<String>,

    pub password: Option<String>,

    /// Follow writes made by other devices
    pub live_queries: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Export directory
    pub output_dir: PathBuf,
}

/// Log levels
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("scene-studio")
}

impl Default for StudioConfig {
    fn default() -> Self {
        Self {
            local_db_path: data_dir().join("local.db"),
            assets: AssetsConfig::default(),
            cloud: CloudConfig::default(),
            export: ExportConfig::default(),
            log_level: LogLevel::Info,
        }
    }
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            scenes_file: PathBuf::from("assets/default_scenes.json"),
            positions_dir: PathBuf::from("assets/positions"),
        }
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            endpoint: "mem://".to_string(),
            namespace: "scene_studio".to_string(),
            database: "content".to_string(),
            username: None,
            password: None,
            live_queries: true,
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));

        Self {
            output_dir: home.join("scene-exports"),
        }
    }
}

impl StudioConfig {
    /// Default config file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("scene-studio/config.toml"))
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }

    /// Load configuration from the default file, falling back to defaults
    pub fn load() -> Self {
        let path = Self::default_path();
        let config = match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                if path.exists() {
                    log::warn!("Ignoring unreadable config {}: {:#}", path.display(), e);
                }
                Self::default()
            }
        };
        config.with_env_overrides()
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Apply environment variable overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(endpoint) = std::env::var(ENV_CLOUD_ENDPOINT) {
            if !endpoint.is_empty() {
                self.cloud.endpoint = endpoint;
            }
        }
        if let Ok(db) = std::env::var(ENV_LOCAL_DB) {
            if !db.is_empty() {
                self.local_db_path = PathBuf::from(db);
            }
        }
        self
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Write the configuration as TOML, creating parent directories
    pub fn save_to(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = self.to_toml()?;
        std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
    }
}
