use crate::error::{BgError, Result};
use crate::inference::DevicePreference;
use crate::models::ModelId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ModelsConfig {
    /// Root holding one directory per model plus the shared fetch cache
    #[serde(default = "default_models_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_model")]
    pub default: ModelId,
    #[serde(default)]
    pub device: DevicePreference,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct DownloadConfig {
    /// Repository revision (branch, tag or commit) to fetch artifacts from
    #[serde(default = "default_revision")]
    pub revision: String,
    #[serde(default = "default_true")]
    pub check_disk_space: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ProcessingConfig {
    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
}

// Default value functions
fn default_models_dir() -> PathBuf {
    PathBuf::from("models")
}
const fn default_model() -> ModelId {
    ModelId::Rmbg14
}
fn default_revision() -> String {
    "main".to_string()
}
const fn default_true() -> bool {
    true
}
const fn default_intra_threads() -> usize {
    4
}
fn default_level() -> String {
    "info".to_string()
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            dir: default_models_dir(),
            default: default_model(),
            device: DevicePreference::default(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            revision: default_revision(),
            check_disk_space: default_true(),
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            intra_threads: default_intra_threads(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

impl Config {
    /// Load config from the default location, or defaults if it doesn't exist
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path()?)
    }

    /// Load config from `path`, or defaults if it doesn't exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| BgError::Config(format!("Failed to parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to file atomically (tmp + rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = path.with_extension("tmp");
        let content = toml::to_string_pretty(self)
            .map_err(|e| BgError::Config(format!("Failed to serialize config: {e}")))?;

        fs::write(&tmp_path, content)?;
        fs::rename(&tmp_path, path)?;

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.processing.intra_threads == 0 {
            return Err(BgError::Config(
                "processing.intra_threads must be at least 1".to_string(),
            ));
        }
        if self.download.revision.trim().is_empty() {
            return Err(BgError::Config("download.revision must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Get config file path
pub fn config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| BgError::Config("Could not determine config directory".to_string()))?;
    Ok(config_dir.join("bgstrip").join("config.toml"))
}
