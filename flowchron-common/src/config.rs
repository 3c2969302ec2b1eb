//! Configuration loading and data root resolution
//!
//! Data root resolution priority:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (`FLOWCHRON_ROOT`)
//! 3. TOML config file (`data_root` key)
//! 4. Compiled default (fallback)
//!
//! A missing or unreadable config file never terminates the process: the
//! resolver logs a warning and falls through to the next tier.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Environment variable overriding the data root
pub const ROOT_ENV_VAR: &str = "FLOWCHRON_ROOT";

/// Environment variable overriding the config file location
pub const CONFIG_ENV_VAR: &str = "FLOWCHRON_CONFIG";

/// Compiled defaults used when nothing else is configured
#[derive(Debug, Clone)]
pub struct CompiledDefaults {
    pub root_folder: PathBuf,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl CompiledDefaults {
    /// Defaults for the current platform
    ///
    /// The data root is relative to the working directory so that a checkout
    /// with a `data/` folder works out of the box.
    pub fn for_current_platform() -> Self {
        Self {
            root_folder: PathBuf::from("data"),
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

/// `[logging]` section of the TOML config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive (overridden by `RUST_LOG`)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Optional log file; logs go to stdout when unset
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

fn default_log_level() -> String {
    CompiledDefaults::for_current_platform().log_level
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let defaults = CompiledDefaults::for_current_platform();
        Self {
            level: defaults.log_level,
            log_file: defaults.log_file,
        }
    }
}

/// Default config file path for a module
///
/// `FLOWCHRON_CONFIG` wins; otherwise `<config dir>/flowchron/<module>.toml`.
pub fn default_config_path(module_name: &str) -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|d| d.join("flowchron").join(format!("{}.toml", module_name)))
}

/// Read and parse a TOML config file
pub fn load_toml_config<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))
}

/// Load a TOML config, falling back to `T::default()` when the file is
/// missing or invalid
pub fn load_toml_config_or_default<T: DeserializeOwned + Default>(path: Option<&Path>) -> T {
    let Some(path) = path else {
        debug!("No config path available, using defaults");
        return T::default();
    };

    if !path.exists() {
        debug!(path = %path.display(), "Config file not found, using defaults");
        return T::default();
    }

    match load_toml_config(path) {
        Ok(config) => config,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Config file unusable, using defaults");
            T::default()
        }
    }
}

/// Write a TOML config file atomically (temp file + rename)
pub fn write_toml_config<T: Serialize>(config: &T, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Resolves the data root following the documented priority order
pub struct RootFolderResolver {
    module_name: String,
    cli_arg: Option<PathBuf>,
    config_path: Option<PathBuf>,
}

impl RootFolderResolver {
    pub fn new(module_name: &str) -> Self {
        Self {
            module_name: module_name.to_string(),
            cli_arg: None,
            config_path: None,
        }
    }

    /// Command-line override (priority 1)
    pub fn with_cli_arg(mut self, path: Option<PathBuf>) -> Self {
        self.cli_arg = path;
        self
    }

    /// Explicit config file instead of the platform default
    pub fn with_config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    pub fn resolve(&self) -> PathBuf {
        if let Some(path) = &self.cli_arg {
            return path.clone();
        }

        if let Ok(path) = std::env::var(ROOT_ENV_VAR) {
            if !path.trim().is_empty() {
                return PathBuf::from(path);
            }
        }

        let config_path = self
            .config_path
            .clone()
            .or_else(|| default_config_path(&self.module_name));
        if let Some(path) = config_path.filter(|p| p.exists()) {
            match load_toml_config::<toml::Value>(&path) {
                Ok(value) => {
                    if let Some(root) = value.get("data_root").and_then(|v| v.as_str()) {
                        return PathBuf::from(root);
                    }
                }
                Err(e) => warn!(error = %e, "Ignoring unreadable config while resolving data root"),
            }
        }

        CompiledDefaults::for_current_platform().root_folder
    }
}

/// Ensures the resolved data root exists
pub struct RootFolderInitializer {
    root_folder: PathBuf,
}

impl RootFolderInitializer {
    pub fn new(root_folder: PathBuf) -> Self {
        Self { root_folder }
    }

    pub fn ensure_directory_exists(&self) -> Result<()> {
        if !self.root_folder.exists() {
            std::fs::create_dir_all(&self.root_folder)?;
            debug!(path = %self.root_folder.display(), "Created data root");
        }
        Ok(())
    }

    pub fn root_folder(&self) -> &Path {
        &self.root_folder
    }

    /// `<root>/chunks`, where per-chunk training artifacts are written
    pub fn chunk_dir(&self) -> PathBuf {
        self.root_folder.join("chunks")
    }
}
