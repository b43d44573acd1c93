//! Layered configuration loading with figment.
//!
//! Sources, lowest priority first:
//!
//! 1. Built-in defaults
//! 2. Overrides passed to [`ConfigLoader::merge`]
//! 3. `bronze.{profile}.toml`, when `BRONZE_PROFILE` (or
//!    [`ConfigLoader::profile`]) names one
//! 4. `bronze.toml` (or `config.toml`; YAML variants with `yaml-config`)
//! 5. `BRONZE_*` environment variables, `__` separating nested keys:
//!    `BRONZE_PLUGINS__WEATHER__ENABLED=false`
//!
//! Files are searched in the current directory, then in the user config
//! directory (`~/.config/bronze` on Linux). The first directory holding a
//! main file wins.

use std::path::{Path, PathBuf};

use figment::Figment;
#[cfg(any(feature = "yaml-config", feature = "toml-config"))]
use figment::providers::Format;
#[cfg(feature = "toml-config")]
use figment::providers::Toml;
#[cfg(feature = "yaml-config")]
use figment::providers::Yaml;
use figment::providers::{Env, Serialized};
use tracing::{debug, info, warn};

use super::error::{ConfigError, ConfigResult};
use super::schema::BronzeConfig;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "BRONZE_";

/// Environment variable naming the active profile.
pub const PROFILE_ENV: &str = "BRONZE_PROFILE";

/// Main config file names, in search order.
const FILE_NAMES: &[&str] = &[
    #[cfg(feature = "toml-config")]
    "bronze.toml",
    #[cfg(feature = "toml-config")]
    "config.toml",
    #[cfg(feature = "yaml-config")]
    "bronze.yaml",
    #[cfg(feature = "yaml-config")]
    "bronze.yml",
];

/// Configuration loader with figment-based multi-source support.
pub struct ConfigLoader {
    /// Programmatic overrides.
    figment: Figment,
    profile: Option<String>,
    search_paths: Vec<PathBuf>,
    load_env: bool,
    /// Specific config file to load (overrides search).
    config_file: Option<PathBuf>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            figment: Figment::new(),
            profile: std::env::var(PROFILE_ENV).ok().map(|p| p.to_lowercase()),
            search_paths: Vec::new(),
            load_env: true,
            config_file: None,
        }
    }

    /// Selects `bronze.{profile}.toml` as an extra layer under the main file.
    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into().to_lowercase());
        self
    }

    /// Adds a directory to search instead of the defaults.
    pub fn search_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.search_paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Loads exactly this file; a missing file is an error.
    pub fn file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Ignores `BRONZE_*` environment variables.
    pub fn without_env(mut self) -> Self {
        self.load_env = false;
        self
    }

    /// Merges additional configuration programmatically.
    pub fn merge(mut self, config: BronzeConfig) -> Self {
        self.figment = self.figment.merge(Serialized::defaults(config));
        self
    }

    pub fn load(self) -> ConfigResult<BronzeConfig> {
        let profile = self.profile.clone();
        let config: BronzeConfig = self.build_figment()?.extract()?;

        debug!(
            profile = profile.as_deref().unwrap_or("-"),
            logging_level = %config.logging.level,
            plugins = config.plugins.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    fn build_figment(mut self) -> ConfigResult<Figment> {
        let mut figment = Figment::from(Serialized::defaults(BronzeConfig::default()))
            .merge(std::mem::take(&mut self.figment));

        match &self.config_file {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "Loading configuration file");
                figment = merge_config_file(figment, path)?;
            }
            Some(path) => return Err(ConfigError::FileNotFound(path.clone())),
            None => figment = self.search(figment)?,
        }

        if self.load_env {
            figment = figment.merge(Env::prefixed(ENV_PREFIX).ignore(&["profile"]).split("__"));
        }
        Ok(figment)
    }

    /// Merges the profile file and the main file of the first directory
    /// that has a main file.
    fn search(&self, mut figment: Figment) -> ConfigResult<Figment> {
        for dir in self.resolve_search_paths() {
            for name in FILE_NAMES {
                let base = dir.join(name);
                if !base.exists() {
                    continue;
                }
                if let Some(profile) = &self.profile {
                    let profiled = base.with_extension(format!(
                        "{profile}.{}",
                        base.extension().and_then(|e| e.to_str()).unwrap_or_default()
                    ));
                    if profiled.exists() {
                        debug!(path = %profiled.display(), "Loading profile configuration");
                        figment = merge_config_file(figment, &profiled)?;
                    }
                }
                info!(path = %base.display(), "Loading configuration file");
                return merge_config_file(figment, &base);
            }
        }

        warn!("No configuration file found, using defaults");
        Ok(figment)
    }

    fn resolve_search_paths(&self) -> Vec<PathBuf> {
        if !self.search_paths.is_empty() {
            return self.search_paths.clone();
        }
        let mut paths = Vec::new();
        if let Ok(cwd) = std::env::current_dir() {
            paths.push(cwd);
        }
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("bronze"));
        }
        paths
    }
}

/// Merges one file, picking the provider by extension. Only formats enabled
/// through features are accepted.
fn merge_config_file(figment: Figment, path: &Path) -> ConfigResult<Figment> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match ext {
        #[cfg(feature = "toml-config")]
        "toml" => Ok(figment.merge(Toml::file(path))),
        #[cfg(feature = "yaml-config")]
        "yaml" | "yml" => Ok(figment.merge(Yaml::file(path))),
        _ => Err(ConfigError::ParseError(format!(
            "Unsupported or disabled configuration file format: .{ext}"
        ))),
    }
}
