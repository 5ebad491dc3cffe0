//! Configuration schema for clausewright
//!
//! Config lives at `.config/clausewright/config.yaml` relative to the workspace
//! root. Every key is optional; editors may override any of them through the
//! LSP `initializationOptions`.

use clausewright_core::Conventions;
use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = ".config/clausewright/config.yaml";

/// Root configuration for clausewright
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where template projects keep their files
    pub conventions: Conventions,
    pub validation: ValidationSettings,
    /// External bridge to the model, logic and grammar compilers
    pub toolchain: ToolchainConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSettings {
    /// Upper bound for fetching externally referenced models
    pub dependency_timeout_ms: u64,
    /// Projects kept warm in the cache before the least recently used is dropped
    pub max_projects: usize,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            dependency_timeout_ms: 10_000,
            max_projects: 32,
        }
    }
}

impl ValidationSettings {
    pub fn dependency_timeout(&self) -> Duration {
        Duration::from_millis(self.dependency_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    /// Program answering one JSON request per invocation on stdin/stdout
    pub command: String,
    pub args: Vec<String>,
    /// Hard limit for a single bridge invocation
    pub timeout_ms: u64,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            command: "clausewright-bridge".to_owned(),
            args: Vec::new(),
            timeout_ms: 60_000,
        }
    }
}

impl ToolchainConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Config {
    /// Layer editor-supplied options over this config. Only the keys present
    /// in `options` change.
    pub fn merge_json(&mut self, options: serde_json::Value) -> Result<()> {
        if options.is_null() {
            return Ok(());
        }
        let mut base =
            serde_json::to_value(&*self).wrap_err("Failed to serialize current config")?;
        merge_values(&mut base, options);
        *self = serde_json::from_value(base).wrap_err("Invalid initialization options")?;
        Ok(())
    }
}

fn merge_values(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

pub fn default_config_path(root: &Path) -> PathBuf {
    root.join(DEFAULT_CONFIG_PATH)
}

/// Walk up from `start` looking for a clausewright config, falling back to
/// `start` itself.
pub fn find_workspace_root(start: &Path) -> PathBuf {
    start
        .ancestors()
        .find(|dir| dir.join(DEFAULT_CONFIG_PATH).exists())
        .unwrap_or(start)
        .to_path_buf()
}

pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        eyre::bail!(
            "Config file not found at {}\n\n\
             Create a config file, for example:\n\n\
             validation:\n  \
                 dependency_timeout_ms: 10000\n\
             toolchain:\n  \
                 command: clausewright-bridge",
            path.display()
        );
    }

    let content = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = serde_yaml::from_str(&content)
        .wrap_err_with(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Load config if it exists, otherwise return the defaults.
/// A broken file is reported and ignored so the server still starts.
pub fn load_config_or_default(path: &Path) -> Config {
    if !path.exists() {
        return Config::default();
    }

    match load_config(path) {
        Ok(config) => config,
        Err(e) => {
            warn!("{e:#}, using default configuration");
            Config::default()
        }
    }
}
