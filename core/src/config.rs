//! Configuration types for infer-bridge.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::bridge::NotifierMode;

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Background execution configuration.
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Engine instance configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Reference engine tuning.
    #[serde(default)]
    pub reference: ReferenceConfig,
}

/// Background execution configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Number of worker threads running background tasks.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Default lifetime of completion notifier registrations.
    #[serde(default)]
    pub notifier_mode: NotifierMode,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            notifier_mode: NotifierMode::default(),
        }
    }
}

/// Engine instance configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Device models are compiled for when none is given.
    #[serde(default = "default_device")]
    pub device: String,

    /// Device extensions are registered against.
    #[serde(default = "default_device")]
    pub extension_device: String,

    /// Extension libraries registered at start-up.
    #[serde(default)]
    pub extensions: Vec<PathBuf>,

    /// Per-device configuration files.
    #[serde(default)]
    pub device_configs: BTreeMap<String, PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            extension_device: default_device(),
            extensions: Vec::new(),
            device_configs: BTreeMap::new(),
        }
    }
}

/// Reference engine configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReferenceConfig {
    /// Simulated latency of every inference run, in milliseconds.
    #[serde(default)]
    pub latency_ms: u64,
}

impl ReferenceConfig {
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }
}

fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_device() -> String {
    "CPU".to_string()
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<std::path::Path>) -> crate::error::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(crate::error::BridgeError::FileNotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml_str(yaml: &str) -> crate::error::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> crate::error::Result<()> {
        if self.bridge.worker_threads == 0 {
            return Err(crate::error::BridgeError::config(
                "bridge.worker_threads must be at least 1",
            ));
        }
        if self.engine.device.trim().is_empty() {
            return Err(crate::error::BridgeError::config("engine.device must not be empty"));
        }
        Ok(())
    }
}
