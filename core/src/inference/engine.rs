//! Engine instance: the entry point of the handle pipeline.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::info;

use super::executable::ExecutableModel;
use super::model::ParsedModel;
use crate::bridge::{BackgroundTask, Host, Promise};
use crate::config::EngineConfig;
use crate::error::{BridgeError, Result};
use crate::native::{
    guard, DeviceConfig, ModelSource, NativeCore, NativeExecutable, NativeModel, Version,
    KEY_CONFIG_FILE,
};

/// State shared between an engine instance, everything compiled by it, and
/// the background tasks working on its behalf.
pub(crate) struct EngineShared {
    pub(crate) native: Arc<dyn NativeCore>,
    device_configs: Mutex<BTreeMap<String, DeviceConfig>>,
}

impl EngineShared {
    fn device_config(&self, device: &str) -> DeviceConfig {
        self.device_configs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device)
            .cloned()
            .unwrap_or_default()
    }
}

/// A native engine bound to a host.
///
/// ```ignore
/// let host = Host::new(&BridgeConfig::default())?;
/// let engine = EngineInstance::new(&host, Arc::new(ReferenceCore::new()));
///
/// let model = host.block_on(engine.parse_model(ModelSource::Files {
///     model: "classifier.yaml".into(),
///     weights: "classifier.bin".into(),
/// }))?;
/// let executable = host.block_on(engine.compile(&model, "CPU"))?;
/// let request = executable.create_inference_request()?;
/// request.infer()?;
/// let output = request.get_result_buffer("output")?;
/// ```
pub struct EngineInstance {
    host: Host,
    shared: Arc<EngineShared>,
    extension_device: RefCell<String>,
}

impl EngineInstance {
    pub fn new(host: &Host, native: Arc<dyn NativeCore>) -> Self {
        Self {
            host: host.clone(),
            shared: Arc::new(EngineShared {
                native,
                device_configs: Mutex::new(BTreeMap::new()),
            }),
            extension_device: RefCell::new("CPU".to_string()),
        }
    }

    /// Create an instance and apply `config` to it.
    pub fn from_config(
        host: &Host,
        native: Arc<dyn NativeCore>,
        config: &EngineConfig,
    ) -> Result<Self> {
        let engine = Self::new(host, native);
        engine.apply_config(config)?;
        Ok(engine)
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Plugin versions for `device`.
    pub fn enumerate_versions(&self, device: &str) -> Result<BTreeMap<String, Version>> {
        guard::call("versions", || self.shared.native.versions(device))
    }

    /// Parse a model on a worker thread.
    ///
    /// Missing inputs reject the returned promise before anything is
    /// scheduled.
    pub fn parse_model(&self, source: ModelSource) -> Promise<ParsedModel> {
        if let Err(err) = validate_source(&source) {
            return Promise::rejected(err);
        }
        let host_id = self.host.id();
        self.host.submit(
            ParseTask {
                native: Arc::clone(&self.shared.native),
                source,
            },
            move |_, handle| Ok(ParsedModel::new(host_id, handle)),
        )
    }

    /// Register an extension library for the extension device.
    pub fn register_extension(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(BridgeError::invalid_argument("Invalid argument"));
        }
        let device = self.extension_device.borrow().clone();
        guard::call("add_extension", || {
            self.shared.native.add_extension(path, &device)
        })?;
        info!(path = %path.display(), device = %device, "extension registered");
        Ok(())
    }

    /// Point `device` at a configuration file. Affects later compilations
    /// only.
    pub fn set_device_config(&self, path: impl AsRef<Path>, device: &str) -> Result<()> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() || device.is_empty() {
            return Err(BridgeError::invalid_argument("Invalid argument"));
        }
        self.shared
            .device_configs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(device.to_string())
            .or_default()
            .insert(KEY_CONFIG_FILE.to_string(), path.display().to_string());
        info!(path = %path.display(), device, "device config set");
        Ok(())
    }

    /// Current configuration of `device`.
    pub fn device_config(&self, device: &str) -> DeviceConfig {
        self.shared.device_config(device)
    }

    /// Register configured extensions and device configuration files.
    pub fn apply_config(&self, config: &EngineConfig) -> Result<()> {
        *self.extension_device.borrow_mut() = config.extension_device.clone();
        for path in &config.extensions {
            self.register_extension(path)?;
        }
        for (device, path) in &config.device_configs {
            self.set_device_config(path, device)?;
        }
        Ok(())
    }

    /// Compile `model` for `device` on a worker thread.
    ///
    /// The device configuration is captured when this is called.
    pub fn compile(&self, model: &ParsedModel, device: &str) -> Promise<ExecutableModel> {
        if model.host_id() != self.host.id() || device.is_empty() {
            return Promise::rejected(BridgeError::invalid_argument("Invalid argument"));
        }
        let config = self.shared.device_config(device);
        let shared = Arc::clone(&self.shared);
        let snapshot = config.clone();
        self.host.submit(
            CompileTask {
                native: Arc::clone(&self.shared.native),
                model: model.handle(),
                device: device.to_string(),
                config,
            },
            move |host, handle| {
                Ok(ExecutableModel::new(host.downgrade(), shared, handle, snapshot))
            },
        )
    }
}

fn validate_source(source: &ModelSource) -> Result<()> {
    let valid = match source {
        ModelSource::Files { model, weights } => {
            !model.as_os_str().is_empty() && !weights.as_os_str().is_empty()
        }
        ModelSource::Memory {
            description,
            weights,
        } => !description.is_empty() && !weights.is_empty(),
    };
    if valid {
        Ok(())
    } else {
        Err(BridgeError::invalid_argument("Invalid argument"))
    }
}

/// Convenience for the common two-file form.
pub fn files(model: impl Into<PathBuf>, weights: impl Into<PathBuf>) -> ModelSource {
    ModelSource::Files {
        model: model.into(),
        weights: weights.into(),
    }
}

struct ParseTask {
    native: Arc<dyn NativeCore>,
    source: ModelSource,
}

impl BackgroundTask for ParseTask {
    type Output = Arc<dyn NativeModel>;

    fn name(&self) -> &'static str {
        "parse_model"
    }

    fn execute(self) -> Result<Self::Output> {
        guard::call("read_model", || self.native.read_model(&self.source))
    }
}

struct CompileTask {
    native: Arc<dyn NativeCore>,
    model: Arc<dyn NativeModel>,
    device: String,
    config: DeviceConfig,
}

impl BackgroundTask for CompileTask {
    type Output = Arc<dyn NativeExecutable>;

    fn name(&self) -> &'static str {
        "compile"
    }

    fn execute(self) -> Result<Self::Output> {
        guard::call("load_model", || {
            self.native.load_model(&self.model, &self.device, &self.config)
        })
    }
}
