//! In-process reference implementation of the native facade.
//!
//! The reference engine understands a small YAML (or JSON) model description
//! and performs a deterministic computation: every FP32 output element is set
//! to `bias + mean(FP32 input elements)`. Asynchronous runs execute on the
//! engine's own threads and report completion through the registered
//! callback, exactly like a device plugin would.
//!
//! ```yaml
//! name: classifier
//! inputs:
//!   - { name: data, precision: FP32, dims: [1, 3, 224, 224] }
//! outputs:
//!   - { name: output, precision: FP32, dims: [1, 3, 224, 224] }
//! bias: 0.5
//! ```

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use super::guard::panic_message;
use super::{
    read_f32, write_f32, Blob, CompletionCallback, DeviceConfig, ModelSource, NativeCore,
    NativeError, NativeExecutable, NativeModel, NativeRequest, NativeResult, Precision,
    RunOutcome, TensorDesc, Version, KEY_CONFIG_FILE,
};
use crate::config::ReferenceConfig;

const API_MAJOR: u32 = 2;
const API_MINOR: u32 = 1;
const BUILD_NUMBER: &str = "reference-2021.4";

/// Upper bound on the buffers one request of a model may allocate.
pub const MAX_REQUEST_BYTES: usize = 1 << 30;

/// Failure injected into every run of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fault {
    /// Report an engine error.
    Error,
    /// Panic inside the engine.
    Panic,
}

/// Model description understood by the reference engine.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<TensorDesc>,
    pub outputs: Vec<TensorDesc>,
    #[serde(default)]
    pub bias: f32,
    /// Exact weights length, checked when present.
    #[serde(default)]
    pub weights_bytes: Option<usize>,
    #[serde(default)]
    pub fault: Option<Fault>,
}

fn unknown_device(device: &str) -> NativeError {
    NativeError::new(format!(
        "Device with \"{device}\" name is not registered in the InferenceEngine"
    ))
}

/// Reference engine core with `CPU` and `GPU` plugins.
pub struct ReferenceCore {
    devices: BTreeMap<String, Version>,
    extensions: Mutex<Vec<(PathBuf, String)>>,
    latency: Duration,
}

impl Default for ReferenceCore {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceCore {
    pub fn new() -> Self {
        let mut devices = BTreeMap::new();
        for (name, description) in [
            ("CPU", "Reference CPU plugin"),
            ("GPU", "Reference GPU plugin"),
        ] {
            devices.insert(
                name.to_string(),
                Version {
                    api_major: API_MAJOR,
                    api_minor: API_MINOR,
                    build_number: Some(BUILD_NUMBER.to_string()),
                    description: Some(description.to_string()),
                },
            );
        }
        Self {
            devices,
            extensions: Mutex::new(Vec::new()),
            latency: Duration::ZERO,
        }
    }

    pub fn from_config(config: &ReferenceConfig) -> Self {
        Self::new().with_latency(config.latency())
    }

    /// Make every run take at least `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Extensions registered so far, with their device.
    pub fn extensions(&self) -> Vec<(PathBuf, String)> {
        self.extensions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn check_device(&self, device: &str) -> NativeResult<()> {
        if self.devices.contains_key(device) {
            Ok(())
        } else {
            Err(unknown_device(device))
        }
    }

    fn parse_spec(description: &str, weights_len: usize) -> NativeResult<ModelSpec> {
        let spec: ModelSpec = serde_yaml::from_str(description).map_err(|e| {
            NativeError::new(format!("Failed to parse model description: {e}"))
        })?;
        if spec.outputs.is_empty() {
            return Err(NativeError::new(format!(
                "Model '{}' declares no outputs",
                spec.name
            )));
        }
        let mut seen = std::collections::BTreeSet::new();
        let mut total = 0usize;
        for desc in spec.inputs.iter().chain(&spec.outputs) {
            if !seen.insert(desc.name.as_str()) {
                return Err(NativeError::new(format!(
                    "Duplicate tensor name '{}' in model '{}'",
                    desc.name, spec.name
                )));
            }
            total = desc
                .checked_byte_len()
                .and_then(|len| total.checked_add(len))
                .filter(|&len| len <= MAX_REQUEST_BYTES)
                .ok_or_else(|| {
                    NativeError::new(format!(
                        "Tensor '{}' of model '{}' with dims {:?} exceeds the {} byte limit",
                        desc.name, spec.name, desc.dims, MAX_REQUEST_BYTES
                    ))
                })?;
        }
        if let Some(expected) = spec.weights_bytes {
            if expected != weights_len {
                return Err(NativeError::new(format!(
                    "Weights size mismatch: expected {expected} bytes, got {weights_len}"
                )));
            }
        }
        Ok(spec)
    }
}

impl NativeCore for ReferenceCore {
    fn versions(&self, device: &str) -> NativeResult<BTreeMap<String, Version>> {
        let version = self.devices.get(device).ok_or_else(|| unknown_device(device))?;
        Ok(BTreeMap::from([(device.to_string(), version.clone())]))
    }

    fn read_model(&self, source: &ModelSource) -> NativeResult<Arc<dyn NativeModel>> {
        let (description, weights_len) = match source {
            ModelSource::Files { model, weights } => {
                let description = std::fs::read_to_string(model).map_err(|e| {
                    NativeError::new(format!(
                        "Model file {} cannot be opened: {e}",
                        model.display()
                    ))
                })?;
                let weights = std::fs::metadata(weights).map_err(|e| {
                    NativeError::new(format!(
                        "Weights file {} cannot be opened: {e}",
                        weights.display()
                    ))
                })?;
                (description, weights.len() as usize)
            }
            ModelSource::Memory {
                description,
                weights,
            } => (description.clone(), weights.len()),
        };
        let spec = Self::parse_spec(&description, weights_len)?;
        debug!(model = %spec.name, weights_len, "reference model parsed");
        Ok(Arc::new(ReferenceModel {
            spec: Arc::new(spec),
        }))
    }

    fn add_extension(&self, path: &Path, device: &str) -> NativeResult<()> {
        self.check_device(device)?;
        if !path.is_file() {
            return Err(NativeError::new(format!(
                "Cannot load library '{}': no such file",
                path.display()
            )));
        }
        self.extensions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((path.to_path_buf(), device.to_string()));
        Ok(())
    }

    fn load_model(
        &self,
        model: &Arc<dyn NativeModel>,
        device: &str,
        config: &DeviceConfig,
    ) -> NativeResult<Arc<dyn NativeExecutable>> {
        self.check_device(device)?;
        let model = model
            .as_any()
            .downcast_ref::<ReferenceModel>()
            .ok_or_else(|| NativeError::new("Model was not produced by the reference engine"))?;
        if let Some(path) = config.get(KEY_CONFIG_FILE) {
            if !Path::new(path).is_file() {
                return Err(NativeError::new(format!(
                    "Failed to open {device} config file {path}"
                )));
            }
        }
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        Ok(Arc::new(ReferenceExecutable {
            spec: Arc::clone(&model.spec),
            device: device.to_string(),
            latency: self.latency,
        }))
    }
}

/// A model parsed by [`ReferenceCore`].
pub struct ReferenceModel {
    spec: Arc<ModelSpec>,
}

impl NativeModel for ReferenceModel {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn inputs(&self) -> &[TensorDesc] {
        &self.spec.inputs
    }

    fn outputs(&self) -> &[TensorDesc] {
        &self.spec.outputs
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A model compiled by [`ReferenceCore`].
pub struct ReferenceExecutable {
    spec: Arc<ModelSpec>,
    device: String,
    latency: Duration,
}

impl NativeExecutable for ReferenceExecutable {
    fn device(&self) -> &str {
        &self.device
    }

    fn inputs(&self) -> &[TensorDesc] {
        &self.spec.inputs
    }

    fn outputs(&self) -> &[TensorDesc] {
        &self.spec.outputs
    }

    fn create_request(&self) -> NativeResult<Arc<dyn NativeRequest>> {
        let blobs = self
            .spec
            .inputs
            .iter()
            .chain(&self.spec.outputs)
            .map(|desc| (desc.name.clone(), Blob::zeroed(desc.clone())))
            .collect();
        Ok(Arc::new(ReferenceRequest {
            inner: Arc::new(RequestInner {
                spec: Arc::clone(&self.spec),
                blobs,
                latency: self.latency,
                running: AtomicBool::new(false),
                callback: Mutex::new(None),
                runs: AtomicU64::new(0),
            }),
        }))
    }
}

/// An execution context of the reference engine.
pub struct ReferenceRequest {
    inner: Arc<RequestInner>,
}

impl ReferenceRequest {
    /// Number of runs that finished, successfully or not.
    pub fn runs(&self) -> u64 {
        self.inner.runs.load(Ordering::SeqCst)
    }
}

struct RequestInner {
    spec: Arc<ModelSpec>,
    blobs: BTreeMap<String, Blob>,
    latency: Duration,
    running: AtomicBool,
    callback: Mutex<Option<Arc<dyn Fn(RunOutcome) + Send + Sync>>>,
    runs: AtomicU64,
}

/// Clears the busy flag when a run ends, even by unwinding.
struct RunGuard<'a>(&'a RequestInner);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.runs.fetch_add(1, Ordering::SeqCst);
        self.0.running.store(false, Ordering::SeqCst);
    }
}

impl RequestInner {
    fn acquire(&self) -> NativeResult<()> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| NativeError::new("Infer Request is busy"))
    }

    fn run(&self) -> NativeResult<()> {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        match self.spec.fault {
            Some(Fault::Error) => {
                return Err(NativeError::new(format!(
                    "Inference of model '{}' failed",
                    self.spec.name
                )))
            }
            Some(Fault::Panic) => panic!("fault injected into model '{}'", self.spec.name),
            None => {}
        }

        let (mut sum, mut count) = (0.0f64, 0usize);
        for desc in self.spec.inputs.iter().filter(|d| d.precision == Precision::Fp32) {
            if let Some(blob) = self.blobs.get(&desc.name) {
                blob.read(|bytes| {
                    for value in read_f32(bytes) {
                        sum += f64::from(value);
                        count += 1;
                    }
                });
            }
        }
        let mean = if count == 0 { 0.0 } else { sum / count as f64 };
        let value = self.spec.bias + mean as f32;

        for desc in self.spec.outputs.iter().filter(|d| d.precision == Precision::Fp32) {
            if let Some(blob) = self.blobs.get(&desc.name) {
                let values = vec![value; desc.element_count()];
                blob.write(|bytes| write_f32(bytes, &values));
            }
        }
        Ok(())
    }

    fn completion_callback(&self) -> Option<Arc<dyn Fn(RunOutcome) + Send + Sync>> {
        self.callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl NativeRequest for ReferenceRequest {
    fn infer(&self) -> NativeResult<()> {
        self.inner.acquire()?;
        let _guard = RunGuard(&self.inner);
        self.inner.run()
    }

    fn start_async(&self) -> NativeResult<()> {
        self.inner.acquire()?;
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("reference-infer".to_string())
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    let _guard = RunGuard(&inner);
                    inner.run()
                }));
                match inner.completion_callback() {
                    Some(callback) => callback(outcome),
                    None => match outcome {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => warn!(error = %err, "asynchronous run failed"),
                        Err(payload) => warn!(
                            panic = panic_message(payload.as_ref()),
                            "asynchronous run panicked"
                        ),
                    },
                }
            });
        match spawned {
            Ok(_) => Ok(()),
            Err(e) => {
                self.inner.running.store(false, Ordering::SeqCst);
                Err(NativeError::new(format!("Failed to start asynchronous run: {e}")))
            }
        }
    }

    fn set_completion_callback(&self, callback: CompletionCallback) {
        *self
            .inner
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::from(callback));
    }

    fn blob(&self, name: &str) -> NativeResult<Blob> {
        self.inner.blobs.get(name).cloned().ok_or_else(|| {
            NativeError::new(format!("Failed to find input or output with name: '{name}'"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    const MODEL: &str = r#"
name: tiny
inputs:
  - { name: data, precision: FP32, dims: [1, 4] }
outputs:
  - { name: output, precision: FP32, dims: [1, 2] }
bias: 0.5
weights_bytes: 3
"#;

    fn memory_source(description: &str, weights: &[u8]) -> ModelSource {
        ModelSource::Memory {
            description: description.to_string(),
            weights: Arc::from(weights),
        }
    }

    fn compile(core: &ReferenceCore) -> Arc<dyn NativeExecutable> {
        let model = core.read_model(&memory_source(MODEL, &[1, 2, 3])).unwrap();
        core.load_model(&model, "CPU", &DeviceConfig::new()).unwrap()
    }

    #[test]
    fn versions_for_known_and_unknown_devices() {
        let core = ReferenceCore::new();
        let versions = core.versions("CPU").unwrap();
        let cpu = &versions["CPU"];
        assert_eq!((cpu.api_major, cpu.api_minor), (API_MAJOR, API_MINOR));
        assert_eq!(cpu.build_number.as_deref(), Some(BUILD_NUMBER));

        let err = core.versions("NPU").unwrap_err();
        assert_eq!(
            err.message(),
            "Device with \"NPU\" name is not registered in the InferenceEngine"
        );
    }

    #[test]
    fn weights_length_is_checked() {
        let core = ReferenceCore::new();
        let err = core
            .read_model(&memory_source(MODEL, &[0; 8]))
            .err()
            .unwrap();
        assert!(err.message().contains("expected 3 bytes, got 8"));
    }

    #[test]
    fn infer_writes_bias_plus_input_mean() {
        let core = ReferenceCore::new();
        let request = compile(&core).create_request().unwrap();
        request
            .blob("data")
            .unwrap()
            .write(|bytes| write_f32(bytes, &[1.0, 2.0, 3.0, 4.0]));
        request.infer().unwrap();
        let output = request.blob("output").unwrap().read(read_f32);
        assert_eq!(output, vec![3.0, 3.0]);
    }

    #[test]
    fn unknown_blob_is_reported() {
        let core = ReferenceCore::new();
        let request = compile(&core).create_request().unwrap();
        let err = request.blob("logits").unwrap_err();
        assert!(err.message().contains("'logits'"));
    }

    #[test]
    fn start_async_fires_callback_from_engine_thread() {
        let core = ReferenceCore::new();
        let request = compile(&core).create_request().unwrap();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        request.set_completion_callback(Box::new(move |outcome| {
            let name = thread::current().name().map(str::to_string);
            let _ = tx.lock().unwrap().send((name, matches!(outcome, Ok(Ok(())))));
        }));
        request.start_async().unwrap();
        let (thread_name, succeeded) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(thread_name.as_deref(), Some("reference-infer"));
        assert!(succeeded);
    }

    #[test]
    fn start_async_reports_failures_to_callback() {
        let core = ReferenceCore::new();
        let description = format!("{MODEL}fault: error\n");
        let model = core.read_model(&memory_source(&description, &[1, 2, 3])).unwrap();
        let request = core
            .load_model(&model, "CPU", &DeviceConfig::new())
            .unwrap()
            .create_request()
            .unwrap();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        request.set_completion_callback(Box::new(move |outcome| {
            let message = match outcome {
                Ok(Err(err)) => Some(err.into_message()),
                _ => None,
            };
            let _ = tx.lock().unwrap().send(message);
        }));
        request.start_async().unwrap();
        let message = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(message.as_deref(), Some("Inference of model 'tiny' failed"));
    }

    #[test]
    fn oversized_shapes_are_rejected_at_parse_time() {
        let core = ReferenceCore::new();
        for dims in ["[1048576, 1048576, 1024]", "[18446744073709551615, 2]"] {
            let description = format!(
                "name: huge\noutputs:\n  - {{ name: output, precision: FP32, dims: {dims} }}\n"
            );
            let err = core
                .read_model(&memory_source(&description, &[]))
                .err()
                .unwrap();
            assert!(err.message().contains("exceeds the"), "{}", err.message());
        }
    }

    #[test]
    fn busy_request_rejects_second_run() {
        let core = ReferenceCore::new().with_latency(Duration::from_millis(200));
        let request = compile(&core).create_request().unwrap();
        request.start_async().unwrap();
        let err = request.infer().unwrap_err();
        assert_eq!(err.message(), "Infer Request is busy");
    }

    #[test]
    fn extension_requires_existing_file() {
        let core = ReferenceCore::new();
        let err = core
            .add_extension(Path::new("/nonexistent/libext.so"), "CPU")
            .unwrap_err();
        assert!(err.message().starts_with("Cannot load library"));
        assert!(core.extensions().is_empty());
    }
}
