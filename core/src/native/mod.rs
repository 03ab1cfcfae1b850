//! Native engine facade.
//!
//! The inference engine is consumed through the synchronous traits in this
//! module. Every handle is shared (`Arc`) and `Send + Sync`, so the bridge can
//! hand a clone of it to a worker thread without moving any caller-visible
//! wrapper. Calls into the facade go through [`guard`], which turns every
//! failure into a [`BridgeError`](crate::error::BridgeError).

pub mod guard;
pub mod reference;
mod tensor;

use std::any::Any;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

pub use tensor::{read_f32, write_f32, Blob, Precision, TensorDesc};

/// Result type returned by facade methods.
pub type NativeResult<T> = std::result::Result<T, NativeError>;

/// Configuration key holding a device configuration file path.
pub const KEY_CONFIG_FILE: &str = "CONFIG_FILE";

/// Key/value configuration for one device.
pub type DeviceConfig = BTreeMap<String, String>;

/// How an asynchronous run ended: a reported failure, or the panic payload
/// when the run unwound.
pub type RunOutcome = std::thread::Result<NativeResult<()>>;

/// Callback the engine invokes, from any of its threads, when an
/// asynchronous run finishes.
pub type CompletionCallback = Box<dyn Fn(RunOutcome) + Send + Sync>;

/// A failure reported by the engine itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct NativeError {
    message: String,
}

impl NativeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn into_message(self) -> String {
        self.message
    }
}

/// Plugin version reported for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Version {
    pub api_major: u32,
    pub api_minor: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Where a model description and its weights come from.
#[derive(Debug, Clone)]
pub enum ModelSource {
    /// A description file and a weights file on disk.
    Files { model: PathBuf, weights: PathBuf },
    /// An in-memory description and weights buffer.
    Memory {
        description: String,
        weights: Arc<[u8]>,
    },
}

/// Engine entry point: device plugins, model parsing and compilation.
pub trait NativeCore: Send + Sync {
    /// Plugin versions for `device`, keyed by plugin name.
    fn versions(&self, device: &str) -> NativeResult<BTreeMap<String, Version>>;

    /// Parse a model description and its weights.
    fn read_model(&self, source: &ModelSource) -> NativeResult<Arc<dyn NativeModel>>;

    /// Register an extension library for `device`.
    fn add_extension(&self, path: &Path, device: &str) -> NativeResult<()>;

    /// Compile `model` for `device` with the given configuration.
    fn load_model(
        &self,
        model: &Arc<dyn NativeModel>,
        device: &str,
        config: &DeviceConfig,
    ) -> NativeResult<Arc<dyn NativeExecutable>>;
}

/// A parsed, device-independent model. Never mutated after creation.
pub trait NativeModel: Send + Sync {
    fn name(&self) -> &str;
    fn inputs(&self) -> &[TensorDesc];
    fn outputs(&self) -> &[TensorDesc];
    fn as_any(&self) -> &dyn Any;
}

/// A model compiled for one device.
pub trait NativeExecutable: Send + Sync {
    fn device(&self) -> &str;
    fn inputs(&self) -> &[TensorDesc];
    fn outputs(&self) -> &[TensorDesc];

    /// Create a new execution context with its own buffers.
    fn create_request(&self) -> NativeResult<Arc<dyn NativeRequest>>;
}

/// An execution context bound to one executable model.
pub trait NativeRequest: Send + Sync {
    /// Run the bound computation to completion on the calling thread.
    fn infer(&self) -> NativeResult<()>;

    /// Start a run on an engine thread and return immediately. The completion
    /// callback fires with the run's outcome when it ends.
    fn start_async(&self) -> NativeResult<()>;

    /// Replace the completion callback.
    fn set_completion_callback(&self, callback: CompletionCallback);

    /// Input or output buffer by name, sharing the request's storage.
    fn blob(&self, name: &str) -> NativeResult<Blob>;
}
