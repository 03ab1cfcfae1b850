//! Executable models: a parsed model compiled for one device.

use std::fmt;
use std::sync::Arc;

use super::engine::EngineShared;
use super::request::InferenceRequest;
use crate::bridge::{BackgroundTask, Promise, WeakHost};
use crate::error::{BridgeError, Result};
use crate::native::{guard, DeviceConfig, NativeExecutable, NativeRequest, TensorDesc};

/// A model compiled by an [`EngineInstance`](super::EngineInstance).
///
/// Keeps the engine's shared state alive for as long as it, or any request
/// created from it, exists. The host is only referenced weakly.
pub struct ExecutableModel {
    host: WeakHost,
    engine: Arc<EngineShared>,
    handle: Arc<dyn NativeExecutable>,
    config: DeviceConfig,
}

impl ExecutableModel {
    pub(crate) fn new(
        host: WeakHost,
        engine: Arc<EngineShared>,
        handle: Arc<dyn NativeExecutable>,
        config: DeviceConfig,
    ) -> Self {
        Self {
            host,
            engine,
            handle,
            config,
        }
    }

    pub fn device(&self) -> &str {
        self.handle.device()
    }

    pub fn inputs(&self) -> &[TensorDesc] {
        self.handle.inputs()
    }

    pub fn outputs(&self) -> &[TensorDesc] {
        self.handle.outputs()
    }

    /// Device configuration captured at compile time.
    pub fn device_config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Create a request on the calling thread.
    pub fn create_inference_request(&self) -> Result<InferenceRequest> {
        let native = guard::call("create_request", || self.handle.create_request())?;
        Ok(self.wrap(native))
    }

    /// Create a request on a worker thread.
    pub fn create_inference_request_async(&self) -> Promise<InferenceRequest> {
        let Some(host) = self.host.upgrade() else {
            return Promise::rejected(BridgeError::Internal(
                "The host of this model is gone".to_string(),
            ));
        };
        let engine = Arc::clone(&self.engine);
        let executable = Arc::clone(&self.handle);
        host.submit(
            CreateRequestTask {
                executable: Arc::clone(&self.handle),
            },
            move |host, native| {
                Ok(InferenceRequest::new(host.downgrade(), engine, executable, native))
            },
        )
    }

    fn wrap(&self, native: Arc<dyn NativeRequest>) -> InferenceRequest {
        InferenceRequest::new(
            self.host.clone(),
            Arc::clone(&self.engine),
            Arc::clone(&self.handle),
            native,
        )
    }
}

impl fmt::Debug for ExecutableModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutableModel")
            .field("device", &self.device())
            .field("config", &self.config)
            .finish()
    }
}

struct CreateRequestTask {
    executable: Arc<dyn NativeExecutable>,
}

impl BackgroundTask for CreateRequestTask {
    type Output = Arc<dyn NativeRequest>;

    fn name(&self) -> &'static str {
        "create_request"
    }

    fn execute(self) -> Result<Self::Output> {
        guard::call("create_request", || self.executable.create_request())
    }
}
