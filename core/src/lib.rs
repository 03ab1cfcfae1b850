//! infer-bridge: run a multi-threaded native inference engine from a
//! single-threaded host.
//!
//! The crate exposes the engine as a pipeline of handle wrappers
//! ([`EngineInstance`] → [`ParsedModel`] → [`ExecutableModel`] →
//! [`InferenceRequest`] → [`ResultBuffer`]). Blocking steps run on a worker
//! pool and settle a [`Promise`] back on the caller's [`Host`] thread;
//! engine-thread completions reach host callbacks through completion
//! notifiers.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use infer_bridge::{files, BridgeConfig, EngineInstance, Host, ReferenceCore};
//!
//! let host = Host::new(&BridgeConfig::default())?;
//! let engine = EngineInstance::new(&host, Arc::new(ReferenceCore::new()));
//!
//! let model = host.block_on(engine.parse_model(files("model.yaml", "model.bin")))?;
//! let executable = host.block_on(engine.compile(&model, "CPU"))?;
//! let request = executable.create_inference_request()?;
//!
//! request.register_completion_notifier(|| println!("done"))?;
//! request.start_async()?;
//! host.run_until(|| request.state() == RequestState::Completed, timeout);
//!
//! let output = request.get_result_buffer("output")?.to_array()?;
//! ```
//!
//! The engine is consumed through the [`native`] facade traits.
//! [`ReferenceCore`] is an in-process implementation of them.

pub mod binding;
pub mod bridge;
pub mod cli;
pub mod config;
pub mod error;
pub mod inference;
pub mod native;

// Re-export commonly used types
pub use bridge::{Host, NotifierMode, Promise};
pub use config::{BridgeConfig, Config, EngineConfig};
pub use error::{BridgeError, ErrorKind, Result};
pub use inference::{
    files, EngineInstance, ExecutableModel, InferenceRequest, ParsedModel, RequestState,
    ResultBuffer,
};
pub use native::reference::ReferenceCore;
pub use native::{ModelSource, Precision, TensorDesc};
