//! Handle wrapper pipeline.
//!
//! Engine instance → parsed model → executable model → inference request →
//! result buffer. Each wrapper exposes only the operations of its stage and
//! lives on the host thread; blocking steps run as background tasks and
//! settle on the host.

mod buffer;
mod engine;
mod executable;
mod model;
mod request;

pub use buffer::ResultBuffer;
pub use engine::{files, EngineInstance};
pub use executable::ExecutableModel;
pub use model::ParsedModel;
pub use request::{InferenceRequest, RequestState};
