//! Parsed models.

use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::Arc;

use crate::native::{NativeModel, TensorDesc};

/// An immutable, device-independent model.
///
/// Produced by [`EngineInstance::parse_model`](super::EngineInstance::parse_model)
/// and reusable across any number of compilations on the same host. It does
/// not keep the engine that parsed it alive.
#[derive(Clone)]
pub struct ParsedModel {
    host_id: u64,
    handle: Arc<dyn NativeModel>,
    _local: PhantomData<Rc<()>>,
}

impl ParsedModel {
    pub(crate) fn new(host_id: u64, handle: Arc<dyn NativeModel>) -> Self {
        Self {
            host_id,
            handle,
            _local: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn inputs(&self) -> &[TensorDesc] {
        self.handle.inputs()
    }

    pub fn outputs(&self) -> &[TensorDesc] {
        self.handle.outputs()
    }

    pub(crate) fn host_id(&self) -> u64 {
        self.host_id
    }

    pub(crate) fn handle(&self) -> Arc<dyn NativeModel> {
        Arc::clone(&self.handle)
    }
}

impl fmt::Debug for ParsedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParsedModel")
            .field("name", &self.name())
            .field("inputs", &self.inputs().len())
            .field("outputs", &self.outputs().len())
            .finish()
    }
}
