//! Named tensors of an inference request.

use std::fmt;
use std::sync::Arc;

use ndarray::{ArrayD, IxDyn};

use crate::error::{BridgeError, Result};
use crate::native::{self, Blob, NativeRequest, Precision, TensorDesc};

/// A view of one input or output buffer.
///
/// Reads and writes go straight to the request's storage; nothing is copied
/// until a `to_*` method is called. The buffer keeps its request alive.
pub struct ResultBuffer {
    _request: Arc<dyn NativeRequest>,
    blob: Blob,
}

impl ResultBuffer {
    pub(crate) fn new(request: Arc<dyn NativeRequest>, blob: Blob) -> Self {
        Self {
            _request: request,
            blob,
        }
    }

    pub fn desc(&self) -> &TensorDesc {
        self.blob.desc()
    }

    pub fn name(&self) -> &str {
        &self.desc().name
    }

    pub fn precision(&self) -> Precision {
        self.desc().precision
    }

    pub fn dims(&self) -> &[usize] {
        &self.desc().dims
    }

    pub fn element_count(&self) -> usize {
        self.desc().element_count()
    }

    pub fn byte_len(&self) -> usize {
        self.blob.byte_len()
    }

    /// Copy of the raw bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.blob.read(<[u8]>::to_vec)
    }

    /// Copy of the contents as `f32` values.
    pub fn to_vec_f32(&self) -> Result<Vec<f32>> {
        self.require_fp32()?;
        Ok(self.blob.read(native::read_f32))
    }

    /// Copy of the contents as an array shaped like the buffer.
    pub fn to_array(&self) -> Result<ArrayD<f32>> {
        let values = self.to_vec_f32()?;
        ArrayD::from_shape_vec(IxDyn(self.dims()), values)
            .map_err(|e| BridgeError::Internal(format!("array shape error: {e}")))
    }

    /// Overwrite the whole buffer with raw bytes.
    pub fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.byte_len() {
            return Err(BridgeError::invalid_argument(format!(
                "buffer '{}' holds {} bytes, got {}",
                self.name(),
                self.byte_len(),
                bytes.len()
            )));
        }
        self.blob.write(|dst| dst.copy_from_slice(bytes));
        Ok(())
    }

    /// Overwrite the whole buffer with `f32` values.
    pub fn write_f32(&self, values: &[f32]) -> Result<()> {
        self.require_fp32()?;
        if values.len() != self.element_count() {
            return Err(BridgeError::invalid_argument(format!(
                "buffer '{}' holds {} elements, got {}",
                self.name(),
                self.element_count(),
                values.len()
            )));
        }
        self.blob.write(|dst| native::write_f32(dst, values));
        Ok(())
    }

    /// Set every element to `value`.
    pub fn fill_f32(&self, value: f32) -> Result<()> {
        self.write_f32(&vec![value; self.element_count()])
    }

    /// True when both views point at the same storage.
    pub fn shares_storage_with(&self, other: &ResultBuffer) -> bool {
        self.blob.shares_storage_with(&other.blob)
    }

    fn require_fp32(&self) -> Result<()> {
        if self.precision() == Precision::Fp32 {
            Ok(())
        } else {
            Err(BridgeError::invalid_argument(format!(
                "buffer '{}' has precision {}, expected FP32",
                self.name(),
                self.precision()
            )))
        }
    }
}

impl fmt::Debug for ResultBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultBuffer")
            .field("desc", self.desc())
            .finish()
    }
}
