use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Precision {
    Fp32,
    Fp16,
    I64,
    I32,
    I16,
    I8,
    U8,
    Bool,
}

impl Precision {
    /// Size of one element in bytes.
    pub fn element_size(self) -> usize {
        match self {
            Self::I64 => 8,
            Self::Fp32 | Self::I32 => 4,
            Self::Fp16 | Self::I16 => 2,
            Self::I8 | Self::U8 | Self::Bool => 1,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Fp32 => "FP32",
            Self::Fp16 => "FP16",
            Self::I64 => "I64",
            Self::I32 => "I32",
            Self::I16 => "I16",
            Self::I8 => "I8",
            Self::U8 => "U8",
            Self::Bool => "BOOL",
        };
        f.write_str(name)
    }
}

/// Name, element type and shape of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDesc {
    pub name: String,
    pub precision: Precision,
    pub dims: Vec<usize>,
}

impl TensorDesc {
    pub fn new(name: impl Into<String>, precision: Precision, dims: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            precision,
            dims,
        }
    }

    /// Number of elements; a scalar (no dims) has one.
    ///
    /// Engines reject shapes whose size overflows when a model is parsed, so
    /// this is only unchecked for descriptors built by hand.
    pub fn element_count(&self) -> usize {
        self.dims.iter().product()
    }

    /// Storage size in bytes.
    pub fn byte_len(&self) -> usize {
        self.element_count() * self.precision.element_size()
    }

    /// Storage size in bytes, or `None` if it does not fit in `usize`.
    pub fn checked_byte_len(&self) -> Option<usize> {
        self.dims
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))?
            .checked_mul(self.precision.element_size())
    }
}

/// Tensor storage owned by a native request.
///
/// Cloning a `Blob` clones the reference; all clones see the same bytes.
#[derive(Debug, Clone)]
pub struct Blob {
    desc: Arc<TensorDesc>,
    data: Arc<RwLock<Vec<u8>>>,
}

impl Blob {
    /// Allocate zero-filled storage for `desc`.
    pub fn zeroed(desc: TensorDesc) -> Self {
        let data = vec![0u8; desc.byte_len()];
        Self {
            desc: Arc::new(desc),
            data: Arc::new(RwLock::new(data)),
        }
    }

    pub fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    pub fn byte_len(&self) -> usize {
        self.read(|bytes| bytes.len())
    }

    /// Borrow the bytes under the read lock.
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.data.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    /// Borrow the bytes mutably under the write lock.
    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut guard = self.data.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// True when both blobs refer to the same storage.
    pub fn shares_storage_with(&self, other: &Blob) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

/// Decode little-endian FP32 elements.
pub fn read_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Encode `values` as little-endian FP32 into the front of `bytes`.
/// Returns the number of elements written.
pub fn write_f32(bytes: &mut [u8], values: &[f32]) -> usize {
    let mut written = 0;
    for (chunk, value) in bytes.chunks_exact_mut(4).zip(values) {
        chunk.copy_from_slice(&value.to_le_bytes());
        written += 1;
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_len_follows_shape_and_precision() {
        let desc = TensorDesc::new("data", Precision::Fp32, vec![1, 3, 224, 224]);
        assert_eq!(desc.element_count(), 150_528);
        assert_eq!(desc.byte_len(), 602_112);

        let mask = TensorDesc::new("mask", Precision::U8, vec![2, 8]);
        assert_eq!(mask.byte_len(), 16);

        let scalar = TensorDesc::new("scale", Precision::I64, vec![]);
        assert_eq!(scalar.byte_len(), 8);
    }

    #[test]
    fn checked_byte_len_detects_overflow() {
        let desc = TensorDesc::new("data", Precision::Fp32, vec![1, 3, 224, 224]);
        assert_eq!(desc.checked_byte_len(), Some(602_112));

        let huge = TensorDesc::new("huge", Precision::Fp32, vec![usize::MAX, 2]);
        assert_eq!(huge.checked_byte_len(), None);

        let wide = TensorDesc::new("wide", Precision::I64, vec![usize::MAX / 4]);
        assert_eq!(wide.checked_byte_len(), None);
    }

    #[test]
    fn clones_share_storage() {
        let blob = Blob::zeroed(TensorDesc::new("out", Precision::Fp32, vec![4]));
        let alias = blob.clone();
        blob.write(|bytes| write_f32(bytes, &[1.0, 2.0, 3.0, 4.0]));
        assert!(alias.shares_storage_with(&blob));
        assert_eq!(alias.read(read_f32), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn precision_names_round_trip_through_serde() {
        let p: Precision = serde_json::from_str("\"FP16\"").unwrap();
        assert_eq!(p, Precision::Fp16);
        assert_eq!(p.to_string(), "FP16");
        assert_eq!(serde_json::to_string(&Precision::Bool).unwrap(), "\"BOOL\"");
    }
}
