use std::sync::Arc;

use crate::error::RetrogradError;
use crate::types::DType;

/// Concrete storage for a tensor, specialized by data type.
///
/// Each variant holds an `Arc<Vec<T>>` so clones share ownership of the
/// underlying vector. The engine schedules work for accelerator devices too,
/// but this stand-in keeps every buffer host-resident; placement is tracked
/// by `TensorData::device`.
#[derive(Debug, Clone)]
pub enum Buffer {
    /// Buffer holding `f32` (32-bit floating-point) values.
    F32(Arc<Vec<f32>>),
    /// Buffer holding `f64` (64-bit floating-point) values.
    F64(Arc<Vec<f64>>),
    /// Buffer holding `i64` (64-bit integer) values.
    I64(Arc<Vec<i64>>),
}

impl Buffer {
    pub fn dtype(&self) -> DType {
        match self {
            Buffer::F32(_) => DType::F32,
            Buffer::F64(_) => DType::F64,
            Buffer::I64(_) => DType::I64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Buffer::F32(data) => data.len(),
            Buffer::F64(data) => data.len(),
            Buffer::I64(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attempts to get the underlying `Arc<Vec<f32>>`.
    pub fn try_get_f32(&self) -> Result<&Arc<Vec<f32>>, RetrogradError> {
        match self {
            Buffer::F32(data) => Ok(data),
            other => Err(RetrogradError::DataTypeMismatch {
                expected: DType::F32,
                actual: other.dtype(),
                operation: "try_get_f32".to_string(),
            }),
        }
    }

    /// Attempts to get the underlying `Arc<Vec<f64>>`.
    pub fn try_get_f64(&self) -> Result<&Arc<Vec<f64>>, RetrogradError> {
        match self {
            Buffer::F64(data) => Ok(data),
            other => Err(RetrogradError::DataTypeMismatch {
                expected: DType::F64,
                actual: other.dtype(),
                operation: "try_get_f64".to_string(),
            }),
        }
    }

    /// Attempts to get the underlying `Arc<Vec<i64>>`.
    pub fn try_get_i64(&self) -> Result<&Arc<Vec<i64>>, RetrogradError> {
        match self {
            Buffer::I64(data) => Ok(data),
            other => Err(RetrogradError::DataTypeMismatch {
                expected: DType::I64,
                actual: other.dtype(),
                operation: "try_get_i64".to_string(),
            }),
        }
    }
}
