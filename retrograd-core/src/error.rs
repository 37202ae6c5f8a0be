use crate::device::Device;
use crate::types::DType;
use thiserror::Error;

/// Custom error type for the retrograd framework.
#[derive(Error, Debug, PartialEq, Clone)] // PartialEq/Clone for easier testing and future propagation
pub enum RetrogradError {
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}, operation: {operation}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
        operation: String,
    },

    #[error("Data type mismatch: expected {expected:?}, got {actual:?}, operation: {operation}")]
    DataTypeMismatch {
        expected: DType,
        actual: DType,
        operation: String,
    },

    #[error("Device mismatch for operation '{operation}': expected {expected}, got {actual}")]
    DeviceMismatch {
        expected: Device,
        actual: Device,
        operation: String,
    },

    #[error("Shape mismatch during gradient accumulation: expected {expected:?}, got {actual:?}")]
    GradientAccumulationShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Tensor creation error: data length {data_len} does not match shape {shape:?}")]
    TensorCreationError { data_len: usize, shape: Vec<usize> },

    /// A gradient produced by a backward function (or a seed gradient) failed
    /// validation against the consumer's input metadata. The message already
    /// carries the failing function and slot index.
    #[error("{0}")]
    InvalidGradient(String),

    #[error("Backward pass error: {0}")]
    BackwardError(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Locking error: Failed to acquire {lock_type} lock. Reason: {reason}")]
    LockError { lock_type: String, reason: String },
}
