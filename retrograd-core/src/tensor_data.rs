use crate::buffer::Buffer;
use crate::device::Device;
use crate::error::RetrogradError;
use crate::tensor::Tensor;
use crate::types::DType;

/// Internal storage and metadata for a Tensor.
///
/// Holds the shared data buffer, shape, device, data type and the gradient
/// slot. Typically wrapped in `Arc<RwLock<TensorData>>` by the `Tensor`
/// struct for shared ownership and interior mutability. Buffers are always
/// contiguous row-major; the engine treats tensors as opaque values and never
/// needs strided views.
#[derive(Debug)]
pub struct TensorData {
    /// The underlying typed data buffer.
    pub(crate) buffer: Buffer,
    /// The device this tensor logically resides on.
    pub(crate) device: Device,
    /// The data type of the elements in the buffer.
    pub(crate) dtype: DType,
    /// The shape (dimensions) of the tensor.
    pub shape: Vec<usize>,
    /// The accumulated gradient, if any. Must match shape, dtype and device.
    pub grad: Option<Tensor>,
}

impl TensorData {
    pub(crate) fn new(buffer: Buffer, shape: Vec<usize>, device: Device) -> Result<Self, RetrogradError> {
        let numel: usize = shape.iter().product();
        if buffer.len() != numel {
            return Err(RetrogradError::TensorCreationError {
                data_len: buffer.len(),
                shape,
            });
        }
        let dtype = buffer.dtype();
        Ok(TensorData {
            buffer,
            device,
            dtype,
            shape,
            grad: None,
        })
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}
