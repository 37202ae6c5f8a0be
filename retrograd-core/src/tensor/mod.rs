use std::fmt::{self, Debug};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::buffer::Buffer;
use crate::device::Device;
use crate::error::RetrogradError;
use crate::tensor_data::TensorData;
use crate::types::DType;

pub mod ops;

/// A dense, contiguous, host-backed value.
///
/// The autograd engine treats tensors as opaque gradients: it only needs
/// their shape, dtype and device metadata plus the handful of operations in
/// [`ops`] (accumulation, broadcast reduction, casting, NaN scan). Uses
/// `Arc<RwLock<TensorData>>` for thread-safe interior mutability and shared
/// ownership; clones are cheap and share the same storage.
pub struct Tensor {
    pub(crate) data: Arc<RwLock<TensorData>>,
}

impl Tensor {
    fn from_data(data: TensorData) -> Self {
        Tensor {
            data: Arc::new(RwLock::new(data)),
        }
    }

    /// Creates a new `f32` tensor on the CPU.
    pub fn new_f32(data_vec: Vec<f32>, shape: Vec<usize>) -> Result<Self, RetrogradError> {
        let data = TensorData::new(Buffer::F32(Arc::new(data_vec)), shape, Device::cpu())?;
        Ok(Tensor::from_data(data))
    }

    /// Creates a new `f64` tensor on the CPU.
    pub fn new_f64(data_vec: Vec<f64>, shape: Vec<usize>) -> Result<Self, RetrogradError> {
        let data = TensorData::new(Buffer::F64(Arc::new(data_vec)), shape, Device::cpu())?;
        Ok(Tensor::from_data(data))
    }

    /// Creates a new `i64` tensor on the CPU.
    pub fn new_i64(data_vec: Vec<i64>, shape: Vec<usize>) -> Result<Self, RetrogradError> {
        let data = TensorData::new(Buffer::I64(Arc::new(data_vec)), shape, Device::cpu())?;
        Ok(Tensor::from_data(data))
    }

    /// Creates a tensor of zeros with the specified shape and dtype on the CPU.
    pub fn zeros(shape: Vec<usize>, dtype: DType) -> Result<Self, RetrogradError> {
        let numel = shape.iter().product::<usize>();
        match dtype {
            DType::F32 => Tensor::new_f32(vec![0.0; numel], shape),
            DType::F64 => Tensor::new_f64(vec![0.0; numel], shape),
            DType::I64 => Tensor::new_i64(vec![0; numel], shape),
        }
    }

    /// Creates a tensor of ones with the specified shape and dtype on the CPU.
    pub fn ones(shape: Vec<usize>, dtype: DType) -> Result<Self, RetrogradError> {
        let numel = shape.iter().product::<usize>();
        match dtype {
            DType::F32 => Tensor::new_f32(vec![1.0; numel], shape),
            DType::F64 => Tensor::new_f64(vec![1.0; numel], shape),
            DType::I64 => Tensor::new_i64(vec![1; numel], shape),
        }
    }

    /// Returns a tensor sharing this tensor's storage, re-homed on `device`.
    ///
    /// Storage stays host-resident in this stand-in; the device tag is what
    /// the engine routes scheduling decisions on.
    pub fn to_device(&self, device: Device) -> Tensor {
        let guard = self.read_data();
        Tensor::from_data(TensorData {
            buffer: guard.buffer.clone(),
            device,
            dtype: guard.dtype,
            shape: guard.shape.clone(),
            grad: None,
        })
    }

    /// Returns the shape of the tensor. Acquires a read lock.
    pub fn shape(&self) -> Vec<usize> {
        self.read_data().shape.clone()
    }

    /// Returns the data type of the tensor. Acquires a read lock.
    pub fn dtype(&self) -> DType {
        self.read_data().dtype
    }

    /// Returns the device the tensor resides on. Acquires a read lock.
    pub fn device(&self) -> Device {
        self.read_data().device
    }

    /// Returns the total number of elements. Acquires a read lock.
    pub fn numel(&self) -> usize {
        self.read_data().numel()
    }

    /// Provides immutable access (read guard) to the underlying TensorData.
    /// Panics if the lock is poisoned.
    pub fn read_data(&self) -> RwLockReadGuard<'_, TensorData> {
        self.data.read().expect("RwLock poisoned")
    }

    /// Provides mutable access (write guard) to the underlying TensorData.
    /// Panics if the lock is poisoned.
    pub fn write_data(&self) -> RwLockWriteGuard<'_, TensorData> {
        self.data.write().expect("RwLock poisoned")
    }

    /// Copies out the data as `Vec<f32>`. Fails on a non-f32 tensor.
    pub fn to_vec_f32(&self) -> Result<Vec<f32>, RetrogradError> {
        Ok(self.read_data().buffer.try_get_f32()?.as_ref().clone())
    }

    /// Copies out the data as `Vec<f64>`. Fails on a non-f64 tensor.
    pub fn to_vec_f64(&self) -> Result<Vec<f64>, RetrogradError> {
        Ok(self.read_data().buffer.try_get_f64()?.as_ref().clone())
    }

    /// Copies out the data as `Vec<i64>`. Fails on a non-i64 tensor.
    pub fn to_vec_i64(&self) -> Result<Vec<i64>, RetrogradError> {
        Ok(self.read_data().buffer.try_get_i64()?.as_ref().clone())
    }

    /// Returns a clone of the accumulated gradient, if any.
    pub fn grad(&self) -> Option<Tensor> {
        self.read_data().grad.clone()
    }

    /// Clears the accumulated gradient.
    pub fn zero_grad(&self) {
        self.write_data().grad = None;
    }

    /// Accumulates the given gradient into the tensor's `grad` slot.
    ///
    /// The first contribution is stored as-is; later contributions are summed
    /// into it. The gradient must match this tensor's shape, dtype and device.
    pub fn acc_grad(&self, grad_to_add: Tensor) -> Result<(), RetrogradError> {
        let mut guard = self.data.write().map_err(|_| RetrogradError::LockError {
            lock_type: "write".to_string(),
            reason: "Failed to lock TensorData for acc_grad".to_string(),
        })?;

        let grad_device = grad_to_add.device();
        if guard.device != grad_device {
            return Err(RetrogradError::DeviceMismatch {
                expected: guard.device,
                actual: grad_device,
                operation: "acc_grad".to_string(),
            });
        }
        let grad_dtype = grad_to_add.dtype();
        if guard.dtype != grad_dtype {
            return Err(RetrogradError::DataTypeMismatch {
                expected: guard.dtype,
                actual: grad_dtype,
                operation: "acc_grad".to_string(),
            });
        }

        match guard.grad.take() {
            Some(existing_grad) => {
                let existing_shape = existing_grad.shape();
                let grad_shape = grad_to_add.shape();
                if existing_shape != grad_shape {
                    guard.grad = Some(existing_grad);
                    return Err(RetrogradError::GradientAccumulationShapeMismatch {
                        expected: existing_shape,
                        actual: grad_shape,
                    });
                }
                guard.grad = Some(ops::add_op(&existing_grad, &grad_to_add)?);
            }
            None => {
                let grad_shape = grad_to_add.shape();
                if guard.shape != grad_shape {
                    return Err(RetrogradError::GradientAccumulationShapeMismatch {
                        expected: guard.shape.clone(),
                        actual: grad_shape,
                    });
                }
                guard.grad = Some(grad_to_add);
            }
        }
        Ok(())
    }

    /// Elementwise sum with another tensor of identical shape/dtype/device.
    pub fn add(&self, other: &Tensor) -> Result<Tensor, RetrogradError> {
        ops::add_op(self, other)
    }

    /// Reduces the tensor to `target_shape` by summing broadcasted dimensions.
    pub fn sum_to(&self, target_shape: &[usize]) -> Result<Tensor, RetrogradError> {
        ops::sum_to_op(self, target_shape)
    }

    /// Converts the tensor to `dtype`, copying the data if the dtype changes.
    pub fn cast(&self, dtype: DType) -> Result<Tensor, RetrogradError> {
        ops::cast_op(self, dtype)
    }

    /// True if any element is NaN. Integer tensors never contain NaNs.
    pub fn has_nan(&self) -> Result<bool, RetrogradError> {
        ops::has_nan_op(self)
    }
}

impl Clone for Tensor {
    /// Clones the Tensor handle. The new instance shares the same underlying
    /// data via the Arc; no data is copied.
    fn clone(&self) -> Self {
        Tensor {
            data: Arc::clone(&self.data),
        }
    }
}

impl Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let td = self.read_data();
        write!(
            f,
            "Tensor({}, {:?}, shape={:?}, numel={})",
            td.device,
            td.dtype,
            td.shape,
            td.numel()
        )
    }
}
