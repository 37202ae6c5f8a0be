//! The small tensor algebra the gradient path needs: elementwise addition for
//! buffer accumulation, broadcast reduction for shape coercion, dtype casts
//! and a NaN scan for anomaly mode.

use std::ops::AddAssign;

use num_traits::Float;

use crate::buffer::Buffer;
use crate::device::Device;
use crate::error::RetrogradError;
use crate::tensor::Tensor;
use crate::types::DType;

/// True if `from` can be broadcast (expanded) to `to`.
///
/// Dimensions align from the trailing end; every dimension of `from` must
/// equal the matching dimension of `to` or be 1.
pub fn is_expandable_to(from: &[usize], to: &[usize]) -> bool {
    if from.len() > to.len() {
        return false;
    }
    from.iter()
        .rev()
        .zip(to.iter().rev())
        .all(|(&f, &t)| f == t || f == 1)
}

fn place_on(tensor: Tensor, device: Device) -> Tensor {
    if device.is_cpu() {
        tensor
    } else {
        tensor.to_device(device)
    }
}

fn add_kernel<T: Float>(a: &[T], b: &[T]) -> Vec<T> {
    a.iter().zip(b.iter()).map(|(&x, &y)| x + y).collect()
}

/// Elementwise addition of two tensors with identical shape, dtype and device.
///
/// Gradient accumulation never broadcasts: both contributions have already
/// been coerced to the consumer's metadata shape.
pub fn add_op(a: &Tensor, b: &Tensor) -> Result<Tensor, RetrogradError> {
    let a_guard = a.read_data();
    let b_guard = b.read_data();

    if a_guard.device != b_guard.device {
        return Err(RetrogradError::DeviceMismatch {
            expected: a_guard.device,
            actual: b_guard.device,
            operation: "add_op".to_string(),
        });
    }
    if a_guard.dtype != b_guard.dtype {
        return Err(RetrogradError::DataTypeMismatch {
            expected: a_guard.dtype,
            actual: b_guard.dtype,
            operation: "add_op".to_string(),
        });
    }
    if a_guard.shape != b_guard.shape {
        return Err(RetrogradError::ShapeMismatch {
            expected: a_guard.shape.clone(),
            actual: b_guard.shape.clone(),
            operation: "add_op".to_string(),
        });
    }

    let shape = a_guard.shape.clone();
    let result = match (&a_guard.buffer, &b_guard.buffer) {
        (Buffer::F32(x), Buffer::F32(y)) => Tensor::new_f32(add_kernel(x, y), shape)?,
        (Buffer::F64(x), Buffer::F64(y)) => Tensor::new_f64(add_kernel(x, y), shape)?,
        _ => {
            return Err(RetrogradError::UnsupportedOperation(format!(
                "add_op is only defined for floating point tensors, got {:?}",
                a_guard.dtype
            )))
        }
    };
    Ok(place_on(result, a_guard.device))
}

fn sum_to_kernel<T: Float + AddAssign>(data: &[T], shape: &[usize], target: &[usize]) -> Vec<T> {
    let target_numel: usize = target.iter().product();
    let mut out = vec![T::zero(); target_numel];
    let rank_diff = shape.len() - target.len();

    let mut coords = vec![0usize; shape.len()];
    for &value in data {
        let mut target_index = 0;
        for (j, &target_dim) in target.iter().enumerate() {
            let coord = if target_dim == 1 { 0 } else { coords[rank_diff + j] };
            target_index = target_index * target_dim + coord;
        }
        out[target_index] += value;

        // Row-major coordinate increment
        for dim in (0..shape.len()).rev() {
            coords[dim] += 1;
            if coords[dim] < shape[dim] {
                break;
            }
            coords[dim] = 0;
        }
    }
    out
}

/// Reduces a tensor to `target_shape` by summing over broadcasted dimensions.
///
/// The backward-pass counterpart of broadcasting: extra leading dimensions
/// and dimensions where the target is 1 are summed away.
pub fn sum_to_op(tensor: &Tensor, target_shape: &[usize]) -> Result<Tensor, RetrogradError> {
    let guard = tensor.read_data();
    if guard.shape == target_shape {
        drop(guard);
        return Ok(tensor.clone());
    }
    if !is_expandable_to(target_shape, &guard.shape) {
        return Err(RetrogradError::ShapeMismatch {
            expected: target_shape.to_vec(),
            actual: guard.shape.clone(),
            operation: "sum_to_op".to_string(),
        });
    }

    let result = match &guard.buffer {
        Buffer::F32(data) => Tensor::new_f32(
            sum_to_kernel(data, &guard.shape, target_shape),
            target_shape.to_vec(),
        )?,
        Buffer::F64(data) => Tensor::new_f64(
            sum_to_kernel(data, &guard.shape, target_shape),
            target_shape.to_vec(),
        )?,
        Buffer::I64(_) => {
            return Err(RetrogradError::UnsupportedOperation(
                "sum_to_op is only defined for floating point tensors".to_string(),
            ))
        }
    };
    Ok(place_on(result, guard.device))
}

/// Converts a tensor to `dtype`. A no-op (cheap clone) when the dtype already
/// matches.
pub fn cast_op(tensor: &Tensor, dtype: DType) -> Result<Tensor, RetrogradError> {
    let guard = tensor.read_data();
    if guard.dtype == dtype {
        drop(guard);
        return Ok(tensor.clone());
    }

    let values: Vec<f64> = match &guard.buffer {
        Buffer::F32(data) => data.iter().map(|&v| v as f64).collect(),
        Buffer::F64(data) => data.as_ref().clone(),
        Buffer::I64(data) => data.iter().map(|&v| v as f64).collect(),
    };
    let shape = guard.shape.clone();

    let result = match dtype {
        DType::F32 => Tensor::new_f32(values.into_iter().map(|v| v as f32).collect(), shape)?,
        DType::F64 => Tensor::new_f64(values, shape)?,
        DType::I64 => Tensor::new_i64(values.into_iter().map(|v| v as i64).collect(), shape)?,
    };
    Ok(place_on(result, guard.device))
}

/// True if any element of a floating point tensor is NaN.
pub fn has_nan_op(tensor: &Tensor) -> Result<bool, RetrogradError> {
    let guard = tensor.read_data();
    Ok(match &guard.buffer {
        Buffer::F32(data) => data.iter().any(|v| v.is_nan()),
        Buffer::F64(data) => data.iter().any(|v| v.is_nan()),
        Buffer::I64(_) => false,
    })
}

#[cfg(test)]
#[path = "ops_test.rs"]
mod tests;
