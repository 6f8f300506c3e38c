//! Shape Utilities - Tensor Dimension Management
//!
//! Broadcasting rules, reshape inference and index arithmetic shared by the
//! reference kernels.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use diffjit_core::error::{Error, Result};

/// Computes the total number of elements from a shape.
#[must_use]
pub fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Computes row-major (C-order) strides for a shape.
#[must_use]
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Converts a linear index into multi-dimensional indices.
#[must_use]
pub fn unravel_index(mut linear: usize, shape: &[usize]) -> Vec<usize> {
    let mut indices = vec![0usize; shape.len()];
    for i in (0..shape.len()).rev() {
        if shape[i] > 0 {
            indices[i] = linear % shape[i];
            linear /= shape[i];
        }
    }
    indices
}

/// Computes the broadcast shape of two shapes following `NumPy` rules.
pub fn broadcast_shape(shape1: &[usize], shape2: &[usize]) -> Result<Vec<usize>> {
    let max_ndim = shape1.len().max(shape2.len());
    let mut result = Vec::with_capacity(max_ndim);

    // Iterate from right to left
    for i in 0..max_ndim {
        let d1 = if i < shape1.len() {
            shape1[shape1.len() - 1 - i]
        } else {
            1
        };
        let d2 = if i < shape2.len() {
            shape2[shape2.len() - 1 - i]
        } else {
            1
        };

        if d1 == d2 || d2 == 1 {
            result.push(d1);
        } else if d1 == 1 {
            result.push(d2);
        } else {
            return Err(Error::BroadcastError {
                shape1: shape1.to_vec(),
                shape2: shape2.to_vec(),
            });
        }
    }

    result.reverse();
    Ok(result)
}

/// Maps an output index of a broadcast result back into an operand.
#[must_use]
pub fn broadcast_source_index(out_index: &[usize], src_shape: &[usize]) -> usize {
    let offset = out_index.len() - src_shape.len();
    let mut linear = 0usize;
    for (i, &dim) in src_shape.iter().enumerate() {
        let idx = if dim == 1 { 0 } else { out_index[offset + i] };
        linear = linear * dim + idx;
    }
    linear
}

/// Resolves a reshape target, inferring a single `-1` dimension.
pub fn reshape(old_shape: &[usize], new_shape: &[isize]) -> Result<Vec<usize>> {
    let old_numel = numel(old_shape);
    let mut result = Vec::with_capacity(new_shape.len());
    let mut infer_idx = None;
    let mut known_numel = 1usize;

    for (i, &dim) in new_shape.iter().enumerate() {
        if dim == -1 {
            if infer_idx.is_some() {
                return Err(Error::invalid_operation("Can only have one -1 in reshape"));
            }
            infer_idx = Some(i);
            result.push(0);
        } else if dim < 0 {
            return Err(Error::invalid_operation("Invalid dimension in reshape"));
        } else {
            let d = dim as usize;
            known_numel *= d;
            result.push(d);
        }
    }

    if let Some(idx) = infer_idx {
        if known_numel == 0 || old_numel % known_numel != 0 {
            return Err(Error::invalid_operation(
                "Cannot infer dimension: not evenly divisible",
            ));
        }
        result[idx] = old_numel / known_numel;
    } else if known_numel != old_numel {
        return Err(Error::shape_mismatch(old_shape, &result));
    }

    Ok(result)
}

/// Normalizes a possibly negative dimension index.
pub fn normalize_dim(dim: i64, ndim: usize) -> Result<usize> {
    let ndim_i64 = ndim as i64;
    let normalized = if dim < 0 { dim + ndim_i64 } else { dim };
    if normalized < 0 || normalized >= ndim_i64 {
        return Err(Error::InvalidDimension { index: dim, ndim });
    }
    Ok(normalized as usize)
}

/// Validates a permutation and returns the permuted shape.
pub fn permute_shape(shape: &[usize], dims: &[usize]) -> Result<Vec<usize>> {
    if dims.len() != shape.len() {
        return Err(Error::invalid_operation(format!(
            "permute expects {} dims, got {}",
            shape.len(),
            dims.len()
        )));
    }
    let mut seen = vec![false; dims.len()];
    for &d in dims {
        if d >= dims.len() || seen[d] {
            return Err(Error::invalid_operation(format!(
                "invalid permutation {dims:?}"
            )));
        }
        seen[d] = true;
    }
    Ok(dims.iter().map(|&d| shape[d]).collect())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_strides() {
        assert_eq!(contiguous_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert!(contiguous_strides(&[]).is_empty());
    }

    #[test]
    fn test_broadcast_shape() {
        assert_eq!(broadcast_shape(&[2, 1, 4], &[3, 4]).unwrap(), vec![2, 3, 4]);
        assert_eq!(broadcast_shape(&[5], &[1]).unwrap(), vec![5]);
        assert!(broadcast_shape(&[2, 3], &[4, 3]).is_err());
    }

    #[test]
    fn test_broadcast_source_index() {
        // bias of shape [3] broadcast over [2, 3]
        assert_eq!(broadcast_source_index(&[1, 2], &[3]), 2);
        // column vector [2, 1] broadcast over [2, 3]
        assert_eq!(broadcast_source_index(&[1, 2], &[2, 1]), 1);
    }

    #[test]
    fn test_reshape_infer() {
        assert_eq!(reshape(&[2, 3, 4], &[-1, 4]).unwrap(), vec![6, 4]);
        assert!(reshape(&[2, 3], &[4, -1]).is_err());
        assert!(reshape(&[2, 3], &[-1, -1]).is_err());
    }

    #[test]
    fn test_normalize_dim() {
        assert_eq!(normalize_dim(-1, 3).unwrap(), 2);
        assert!(normalize_dim(3, 3).is_err());
    }

    #[test]
    fn test_unravel_and_permute() {
        assert_eq!(unravel_index(5, &[2, 3]), vec![1, 2]);
        assert_eq!(permute_shape(&[2, 3, 4], &[2, 0, 1]).unwrap(), vec![4, 2, 3]);
        assert!(permute_shape(&[2, 3], &[0, 0]).is_err());
    }
}
