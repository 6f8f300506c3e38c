//! Normalization, softmax and reduction kernels.

use diffjit_core::error::{Error, Result};

use super::Activation;
use crate::shape::normalize_dim;
use crate::tensor::Tensor;

fn check_affine(affine: Option<(&Tensor, &Tensor)>, len: usize) -> Result<Option<(Vec<f32>, Vec<f32>)>> {
    match affine {
        None => Ok(None),
        Some((w, b)) => {
            if w.shape() != [len] {
                return Err(Error::shape_mismatch(&[len], w.shape()));
            }
            if b.shape() != [len] {
                return Err(Error::shape_mismatch(&[len], b.shape()));
            }
            Ok(Some((w.values(), b.values())))
        }
    }
}

/// Group normalization, optionally followed by SiLU in the same pass.
pub(crate) fn group_norm(
    x: &Tensor,
    groups: usize,
    affine: Option<(&Tensor, &Tensor)>,
    eps: f64,
    silu: bool,
) -> Result<Tensor> {
    if x.ndim() < 2 {
        return Err(Error::invalid_operation(format!(
            "group_norm needs [N, C, ...], got {:?}",
            x.shape()
        )));
    }
    let (n, c) = (x.shape()[0], x.shape()[1]);
    if groups == 0 || c % groups != 0 {
        return Err(Error::invalid_operation(format!(
            "{c} channels cannot be split into {groups} groups"
        )));
    }
    let params = check_affine(affine, c)?;
    let spatial = x.numel() / (n * c).max(1);
    let per_group = c / groups;
    let group_len = per_group * spatial;
    let eps = eps as f32;
    let dtype = x.dtype();

    let mut values = x.values();
    for ni in 0..n {
        for g in 0..groups {
            let start = (ni * c + g * per_group) * spatial;
            let chunk = &mut values[start..start + group_len];
            let mean = chunk.iter().sum::<f32>() / group_len as f32;
            let var = chunk.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / group_len as f32;
            let inv_std = 1.0 / (var + eps).sqrt();
            for (i, v) in chunk.iter_mut().enumerate() {
                let ch = g * per_group + i / spatial;
                let mut y = (*v - mean) * inv_std;
                if let Some((w, b)) = &params {
                    y = y * w[ch] + b[ch];
                }
                if silu {
                    y = Activation::Silu.apply(dtype.round(y));
                }
                *v = y;
            }
        }
    }

    Ok(Tensor::from_logical(
        values,
        x.shape().to_vec(),
        dtype,
        x.device(),
        x.memory_format(),
    ))
}

/// Layer normalization over the last dimension.
pub(crate) fn layer_norm(
    x: &Tensor,
    affine: Option<(&Tensor, &Tensor)>,
    eps: f64,
) -> Result<Tensor> {
    let d = *x
        .shape()
        .last()
        .ok_or_else(|| Error::invalid_operation("layer_norm on a scalar"))?;
    let params = check_affine(affine, d)?;
    let eps = eps as f32;

    let mut values = x.values();
    for row in values.chunks_mut(d.max(1)) {
        let mean = row.iter().sum::<f32>() / d as f32;
        let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / d as f32;
        let inv_std = 1.0 / (var + eps).sqrt();
        for (i, v) in row.iter_mut().enumerate() {
            let mut y = (*v - mean) * inv_std;
            if let Some((w, b)) = &params {
                y = y * w[i] + b[i];
            }
            *v = y;
        }
    }

    Ok(Tensor::from_logical(
        values,
        x.shape().to_vec(),
        x.dtype(),
        x.device(),
        x.memory_format(),
    ))
}

fn outer_inner(shape: &[usize], dim: usize) -> (usize, usize, usize) {
    let outer = shape[..dim].iter().product();
    let inner = shape[dim + 1..].iter().product();
    (outer, shape[dim], inner)
}

/// Numerically stable softmax along `dim`.
pub(crate) fn softmax(x: &Tensor, dim: i64) -> Result<Tensor> {
    let dim = normalize_dim(dim, x.ndim())?;
    let (outer, len, inner) = outer_inner(x.shape(), dim);
    let mut values = x.values();

    for o in 0..outer {
        for i in 0..inner {
            let at = |k: usize| (o * len + k) * inner + i;
            let max = (0..len).map(|k| values[at(k)]).fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0f32;
            for k in 0..len {
                let e = (values[at(k)] - max).exp();
                values[at(k)] = e;
                sum += e;
            }
            for k in 0..len {
                values[at(k)] /= sum;
            }
        }
    }

    Ok(Tensor::from_logical(
        values,
        x.shape().to_vec(),
        x.dtype(),
        x.device(),
        x.memory_format(),
    ))
}

/// Sum or mean along `dim`.
pub(crate) fn reduce(x: &Tensor, dim: i64, keepdim: bool, mean: bool) -> Result<Tensor> {
    let dim = normalize_dim(dim, x.ndim())?;
    let (outer, len, inner) = outer_inner(x.shape(), dim);
    let values = x.values();

    let mut out = vec![0.0f32; outer * inner];
    for o in 0..outer {
        for i in 0..inner {
            let s: f32 = (0..len).map(|k| values[(o * len + k) * inner + i]).sum();
            out[o * inner + i] = if mean { s / len.max(1) as f32 } else { s };
        }
    }

    let mut shape = x.shape().to_vec();
    if keepdim {
        shape[dim] = 1;
    } else {
        shape.remove(dim);
    }
    Ok(Tensor::from_logical(
        out,
        shape,
        x.dtype(),
        x.device(),
        Default::default(),
    ))
}

#[cfg(test)]
mod tests {
    use crate::tensor::Tensor;

    #[test]
    fn test_group_norm_zero_mean_unit_var() {
        let x = Tensor::from_vec((0..16).map(|v| v as f32).collect(), &[1, 4, 2, 2]).unwrap();
        let y = x.group_norm(2, None, 1e-5).unwrap().to_vec();
        let first: f32 = y[..8].iter().sum();
        assert!(first.abs() < 1e-4);
        let var: f32 = y[..8].iter().map(|v| v * v).sum::<f32>() / 8.0;
        assert!((var - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_group_norm_rejects_bad_groups() {
        let x = Tensor::from_vec(vec![0.0; 6], &[1, 3, 2]).unwrap();
        assert!(x.group_norm(2, None, 1e-5).is_err());
    }

    #[test]
    fn test_layer_norm_affine() {
        let x = Tensor::from_vec(vec![1.0, 3.0], &[1, 2]).unwrap();
        let w = Tensor::from_vec(vec![2.0, 2.0], &[2]).unwrap();
        let b = Tensor::from_vec(vec![1.0, 1.0], &[2]).unwrap();
        let y = x.layer_norm(Some((&w, &b)), 0.0).unwrap().to_vec();
        assert!((y[0] + 1.0).abs() < 1e-5);
        assert!((y[1] - 3.0).abs() < 1e-5);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let x = Tensor::from_vec(vec![1.0, 2.0, 3.0, 0.0, 0.0, 0.0], &[2, 3]).unwrap();
        let y = x.softmax(-1).unwrap().to_vec();
        assert!((y[..3].iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!((y[3] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_reduce() {
        let x = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
        assert_eq!(x.sum_dim(0, false).unwrap().to_vec(), vec![4.0, 6.0]);
        let m = x.mean_dim(1, true).unwrap();
        assert_eq!(m.shape(), &[2, 1]);
        assert_eq!(m.to_vec(), vec![1.5, 3.5]);
    }
}
