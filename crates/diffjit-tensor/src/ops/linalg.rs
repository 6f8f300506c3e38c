//! Matrix multiplication and affine kernels.
//!
//! The reduced-precision path sums the inner dimension in blocks of
//! [`LOWP_BLOCK`] and rounds every partial sum to the output dtype, which is
//! what half-precision GEMM kernels with reduced-precision reduction do.

use diffjit_core::error::{Error, Result};
use diffjit_core::DType;

use super::{promote, Activation};
use crate::shape::{broadcast_shape, broadcast_source_index, numel, unravel_index};
use crate::tensor::Tensor;

/// Inner-dimension block size of reduced-precision accumulation.
pub const LOWP_BLOCK: usize = 64;

fn accumulate(len: usize, dtype: DType, lowp: bool, term: impl Fn(usize) -> f32) -> f32 {
    if !lowp {
        return (0..len).map(&term).sum();
    }
    let mut acc = 0.0f32;
    for start in (0..len).step_by(LOWP_BLOCK) {
        let end = (start + LOWP_BLOCK).min(len);
        let partial: f32 = (start..end).map(&term).sum();
        acc = dtype.round(acc + dtype.round(partial));
    }
    acc
}

pub(crate) fn matmul(a: &Tensor, b: &Tensor, lowp: bool) -> Result<Tensor> {
    if a.ndim() < 2 || b.ndim() < 2 {
        return Err(Error::invalid_operation(format!(
            "matmul needs operands of rank >= 2, got {:?} and {:?}",
            a.shape(),
            b.shape()
        )));
    }
    let (m, k) = (a.shape()[a.ndim() - 2], a.shape()[a.ndim() - 1]);
    let (k2, n) = (b.shape()[b.ndim() - 2], b.shape()[b.ndim() - 1]);
    if k != k2 {
        return Err(Error::shape_mismatch(&[m, k], &[k2, n]));
    }

    let a_batch = &a.shape()[..a.ndim() - 2];
    let b_batch = &b.shape()[..b.ndim() - 2];
    let batch_shape = broadcast_shape(a_batch, b_batch)?;
    let batch = numel(&batch_shape);

    let dtype = promote(a.dtype(), b.dtype());
    let av = a.values();
    let bv = b.values();
    let mut out = vec![0.0f32; batch * m * n];

    for bi in 0..batch {
        let idx = unravel_index(bi, &batch_shape);
        let a_off = broadcast_source_index(&idx, a_batch) * m * k;
        let b_off = broadcast_source_index(&idx, b_batch) * k * n;
        for i in 0..m {
            for j in 0..n {
                out[bi * m * n + i * n + j] = accumulate(k, dtype, lowp, |p| {
                    av[a_off + i * k + p] * bv[b_off + p * n + j]
                });
            }
        }
    }

    let mut shape = batch_shape;
    shape.push(m);
    shape.push(n);
    Ok(Tensor::from_logical(out, shape, dtype, a.device(), Default::default()))
}

/// `act(x @ w^T + b) + residual`, rounding to the output dtype between
/// stages so the fused form matches the unfused sequence.
pub(crate) fn linear(
    x: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    activation: Option<Activation>,
    lowp: bool,
    residual: Option<&Tensor>,
) -> Result<Tensor> {
    if weight.ndim() != 2 || x.ndim() == 0 {
        return Err(Error::invalid_operation(format!(
            "linear needs x[..., in] and weight[out, in], got {:?} and {:?}",
            x.shape(),
            weight.shape()
        )));
    }
    let (out_features, in_features) = (weight.shape()[0], weight.shape()[1]);
    let x_last = x.shape()[x.ndim() - 1];
    if x_last != in_features {
        return Err(Error::shape_mismatch(&[in_features], &[x_last]));
    }
    if let Some(b) = bias {
        if b.shape() != [out_features] {
            return Err(Error::shape_mismatch(&[out_features], b.shape()));
        }
    }

    let mut out_shape = x.shape().to_vec();
    out_shape[x.ndim() - 1] = out_features;
    if let Some(r) = residual {
        if r.shape() != out_shape.as_slice() {
            return Err(Error::shape_mismatch(&out_shape, r.shape()));
        }
    }

    let dtype = promote(x.dtype(), weight.dtype());
    let rows = x.numel() / in_features.max(1);
    let xv = x.values();
    let wv = weight.values();
    let bv = bias.map(Tensor::values);
    let rv = residual.map(Tensor::values);

    let mut out = vec![0.0f32; rows * out_features];
    for r in 0..rows {
        for o in 0..out_features {
            let mut y = accumulate(in_features, dtype, lowp, |p| {
                xv[r * in_features + p] * wv[o * in_features + p]
            });
            if let Some(bv) = &bv {
                y += bv[o];
            }
            if activation.is_some() || rv.is_some() {
                y = dtype.round(y);
            }
            if let Some(act) = activation {
                y = act.apply(y);
                if rv.is_some() {
                    y = dtype.round(y);
                }
            }
            if let Some(rv) = &rv {
                y += rv[r * out_features + o];
            }
            out[r * out_features + o] = y;
        }
    }

    let out_dtype = residual.map_or(dtype, |r| promote(dtype, r.dtype()));
    Ok(Tensor::from_logical(
        out,
        out_shape,
        out_dtype,
        x.device(),
        Default::default(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use diffjit_core::Device;

    #[test]
    fn test_matmul_2d() {
        let a = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
        let b = Tensor::from_vec(vec![5.0, 6.0, 7.0, 8.0], &[2, 2]).unwrap();
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.to_vec(), vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_matmul_batched_broadcast() {
        let a = Tensor::from_vec((0..12).map(|v| v as f32).collect(), &[2, 2, 3]).unwrap();
        let b = Tensor::from_vec(vec![1.0, 0.0, 0.0, 1.0, 0.0, 0.0], &[3, 2]).unwrap();
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.shape(), &[2, 2, 2]);
        assert_eq!(c.to_vec(), vec![0.0, 1.0, 3.0, 4.0, 6.0, 7.0, 9.0, 10.0]);
    }

    #[test]
    fn test_matmul_inner_mismatch() {
        let a = Tensor::from_vec(vec![1.0; 6], &[2, 3]).unwrap();
        let b = Tensor::from_vec(vec![1.0; 4], &[2, 2]).unwrap();
        assert!(a.matmul(&b).is_err());
    }

    #[test]
    fn test_linear_with_bias() {
        let x = Tensor::from_vec(vec![1.0, 2.0], &[1, 2]).unwrap();
        let w = Tensor::from_vec(vec![1.0, 1.0, 2.0, -1.0], &[2, 2]).unwrap();
        let b = Tensor::from_vec(vec![0.5, -0.5], &[2]).unwrap();
        let y = x.linear(&w, Some(&b)).unwrap();
        assert_eq!(y.to_vec(), vec![3.5, -0.5]);
    }

    #[test]
    fn test_lowp_accumulation_close_to_full() {
        let k = 256;
        let a_data: Vec<f32> = (0..k).map(|i| 0.01 + (i % 7) as f32 * 0.013).collect();
        let b_data: Vec<f32> = (0..k).map(|i| 0.02 + (i % 5) as f32 * 0.011).collect();
        let a = Tensor::from_vec_with(a_data, &[1, k], DType::F16, Device::Cpu).unwrap();
        let b = Tensor::from_vec_with(b_data, &[k, 1], DType::F16, Device::Cpu).unwrap();
        let full = matmul(&a, &b, false).unwrap().to_vec()[0];
        let lowp = matmul(&a, &b, true).unwrap().to_vec()[0];
        assert!((full - lowp).abs() / full.abs() < 1e-2);
    }

    #[test]
    fn test_lowp_exact_for_f32_small_k() {
        let a = Tensor::from_vec(vec![1.0, 2.0, 3.0], &[1, 3]).unwrap();
        let b = Tensor::from_vec(vec![4.0, 5.0, 6.0], &[3, 1]).unwrap();
        assert_eq!(
            matmul(&a, &b, true).unwrap().to_vec(),
            matmul(&a, &b, false).unwrap().to_vec()
        );
    }
}
