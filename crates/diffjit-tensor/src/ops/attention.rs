//! Scaled dot-product attention kernels.

use diffjit_core::error::{Error, Result};

use super::AttentionKernel;
use crate::tensor::Tensor;

/// Key block size of the memory-efficient kernel.
pub const MEMORY_EFFICIENT_CHUNK: usize = 32;

pub(crate) fn attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    scale: f64,
    kernel: AttentionKernel,
) -> Result<Tensor> {
    if q.ndim() < 2 || k.ndim() != q.ndim() || v.ndim() != q.ndim() {
        return Err(Error::invalid_operation(format!(
            "attention needs q, k, v of equal rank >= 2, got {:?}, {:?}, {:?}",
            q.shape(),
            k.shape(),
            v.shape()
        )));
    }
    let nd = q.ndim();
    let batch_dims = &q.shape()[..nd - 2];
    if &k.shape()[..nd - 2] != batch_dims || &v.shape()[..nd - 2] != batch_dims {
        return Err(Error::shape_mismatch(q.shape(), k.shape()));
    }
    let (lq, d) = (q.shape()[nd - 2], q.shape()[nd - 1]);
    let (lk, dk) = (k.shape()[nd - 2], k.shape()[nd - 1]);
    let (lv, dv) = (v.shape()[nd - 2], v.shape()[nd - 1]);
    if dk != d {
        return Err(Error::shape_mismatch(&[lk, d], &[lk, dk]));
    }
    if lv != lk {
        return Err(Error::shape_mismatch(&[lk, dv], &[lv, dv]));
    }

    let batch: usize = batch_dims.iter().product();
    let qv = q.values();
    let kv = k.values();
    let vv = v.values();
    let scale = scale as f32;
    let mut out = vec![0.0f32; batch * lq * dv];

    for b in 0..batch {
        let q_off = b * lq * d;
        let k_off = b * lk * d;
        let v_off = b * lk * dv;
        for i in 0..lq {
            let score = |j: usize| -> f32 {
                let qi = &qv[q_off + i * d..q_off + (i + 1) * d];
                let kj = &kv[k_off + j * d..k_off + (j + 1) * d];
                qi.iter().zip(kj).map(|(a, b)| a * b).sum::<f32>() * scale
            };
            let row = &mut out[(b * lq + i) * dv..(b * lq + i + 1) * dv];
            match kernel {
                AttentionKernel::Math => {
                    let scores: Vec<f32> = (0..lk).map(score).collect();
                    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                    let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
                    let sum: f32 = exps.iter().sum();
                    for (j, e) in exps.iter().enumerate() {
                        let p = e / sum;
                        for (c, o) in row.iter_mut().enumerate() {
                            *o += p * vv[v_off + j * dv + c];
                        }
                    }
                }
                AttentionKernel::MemoryEfficient => {
                    let mut running_max = f32::NEG_INFINITY;
                    let mut denom = 0.0f32;
                    for start in (0..lk).step_by(MEMORY_EFFICIENT_CHUNK) {
                        let end = (start + MEMORY_EFFICIENT_CHUNK).min(lk);
                        let scores: Vec<f32> = (start..end).map(score).collect();
                        let chunk_max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                        let new_max = running_max.max(chunk_max);
                        let correction = (running_max - new_max).exp();
                        denom *= correction;
                        row.iter_mut().for_each(|o| *o *= correction);
                        for (offset, s) in scores.iter().enumerate() {
                            let p = (s - new_max).exp();
                            denom += p;
                            let j = start + offset;
                            for (c, o) in row.iter_mut().enumerate() {
                                *o += p * vv[v_off + j * dv + c];
                            }
                        }
                        running_max = new_max;
                    }
                    row.iter_mut().for_each(|o| *o /= denom);
                }
            }
        }
    }

    let mut shape = batch_dims.to_vec();
    shape.push(lq);
    shape.push(dv);
    Ok(Tensor::from_logical(
        out,
        shape,
        q.dtype(),
        q.device(),
        Default::default(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::OpKind;

    fn qkv(lk: usize) -> (Tensor, Tensor, Tensor) {
        let q = Tensor::from_vec((0..16).map(|v| (v as f32 * 0.37).sin()).collect(), &[2, 2, 4])
            .unwrap();
        let k = Tensor::from_vec(
            (0..2 * lk * 4).map(|v| (v as f32 * 0.11).cos()).collect(),
            &[2, lk, 4],
        )
        .unwrap();
        let v = Tensor::from_vec(
            (0..2 * lk * 3).map(|v| (v as f32 * 0.07).sin()).collect(),
            &[2, lk, 3],
        )
        .unwrap();
        (q, k, v)
    }

    #[test]
    fn test_attention_shape() {
        let (q, k, v) = qkv(5);
        let y = q.attention(&k, &v, 0.5).unwrap();
        assert_eq!(y.shape(), &[2, 2, 3]);
    }

    #[test]
    fn test_uniform_scores_average_values() {
        let q = Tensor::from_vec(vec![0.0; 2], &[1, 1, 2]).unwrap();
        let k = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[1, 2, 2]).unwrap();
        let v = Tensor::from_vec(vec![1.0, 3.0], &[1, 2, 1]).unwrap();
        assert_eq!(q.attention(&k, &v, 1.0).unwrap().to_vec(), vec![2.0]);
    }

    #[test]
    fn test_memory_efficient_matches_math() {
        // more keys than one chunk
        let (q, k, v) = qkv(MEMORY_EFFICIENT_CHUNK * 2 + 3);
        let math = q.attention(&k, &v, 0.5).unwrap();
        let efficient = OpKind::Attention {
            scale: 0.5,
            kernel: AttentionKernel::MemoryEfficient,
        }
        .execute(&[&q, &k, &v])
        .unwrap();
        assert!(efficient.allclose(&math, 1e-5, 1e-6));
    }
}
