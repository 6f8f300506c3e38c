//! Elementwise kernels with `NumPy` broadcasting.

use diffjit_core::error::Result;
use diffjit_core::MemoryFormat;

use super::promote;
use crate::shape::{broadcast_shape, broadcast_source_index, numel, unravel_index};
use crate::tensor::Tensor;

/// Applies `f` to every element. Shape, dtype and format are preserved.
pub(crate) fn unary(a: &Tensor, f: impl Fn(f32) -> f32) -> Tensor {
    let values: Vec<f32> = a.values().into_iter().map(f).collect();
    Tensor::from_logical(
        values,
        a.shape().to_vec(),
        a.dtype(),
        a.device(),
        a.memory_format(),
    )
}

/// Applies `f` pairwise over the broadcast of both operands.
///
/// The output keeps the left operand's format when the shapes agree.
pub(crate) fn binary(a: &Tensor, b: &Tensor, f: impl Fn(f32, f32) -> f32) -> Result<Tensor> {
    let out_shape = broadcast_shape(a.shape(), b.shape())?;
    let av = a.values();
    let bv = b.values();

    let values: Vec<f32> = if a.shape() == b.shape() {
        av.iter().zip(bv.iter()).map(|(&x, &y)| f(x, y)).collect()
    } else {
        (0..numel(&out_shape))
            .map(|i| {
                let idx = unravel_index(i, &out_shape);
                let x = av[broadcast_source_index(&idx, a.shape())];
                let y = bv[broadcast_source_index(&idx, b.shape())];
                f(x, y)
            })
            .collect()
    };

    let format = if out_shape == a.shape() {
        a.memory_format()
    } else {
        MemoryFormat::Contiguous
    };
    Ok(Tensor::from_logical(
        values,
        out_shape,
        promote(a.dtype(), b.dtype()),
        a.device(),
        format,
    ))
}

#[cfg(test)]
mod tests {
    use crate::tensor::Tensor;

    #[test]
    fn test_broadcast_add() {
        let a = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
        let b = Tensor::from_vec(vec![10.0, 20.0, 30.0], &[3]).unwrap();
        let c = a.add(&b).unwrap();
        assert_eq!(c.shape(), &[2, 3]);
        assert_eq!(c.to_vec(), vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
    }

    #[test]
    fn test_broadcast_failure() {
        let a = Tensor::from_vec(vec![1.0; 6], &[2, 3]).unwrap();
        let b = Tensor::from_vec(vec![1.0; 2], &[2]).unwrap();
        assert!(a.mul(&b).is_err());
    }

    #[test]
    fn test_activations() {
        let a = Tensor::from_vec(vec![-1.0, 0.0, 2.0], &[3]).unwrap();
        assert_eq!(a.relu().unwrap().to_vec(), vec![0.0, 0.0, 2.0]);
        let s = a.silu().unwrap().to_vec();
        assert!((s[2] - 2.0 / (1.0 + (-2.0f32).exp())).abs() < 1e-6);
        let g = a.gelu().unwrap().to_vec();
        assert!(g[1].abs() < 1e-7);
        assert!((g[2] - 1.9545977).abs() < 1e-4);
    }

    #[test]
    fn test_scalar_ops() {
        let a = Tensor::from_vec(vec![1.0, 2.0], &[2]).unwrap();
        assert_eq!(a.add_scalar(1.5).unwrap().to_vec(), vec![2.5, 3.5]);
        assert_eq!(a.mul_scalar(-2.0).unwrap().to_vec(), vec![-2.0, -4.0]);
        assert_eq!(a.neg().unwrap().to_vec(), vec![-1.0, -2.0]);
    }
}
