//! Shape, layout and dtype conversions.
//!
//! Views and reshapes of contiguous tensors share storage with their input.

use diffjit_core::error::{Error, Result};
use diffjit_core::{DType, MemoryFormat};

use crate::shape::{contiguous_strides, normalize_dim, numel, permute_shape, reshape as resolve_shape, unravel_index};
use crate::tensor::Tensor;

pub(crate) fn contiguous(x: &Tensor) -> Tensor {
    match x.memory_format() {
        MemoryFormat::Contiguous => x.alias(),
        MemoryFormat::ChannelsLast => Tensor::from_logical(
            x.values(),
            x.shape().to_vec(),
            x.dtype(),
            x.device(),
            MemoryFormat::Contiguous,
        ),
    }
}

pub(crate) fn view(x: &Tensor, shape: &[isize]) -> Result<Tensor> {
    if x.memory_format() != MemoryFormat::Contiguous {
        return Err(Error::invalid_operation(
            "view requires a contiguous tensor, use reshape instead",
        ));
    }
    let new_shape = resolve_shape(x.shape(), shape)?;
    Ok(Tensor::from_storage(
        x.storage().clone(),
        new_shape,
        x.dtype(),
        MemoryFormat::Contiguous,
    ))
}

pub(crate) fn reshape(x: &Tensor, shape: &[isize]) -> Result<Tensor> {
    let new_shape = resolve_shape(x.shape(), shape)?;
    Ok(match x.memory_format() {
        MemoryFormat::Contiguous => Tensor::from_storage(
            x.storage().clone(),
            new_shape,
            x.dtype(),
            MemoryFormat::Contiguous,
        ),
        MemoryFormat::ChannelsLast => Tensor::from_logical(
            x.values(),
            new_shape,
            x.dtype(),
            x.device(),
            MemoryFormat::Contiguous,
        ),
    })
}

pub(crate) fn permute(x: &Tensor, dims: &[usize]) -> Result<Tensor> {
    let out_shape = permute_shape(x.shape(), dims)?;
    let strides = contiguous_strides(x.shape());
    let values = x.values();
    let out: Vec<f32> = (0..numel(&out_shape))
        .map(|i| {
            let idx = unravel_index(i, &out_shape);
            let src: usize = idx
                .iter()
                .zip(dims)
                .map(|(&pos, &d)| pos * strides[d])
                .sum();
            values[src]
        })
        .collect();
    Ok(Tensor::from_logical(
        out,
        out_shape,
        x.dtype(),
        x.device(),
        MemoryFormat::Contiguous,
    ))
}

pub(crate) fn transpose(x: &Tensor, dim0: i64, dim1: i64) -> Result<Tensor> {
    let d0 = normalize_dim(dim0, x.ndim())?;
    let d1 = normalize_dim(dim1, x.ndim())?;
    let mut dims: Vec<usize> = (0..x.ndim()).collect();
    dims.swap(d0, d1);
    permute(x, &dims)
}

pub(crate) fn cast(x: &Tensor, dtype: DType) -> Tensor {
    Tensor::from_logical(
        x.values(),
        x.shape().to_vec(),
        dtype,
        x.device(),
        x.memory_format(),
    )
}

pub(crate) fn to_memory_format(x: &Tensor, format: MemoryFormat) -> Tensor {
    if format.effective(x.ndim()) == x.memory_format() {
        return x.alias();
    }
    Tensor::from_logical(
        x.values(),
        x.shape().to_vec(),
        x.dtype(),
        x.device(),
        format,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_shares_storage() {
        let x = Tensor::from_vec(vec![1.0; 6], &[2, 3]).unwrap();
        let v = x.view(&[3, -1]).unwrap();
        assert_eq!(v.shape(), &[3, 2]);
        assert!(v.shares_storage(&x));
    }

    #[test]
    fn test_view_rejects_channels_last_but_reshape_copies() {
        let x = Tensor::from_vec((0..8).map(|v| v as f32).collect(), &[1, 2, 2, 2])
            .unwrap()
            .to_memory_format(MemoryFormat::ChannelsLast)
            .unwrap();
        assert!(x.view(&[2, 4]).is_err());
        let r = x.reshape(&[2, 4]).unwrap();
        assert_eq!(r.to_vec(), (0..8).map(|v| v as f32).collect::<Vec<_>>());
        assert!(!r.shares_storage(&x));
    }

    #[test]
    fn test_transpose() {
        let x = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
        let t = x.transpose(0, 1).unwrap();
        assert_eq!(t.shape(), &[3, 2]);
        assert_eq!(t.to_vec(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_cast_rounds() {
        let x = Tensor::from_vec(vec![1.0 / 3.0], &[1]).unwrap();
        let h = x.to_dtype(DType::BF16).unwrap();
        assert_eq!(h.dtype(), DType::BF16);
        assert_ne!(h.to_vec()[0], 1.0 / 3.0);
    }

    #[test]
    fn test_contiguous_of_contiguous_aliases() {
        let x = Tensor::from_vec(vec![1.0, 2.0], &[2]).unwrap();
        let c = x.contiguous().unwrap();
        assert!(c.shares_storage(&x));
        assert_ne!(c.id(), x.id());
    }
}
