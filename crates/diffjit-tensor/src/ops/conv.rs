//! 2-D convolution kernel.
//!
//! Reads the input buffer in whichever physical layout it has. Channels-last
//! inputs produce channels-last outputs.

use diffjit_core::error::{Error, Result};
use diffjit_core::MemoryFormat;

use super::{promote, Activation};
use crate::tensor::Tensor;

/// `act(conv(x, w) + b + residual)`, rounding between stages.
pub(crate) fn conv2d(
    x: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    stride: usize,
    padding: usize,
    residual: Option<&Tensor>,
    activation: Option<Activation>,
) -> Result<Tensor> {
    if x.ndim() != 4 || weight.ndim() != 4 {
        return Err(Error::invalid_operation(format!(
            "conv2d needs 4-D input and weight, got {:?} and {:?}",
            x.shape(),
            weight.shape()
        )));
    }
    if stride == 0 {
        return Err(Error::invalid_operation("conv2d stride must be positive"));
    }
    let (n, c, h, w) = (x.shape()[0], x.shape()[1], x.shape()[2], x.shape()[3]);
    let (o, wc, kh, kw) = (
        weight.shape()[0],
        weight.shape()[1],
        weight.shape()[2],
        weight.shape()[3],
    );
    if wc != c {
        return Err(Error::shape_mismatch(&[o, c, kh, kw], weight.shape()));
    }
    if h + 2 * padding < kh || w + 2 * padding < kw {
        return Err(Error::invalid_operation(format!(
            "conv2d kernel {kh}x{kw} larger than padded input {}x{}",
            h + 2 * padding,
            w + 2 * padding
        )));
    }
    if let Some(b) = bias {
        if b.shape() != [o] {
            return Err(Error::shape_mismatch(&[o], b.shape()));
        }
    }
    let ho = (h + 2 * padding - kh) / stride + 1;
    let wo = (w + 2 * padding - kw) / stride + 1;
    let out_shape = vec![n, o, ho, wo];
    if let Some(r) = residual {
        if r.shape() != out_shape.as_slice() {
            return Err(Error::shape_mismatch(&out_shape, r.shape()));
        }
    }

    let dtype = promote(x.dtype(), weight.dtype());
    let channels_last = x.memory_format() == MemoryFormat::ChannelsLast;
    let wv = weight.values();
    let bv = bias.map(Tensor::values);
    let rv = residual.map(Tensor::values);
    let xs = x.storage().read();
    let x_at = |ni: usize, ci: usize, hi: usize, wi: usize| -> f32 {
        if channels_last {
            xs[((ni * h + hi) * w + wi) * c + ci]
        } else {
            xs[((ni * c + ci) * h + hi) * w + wi]
        }
    };
    let staged = residual.is_some() || activation.is_some();

    let mut out = vec![0.0f32; n * o * ho * wo];
    for ni in 0..n {
        for oi in 0..o {
            for y in 0..ho {
                for xo in 0..wo {
                    let mut acc = 0.0f32;
                    for ci in 0..c {
                        for ki in 0..kh {
                            let hi = (y * stride + ki) as isize - padding as isize;
                            if hi < 0 || hi >= h as isize {
                                continue;
                            }
                            for kj in 0..kw {
                                let wi = (xo * stride + kj) as isize - padding as isize;
                                if wi < 0 || wi >= w as isize {
                                    continue;
                                }
                                acc += x_at(ni, ci, hi as usize, wi as usize)
                                    * wv[((oi * c + ci) * kh + ki) * kw + kj];
                            }
                        }
                    }
                    if let Some(bv) = &bv {
                        acc += bv[oi];
                    }
                    let idx = ((ni * o + oi) * ho + y) * wo + xo;
                    if staged {
                        acc = dtype.round(acc);
                    }
                    if let Some(rv) = &rv {
                        acc += rv[idx];
                        if activation.is_some() {
                            acc = dtype.round(acc);
                        }
                    }
                    if let Some(act) = activation {
                        acc = act.apply(acc);
                    }
                    out[idx] = acc;
                }
            }
        }
    }

    let out_dtype = residual.map_or(dtype, |r| promote(dtype, r.dtype()));
    Ok(Tensor::from_logical(
        out,
        out_shape,
        out_dtype,
        x.device(),
        x.memory_format(),
    ))
}
