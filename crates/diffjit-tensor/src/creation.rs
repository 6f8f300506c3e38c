//! Tensor Creation Functions
//!
//! Constructors for filled, ranged and random tensors. Random sampling
//! cannot be replayed from a recording, so it marks an active trace as
//! untraceable.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use diffjit_core::{DType, Device, MemoryFormat};

use crate::shape::numel;
use crate::tensor::Tensor;
use crate::trace;

/// Creates a tensor filled with `value`.
#[must_use]
pub fn full(shape: &[usize], value: f32, dtype: DType, device: Device) -> Tensor {
    Tensor::from_logical(
        vec![value; numel(shape)],
        shape.to_vec(),
        dtype,
        device,
        MemoryFormat::Contiguous,
    )
}

/// Creates an `f32` CPU tensor of zeros.
#[must_use]
pub fn zeros(shape: &[usize]) -> Tensor {
    full(shape, 0.0, DType::F32, Device::Cpu)
}

/// Creates an `f32` CPU tensor of ones.
#[must_use]
pub fn ones(shape: &[usize]) -> Tensor {
    full(shape, 1.0, DType::F32, Device::Cpu)
}

/// Creates a zero tensor matching another tensor's shape, dtype and device.
#[must_use]
pub fn zeros_like(other: &Tensor) -> Tensor {
    full(other.shape(), 0.0, other.dtype(), other.device())
}

/// Creates a 1-D tensor `[start, start + step, ...)` below `end`.
#[must_use]
pub fn arange(start: f32, end: f32, step: f32) -> Tensor {
    let mut values = Vec::new();
    if step != 0.0 {
        let mut v = start;
        while (step > 0.0 && v < end) || (step < 0.0 && v > end) {
            values.push(v);
            v += step;
        }
    }
    let len = values.len();
    Tensor::from_logical(
        values,
        vec![len],
        DType::F32,
        Device::Cpu,
        MemoryFormat::Contiguous,
    )
}

/// Standard-normal samples from the thread RNG.
#[must_use]
pub fn randn(shape: &[usize]) -> Tensor {
    trace::flag_untraceable("random sampling");
    let mut rng = rand::thread_rng();
    sample_normal(&mut rng, shape)
}

/// Standard-normal samples from a seeded RNG, for reproducible inputs.
#[must_use]
pub fn randn_seeded(shape: &[usize], seed: u64) -> Tensor {
    trace::flag_untraceable("random sampling");
    let mut rng = StdRng::seed_from_u64(seed);
    sample_normal(&mut rng, shape)
}

/// Uniform samples in `[low, high)` from a seeded RNG.
#[must_use]
pub fn uniform_seeded(shape: &[usize], low: f32, high: f32, seed: u64) -> Tensor {
    trace::flag_untraceable("random sampling");
    let mut rng = StdRng::seed_from_u64(seed);
    let values = (0..numel(shape)).map(|_| rng.gen_range(low..high)).collect();
    Tensor::from_logical(
        values,
        shape.to_vec(),
        DType::F32,
        Device::Cpu,
        MemoryFormat::Contiguous,
    )
}

fn sample_normal<R: Rng>(rng: &mut R, shape: &[usize]) -> Tensor {
    let values = (0..numel(shape))
        .map(|_| rng.sample::<f32, _>(StandardNormal))
        .collect();
    Tensor::from_logical(
        values,
        shape.to_vec(),
        DType::F32,
        Device::Cpu,
        MemoryFormat::Contiguous,
    )
}
