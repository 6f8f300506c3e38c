//! Reference Layers - Building Blocks for Pipeline Components
//!
//! Layers register their parameters in a shared [`ParamStore`] under a dotted
//! prefix and read them back on every forward call, so parameter updates and
//! memory-format conversions done through the store are always visible.
//!
//! Initialization is deterministic: each parameter is seeded from its name.
//!
//! # Example
//! ```rust
//! use std::sync::Arc;
//! use diffjit::nn::Linear;
//! use diffjit_jit::ParamStore;
//! use diffjit_tensor::creation;
//!
//! let store = Arc::new(ParamStore::new());
//! let proj = Linear::new(&store, "proj", 8, 4);
//! let y = proj.forward(&creation::ones(&[2, 8])).unwrap();
//! assert_eq!(y.shape(), &[2, 4]);
//! assert_eq!(store.len(), 2);
//! ```
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::hash::Hasher;
use std::sync::Arc;

use rustc_hash::FxHasher;

use diffjit_core::{Device, Result};
use diffjit_jit::ParamStore;
use diffjit_tensor::{creation, Tensor};

// =============================================================================
// Initialization
// =============================================================================

fn seed_for(name: &str) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(name.as_bytes());
    hasher.finish()
}

/// Kaiming-uniform weights with bound `1 / sqrt(fan_in)`.
fn kaiming_uniform(name: &str, shape: &[usize], fan_in: usize) -> Tensor {
    let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
    creation::uniform_seeded(shape, -bound, bound, seed_for(name))
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

fn register(store: &ParamStore, name: &str, tensor: Tensor, device: Device) -> String {
    store.register(name, tensor.to_device(device));
    name.to_string()
}

// =============================================================================
// Linear
// =============================================================================

/// Applies `y = x W^T + b`.
///
/// # Shape
/// - Input: `(*, in_features)`
/// - Output: `(*, out_features)`
#[derive(Debug, Clone)]
pub struct Linear {
    store: Arc<ParamStore>,
    weight: String,
    bias: Option<String>,
    in_features: usize,
    out_features: usize,
}

impl Linear {
    /// Creates a layer with bias on the CPU.
    pub fn new(store: &Arc<ParamStore>, prefix: &str, in_features: usize, out_features: usize) -> Self {
        Self::with_options(store, prefix, in_features, out_features, true, Device::Cpu)
    }

    /// Creates a layer with optional bias on `device`.
    pub fn with_options(
        store: &Arc<ParamStore>,
        prefix: &str,
        in_features: usize,
        out_features: usize,
        bias: bool,
        device: Device,
    ) -> Self {
        let weight_name = join(prefix, "weight");
        let weight = kaiming_uniform(&weight_name, &[out_features, in_features], in_features);
        let weight = register(store, &weight_name, weight, device);
        let bias = bias.then(|| {
            let name = join(prefix, "bias");
            let b = kaiming_uniform(&name, &[out_features], in_features);
            register(store, &name, b, device)
        });
        Self {
            store: Arc::clone(store),
            weight,
            bias,
            in_features,
            out_features,
        }
    }

    /// Input feature dimension.
    pub fn in_features(&self) -> usize {
        self.in_features
    }

    /// Output feature dimension.
    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// Applies the layer.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let w = self.store.require(&self.weight)?;
        let b = self.bias.as_deref().map(|n| self.store.require(n)).transpose()?;
        x.linear(&w, b.as_ref())
    }

    /// Applies the layer spelled as `x @ W^T + b`, the form unfused models
    /// produce.
    pub fn forward_unfused(&self, x: &Tensor) -> Result<Tensor> {
        let w = self.store.require(&self.weight)?;
        let y = x.matmul(&w.transpose(0, 1)?)?;
        match &self.bias {
            Some(name) => y.add(&self.store.require(name)?),
            None => Ok(y),
        }
    }
}

// =============================================================================
// Conv2d
// =============================================================================

/// 2-D convolution over NCHW inputs with a square kernel.
#[derive(Debug, Clone)]
pub struct Conv2d {
    store: Arc<ParamStore>,
    weight: String,
    bias: String,
    stride: usize,
    padding: usize,
}

impl Conv2d {
    /// Creates a stride-1 convolution with bias and "same" padding.
    pub fn new(
        store: &Arc<ParamStore>,
        prefix: &str,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
    ) -> Self {
        Self::with_options(
            store,
            prefix,
            in_channels,
            out_channels,
            kernel_size,
            1,
            kernel_size / 2,
            Device::Cpu,
        )
    }

    /// Creates a convolution with explicit stride, padding and device.
    #[allow(clippy::too_many_arguments)]
    pub fn with_options(
        store: &Arc<ParamStore>,
        prefix: &str,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        device: Device,
    ) -> Self {
        let fan_in = in_channels * kernel_size * kernel_size;
        let weight_name = join(prefix, "weight");
        let weight = kaiming_uniform(
            &weight_name,
            &[out_channels, in_channels, kernel_size, kernel_size],
            fan_in,
        );
        let bias_name = join(prefix, "bias");
        let bias = kaiming_uniform(&bias_name, &[out_channels], fan_in);
        Self {
            store: Arc::clone(store),
            weight: register(store, &weight_name, weight, device),
            bias: register(store, &bias_name, bias, device),
            stride,
            padding,
        }
    }

    /// Applies the convolution.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let w = self.store.require(&self.weight)?;
        let b = self.store.require(&self.bias)?;
        x.conv2d(&w, Some(&b), self.stride, self.padding)
    }
}

// =============================================================================
// Normalization
// =============================================================================

/// Group normalization with per-channel affine parameters.
#[derive(Debug, Clone)]
pub struct GroupNorm {
    store: Arc<ParamStore>,
    weight: String,
    bias: String,
    groups: usize,
    eps: f64,
}

impl GroupNorm {
    /// Creates a layer with unit scale and zero shift.
    pub fn new(store: &Arc<ParamStore>, prefix: &str, groups: usize, channels: usize, device: Device) -> Self {
        Self {
            store: Arc::clone(store),
            weight: register(store, &join(prefix, "weight"), creation::ones(&[channels]), device),
            bias: register(store, &join(prefix, "bias"), creation::zeros(&[channels]), device),
            groups,
            eps: 1e-5,
        }
    }

    /// Applies the normalization.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let w = self.store.require(&self.weight)?;
        let b = self.store.require(&self.bias)?;
        x.group_norm(self.groups, Some((&w, &b)), self.eps)
    }
}

/// Layer normalization over the last dimension.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    store: Arc<ParamStore>,
    weight: String,
    bias: String,
    eps: f64,
}

impl LayerNorm {
    /// Creates a layer with unit scale and zero shift.
    pub fn new(store: &Arc<ParamStore>, prefix: &str, dim: usize, device: Device) -> Self {
        Self {
            store: Arc::clone(store),
            weight: register(store, &join(prefix, "weight"), creation::ones(&[dim]), device),
            bias: register(store, &join(prefix, "bias"), creation::zeros(&[dim]), device),
            eps: 1e-5,
        }
    }

    /// Applies the normalization.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let w = self.store.require(&self.weight)?;
        let b = self.store.require(&self.bias)?;
        x.layer_norm(Some((&w, &b)), self.eps)
    }
}

// =============================================================================
// Attention
// =============================================================================

/// Single-head attention with query, key, value and output projections.
///
/// Keys and values come from `context` when one is given (cross-attention),
/// otherwise from the input itself.
#[derive(Debug, Clone)]
pub struct Attention {
    to_q: Linear,
    to_k: Linear,
    to_v: Linear,
    to_out: Linear,
    scale: f64,
}

impl Attention {
    /// Creates an attention block with `dim`-wide queries and `context_dim`-wide keys.
    pub fn new(
        store: &Arc<ParamStore>,
        prefix: &str,
        dim: usize,
        context_dim: usize,
        device: Device,
    ) -> Self {
        let proj = |name: &str, input: usize, bias: bool| {
            Linear::with_options(store, &join(prefix, name), input, dim, bias, device)
        };
        Self {
            to_q: proj("to_q", dim, false),
            to_k: proj("to_k", context_dim, false),
            to_v: proj("to_v", context_dim, false),
            to_out: proj("to_out", dim, true),
            scale: 1.0 / (dim.max(1) as f64).sqrt(),
        }
    }

    /// Applies attention of `x` over `context` (or over itself).
    pub fn forward(&self, x: &Tensor, context: Option<&Tensor>) -> Result<Tensor> {
        let context = context.unwrap_or(x);
        let q = self.to_q.forward(x)?;
        let k = self.to_k.forward(context)?;
        let v = self.to_v.forward(context)?;
        self.to_out.forward(&q.attention(&k, &v, self.scale)?)
    }
}
