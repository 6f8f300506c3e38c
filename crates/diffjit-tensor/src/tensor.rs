//! Tensor - Core Tensor Value
//!
//! A `Tensor` is a shaped view over a shared [`Storage`] buffer plus a dtype
//! and a memory format. Every tensor carries a [`TensorId`] that stays the
//! same across clones and is fresh for every operation result; the capture
//! engine uses it to stitch recorded operations back into a dataflow graph.
//!
//! Storage always holds `f32` values already rounded to the tensor's dtype.
//! 4-D tensors in `ChannelsLast` format keep their storage in NHWC order.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use diffjit_core::error::{Error, Result};
use diffjit_core::storage::{Storage, WeakStorage};
use diffjit_core::{DType, Device, MemoryFormat};

use crate::ops::{dispatch, Activation, AttentionKernel, OpKind};
use crate::shape::numel;
use crate::trace;

// =============================================================================
// Tensor Identity
// =============================================================================

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a tensor value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(u64);

impl TensorId {
    fn fresh() -> Self {
        Self(NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw identifier.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

// =============================================================================
// Tensor Struct
// =============================================================================

/// An N-dimensional array of numeric values.
#[derive(Clone)]
pub struct Tensor {
    id: TensorId,
    storage: Storage,
    shape: Vec<usize>,
    dtype: DType,
    format: MemoryFormat,
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("id", &self.id.0)
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("device", &self.device())
            .field("format", &self.format)
            .finish()
    }
}

impl Tensor {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Creates an `f32` CPU tensor from a vector in row-major order.
    pub fn from_vec(data: Vec<f32>, shape: &[usize]) -> Result<Self> {
        Self::from_vec_with(data, shape, DType::F32, Device::Cpu)
    }

    /// Creates a tensor with an explicit dtype and device.
    ///
    /// Values are rounded to what `dtype` can represent.
    pub fn from_vec_with(
        data: Vec<f32>,
        shape: &[usize],
        dtype: DType,
        device: Device,
    ) -> Result<Self> {
        let expected = numel(shape);
        if data.len() != expected {
            return Err(Error::shape_mismatch(&[expected], &[data.len()]));
        }
        Ok(Self::from_logical(
            data,
            shape.to_vec(),
            dtype,
            device,
            MemoryFormat::Contiguous,
        ))
    }

    /// Creates a scalar (0-dimensional) tensor.
    #[must_use]
    pub fn scalar(value: f32) -> Self {
        Self::from_logical(
            vec![value],
            Vec::new(),
            DType::F32,
            Device::Cpu,
            MemoryFormat::Contiguous,
        )
    }

    /// Builds a tensor from logical (NCHW-ordered) values.
    pub(crate) fn from_logical(
        mut values: Vec<f32>,
        shape: Vec<usize>,
        dtype: DType,
        device: Device,
        format: MemoryFormat,
    ) -> Self {
        dtype.round_slice(&mut values);
        let format = format.effective(shape.len());
        let physical = match format {
            MemoryFormat::Contiguous => values,
            MemoryFormat::ChannelsLast => {
                let mut physical = vec![0.0; values.len()];
                for (logical, v) in values.into_iter().enumerate() {
                    physical[format.physical_index(&shape, logical)] = v;
                }
                physical
            }
        };
        Self {
            id: TensorId::fresh(),
            storage: Storage::from_vec(physical, device),
            shape,
            dtype,
            format,
        }
    }

    /// Builds a tensor over an existing physical buffer.
    pub(crate) fn from_storage(
        storage: Storage,
        shape: Vec<usize>,
        dtype: DType,
        format: MemoryFormat,
    ) -> Self {
        Self {
            id: TensorId::fresh(),
            storage,
            format: format.effective(shape.len()),
            shape,
            dtype,
        }
    }

    /// Returns a new tensor identity sharing this tensor's storage.
    pub(crate) fn alias(&self) -> Self {
        Self::from_storage(
            self.storage.clone(),
            self.shape.clone(),
            self.dtype,
            self.format,
        )
    }

    // =========================================================================
    // Properties
    // =========================================================================

    /// Returns the identity of this tensor value.
    #[must_use]
    pub const fn id(&self) -> TensorId {
        self.id
    }

    /// Returns the shape of the tensor.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Returns the number of dimensions.
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Returns the total number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        numel(&self.shape)
    }

    /// Returns the data type.
    #[must_use]
    pub const fn dtype(&self) -> DType {
        self.dtype
    }

    /// Returns the device the tensor lives on.
    #[must_use]
    pub const fn device(&self) -> Device {
        self.storage.device()
    }

    /// Returns the physical memory format.
    #[must_use]
    pub const fn memory_format(&self) -> MemoryFormat {
        self.format
    }

    /// Returns the underlying storage.
    #[must_use]
    pub const fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Returns true if both tensors are backed by the same buffer.
    #[must_use]
    pub fn shares_storage(&self, other: &Self) -> bool {
        self.storage.ptr_eq(&other.storage)
    }

    // =========================================================================
    // Data Access
    // =========================================================================

    /// Logical values in NCHW order, without marking the active trace.
    pub(crate) fn values(&self) -> Vec<f32> {
        let physical = self.storage.read();
        match self.format {
            MemoryFormat::Contiguous => physical.clone(),
            MemoryFormat::ChannelsLast => (0..physical.len())
                .map(|logical| physical[self.format.physical_index(&self.shape, logical)])
                .collect(),
        }
    }

    /// Copies the values out to the host in logical row-major order.
    ///
    /// While tracing, this marks the recording as data-dependent.
    #[must_use]
    pub fn to_vec(&self) -> Vec<f32> {
        trace::flag_untraceable("tensor values were read on the host");
        self.values()
    }

    /// Returns the single value of a one-element tensor.
    pub fn item(&self) -> Result<f32> {
        if self.numel() != 1 {
            return Err(Error::invalid_operation(format!(
                "item() needs exactly one element, tensor has {}",
                self.numel()
            )));
        }
        trace::flag_untraceable("tensor value converted to a host scalar");
        Ok(self.values()[0])
    }

    /// Overwrites this tensor's buffer with the values of `src`.
    ///
    /// Shapes must match. Values are rounded to this tensor's dtype and laid
    /// out in this tensor's memory format.
    pub fn copy_from(&self, src: &Self) -> Result<()> {
        if self.shape != src.shape {
            return Err(Error::shape_mismatch(&self.shape, &src.shape));
        }
        trace::flag_untraceable("in-place write into a tensor buffer");
        let mut values = src.values();
        self.dtype.round_slice(&mut values);
        match self.format {
            MemoryFormat::Contiguous => self.storage.copy_from_slice(&values),
            MemoryFormat::ChannelsLast => {
                let mut physical = self.storage.write();
                for (logical, v) in values.into_iter().enumerate() {
                    physical[self.format.physical_index(&self.shape, logical)] = v;
                }
                Ok(())
            }
        }
    }

    /// Returns a copy with its own storage and a fresh identity.
    #[must_use]
    pub fn deep_clone(&self) -> Self {
        Self::from_storage(
            self.storage.deep_copy(),
            self.shape.clone(),
            self.dtype,
            self.format,
        )
    }

    /// Returns a copy tagged with another device.
    pub fn to_device(&self, device: Device) -> Self {
        trace::flag_untraceable("device transfer");
        Self::from_storage(
            self.storage.to_device(device),
            self.shape.clone(),
            self.dtype,
            self.format,
        )
    }

    /// Creates a weak handle that does not keep the storage alive.
    #[must_use]
    pub fn downgrade(&self) -> WeakTensor {
        WeakTensor {
            id: self.id,
            storage: self.storage.downgrade(),
        }
    }

    /// Returns true if every element is within `atol + rtol * |other|`.
    #[must_use]
    pub fn allclose(&self, other: &Self, rtol: f32, atol: f32) -> bool {
        if self.shape != other.shape {
            return false;
        }
        self.to_vec()
            .iter()
            .zip(other.to_vec().iter())
            .all(|(a, b)| (a - b).abs() <= atol + rtol * b.abs())
    }

    /// Returns the largest absolute elementwise difference.
    #[must_use]
    pub fn max_abs_diff(&self, other: &Self) -> f32 {
        self.to_vec()
            .iter()
            .zip(other.to_vec().iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f32::max)
    }

    // =========================================================================
    // Elementwise Operations
    // =========================================================================

    /// Broadcast addition.
    pub fn add(&self, other: &Self) -> Result<Self> {
        dispatch(OpKind::Add, &[self, other])
    }

    /// Broadcast subtraction.
    pub fn sub(&self, other: &Self) -> Result<Self> {
        dispatch(OpKind::Sub, &[self, other])
    }

    /// Broadcast multiplication.
    pub fn mul(&self, other: &Self) -> Result<Self> {
        dispatch(OpKind::Mul, &[self, other])
    }

    /// Broadcast division.
    pub fn div(&self, other: &Self) -> Result<Self> {
        dispatch(OpKind::Div, &[self, other])
    }

    /// Adds a scalar to every element.
    pub fn add_scalar(&self, value: f64) -> Result<Self> {
        dispatch(OpKind::AddScalar { value }, &[self])
    }

    /// Multiplies every element by a scalar.
    pub fn mul_scalar(&self, value: f64) -> Result<Self> {
        dispatch(OpKind::MulScalar { value }, &[self])
    }

    /// Negation.
    pub fn neg(&self) -> Result<Self> {
        dispatch(OpKind::Neg, &[self])
    }

    /// Elementwise exponential.
    pub fn exp(&self) -> Result<Self> {
        dispatch(OpKind::Exp, &[self])
    }

    /// Elementwise square root.
    pub fn sqrt(&self) -> Result<Self> {
        dispatch(OpKind::Sqrt, &[self])
    }

    /// Applies an activation function.
    pub fn activation(&self, activation: Activation) -> Result<Self> {
        dispatch(OpKind::Activation(activation), &[self])
    }

    /// ReLU activation.
    pub fn relu(&self) -> Result<Self> {
        self.activation(Activation::Relu)
    }

    /// GELU activation (tanh approximation).
    pub fn gelu(&self) -> Result<Self> {
        self.activation(Activation::Gelu)
    }

    /// SiLU (swish) activation.
    pub fn silu(&self) -> Result<Self> {
        self.activation(Activation::Silu)
    }

    /// Sigmoid activation.
    pub fn sigmoid(&self) -> Result<Self> {
        self.activation(Activation::Sigmoid)
    }

    /// Hyperbolic tangent.
    pub fn tanh(&self) -> Result<Self> {
        self.activation(Activation::Tanh)
    }

    // =========================================================================
    // Linear Algebra
    // =========================================================================

    /// Batched matrix multiplication with broadcasting over batch dims.
    pub fn matmul(&self, other: &Self) -> Result<Self> {
        dispatch(OpKind::MatMul, &[self, other])
    }

    /// Affine map `x @ weight^T + bias`, weight shaped `[out, in]`.
    pub fn linear(&self, weight: &Self, bias: Option<&Self>) -> Result<Self> {
        match bias {
            Some(b) => dispatch(OpKind::Linear { bias: true }, &[self, weight, b]),
            None => dispatch(OpKind::Linear { bias: false }, &[self, weight]),
        }
    }

    /// 2-D convolution over an NCHW input with an `[out, in, kh, kw]` kernel.
    pub fn conv2d(
        &self,
        weight: &Self,
        bias: Option<&Self>,
        stride: usize,
        padding: usize,
    ) -> Result<Self> {
        let kind = OpKind::Conv2d {
            stride,
            padding,
            bias: bias.is_some(),
        };
        match bias {
            Some(b) => dispatch(kind, &[self, weight, b]),
            None => dispatch(kind, &[self, weight]),
        }
    }

    /// Scaled dot-product attention with `self` as the queries.
    pub fn attention(&self, key: &Self, value: &Self, scale: f64) -> Result<Self> {
        dispatch(
            OpKind::Attention {
                scale,
                kernel: AttentionKernel::Math,
            },
            &[self, key, value],
        )
    }

    // =========================================================================
    // Normalization and Reductions
    // =========================================================================

    /// Group normalization over `[N, C, ...]` with optional affine params.
    pub fn group_norm(
        &self,
        groups: usize,
        affine: Option<(&Self, &Self)>,
        eps: f64,
    ) -> Result<Self> {
        match affine {
            Some((w, b)) => dispatch(
                OpKind::GroupNorm {
                    groups,
                    eps,
                    affine: true,
                },
                &[self, w, b],
            ),
            None => dispatch(
                OpKind::GroupNorm {
                    groups,
                    eps,
                    affine: false,
                },
                &[self],
            ),
        }
    }

    /// Layer normalization over the last dimension.
    pub fn layer_norm(&self, affine: Option<(&Self, &Self)>, eps: f64) -> Result<Self> {
        match affine {
            Some((w, b)) => dispatch(OpKind::LayerNorm { eps, affine: true }, &[self, w, b]),
            None => dispatch(OpKind::LayerNorm { eps, affine: false }, &[self]),
        }
    }

    /// Softmax along a dimension.
    pub fn softmax(&self, dim: i64) -> Result<Self> {
        dispatch(OpKind::Softmax { dim }, &[self])
    }

    /// Sum along a dimension.
    pub fn sum_dim(&self, dim: i64, keepdim: bool) -> Result<Self> {
        dispatch(OpKind::Sum { dim, keepdim }, &[self])
    }

    /// Mean along a dimension.
    pub fn mean_dim(&self, dim: i64, keepdim: bool) -> Result<Self> {
        dispatch(OpKind::Mean { dim, keepdim }, &[self])
    }

    // =========================================================================
    // Layout and Shape
    // =========================================================================

    /// Dropout. The reference runtime only evaluates in inference mode, where
    /// dropout is the identity.
    pub fn dropout(&self, p: f64) -> Result<Self> {
        dispatch(OpKind::Dropout { p }, &[self])
    }

    /// Returns a tensor in contiguous memory format.
    pub fn contiguous(&self) -> Result<Self> {
        dispatch(OpKind::Contiguous, &[self])
    }

    /// Strict view; fails when the input is not contiguous.
    pub fn view(&self, shape: &[isize]) -> Result<Self> {
        dispatch(
            OpKind::View {
                shape: shape.to_vec(),
            },
            &[self],
        )
    }

    /// Reshape, copying when the layout requires it.
    pub fn reshape(&self, shape: &[isize]) -> Result<Self> {
        dispatch(
            OpKind::Reshape {
                shape: shape.to_vec(),
            },
            &[self],
        )
    }

    /// Swaps two dimensions.
    pub fn transpose(&self, dim0: i64, dim1: i64) -> Result<Self> {
        dispatch(OpKind::Transpose { dim0, dim1 }, &[self])
    }

    /// Reorders dimensions.
    pub fn permute(&self, dims: &[usize]) -> Result<Self> {
        dispatch(
            OpKind::Permute {
                dims: dims.to_vec(),
            },
            &[self],
        )
    }

    /// Converts to another dtype.
    pub fn to_dtype(&self, dtype: DType) -> Result<Self> {
        dispatch(OpKind::Cast { dtype }, &[self])
    }

    /// Converts to another physical memory format.
    pub fn to_memory_format(&self, format: MemoryFormat) -> Result<Self> {
        dispatch(OpKind::ToMemoryFormat { format }, &[self])
    }
}

// =============================================================================
// Weak Handles
// =============================================================================

/// A non-owning handle to a tensor's storage.
#[derive(Debug, Clone)]
pub struct WeakTensor {
    id: TensorId,
    storage: WeakStorage,
}

impl WeakTensor {
    /// Identity of the tensor this handle was taken from.
    #[must_use]
    pub const fn id(&self) -> TensorId {
        self.id
    }

    /// Returns true while anything still holds the storage.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.storage.is_alive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec() {
        let t = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
        assert_eq!(t.shape(), &[2, 3]);
        assert_eq!(t.numel(), 6);
        assert_eq!(t.dtype(), DType::F32);
        assert!(Tensor::from_vec(vec![1.0], &[2]).is_err());
    }

    #[test]
    fn test_identity_semantics() {
        let a = Tensor::from_vec(vec![1.0, 2.0], &[2]).unwrap();
        let b = a.clone();
        assert_eq!(a.id(), b.id());
        let c = a.add(&b).unwrap();
        assert_ne!(c.id(), a.id());
        let d = a.deep_clone();
        assert_ne!(d.id(), a.id());
        assert!(!d.shares_storage(&a));
    }

    #[test]
    fn test_half_rounding() {
        let t = Tensor::from_vec_with(vec![0.1], &[1], DType::F16, Device::Cpu).unwrap();
        let v = t.to_vec()[0];
        assert_ne!(v, 0.1);
        assert!((v - 0.1).abs() < 1e-3);
    }

    #[test]
    fn test_channels_last_roundtrip_values() {
        let data: Vec<f32> = (0..24).map(|v| v as f32).collect();
        let t = Tensor::from_vec(data.clone(), &[1, 2, 3, 4]).unwrap();
        let cl = t.to_memory_format(MemoryFormat::ChannelsLast).unwrap();
        assert_eq!(cl.memory_format(), MemoryFormat::ChannelsLast);
        assert_eq!(cl.to_vec(), data);
        // Physical order is NHWC: first two physical values are channel 0 and 1 at (0, 0)
        assert_eq!(&cl.storage().read()[..2], &[0.0, 12.0]);
    }

    #[test]
    fn test_copy_from() {
        let dst = Tensor::from_vec(vec![0.0; 4], &[2, 2]).unwrap();
        let src = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
        dst.copy_from(&src).unwrap();
        assert_eq!(dst.to_vec(), src.to_vec());
        let wrong = Tensor::from_vec(vec![1.0; 3], &[3]).unwrap();
        assert!(dst.copy_from(&wrong).is_err());
    }

    #[test]
    fn test_weak_tensor() {
        let t = Tensor::from_vec(vec![1.0], &[1]).unwrap();
        let weak = t.downgrade();
        assert!(weak.is_alive());
        let alias = t.clone();
        drop(t);
        assert!(weak.is_alive());
        drop(alias);
        assert!(!weak.is_alive());
    }

    #[test]
    fn test_item() {
        let t = Tensor::scalar(3.5);
        assert_eq!(t.item().unwrap(), 3.5);
        let v = Tensor::from_vec(vec![1.0, 2.0], &[2]).unwrap();
        assert!(v.item().is_err());
    }

    #[test]
    fn test_allclose() {
        let a = Tensor::from_vec(vec![1.0, 2.0], &[2]).unwrap();
        let b = Tensor::from_vec(vec![1.0, 2.000_001], &[2]).unwrap();
        assert!(a.allclose(&b, 1e-5, 1e-5));
        assert!(a.max_abs_diff(&b) < 1e-5);
    }
}
