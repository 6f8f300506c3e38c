//! Operations - Operation Kinds and Dispatch
//!
//! `OpKind` names every operation the runtime can execute together with its
//! non-tensor attributes. Graph nodes carry the same values, so a recorded
//! operation and a compiled node run through the exact same kernel.
//!
//! Operand order is fixed per kind. Optional operands are announced by flags
//! on the kind (`bias`, `residual`, `affine`) and, when present, follow the
//! required operands in the order the flags are listed.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

mod attention;
mod conv;
mod elementwise;
mod layout;
mod linalg;
mod norm;

use core::fmt;

use diffjit_core::error::{Error, Result};
use diffjit_core::{DType, Device, MemoryFormat};

use crate::tensor::Tensor;
use crate::trace;

pub use attention::MEMORY_EFFICIENT_CHUNK;
pub use linalg::LOWP_BLOCK;

// =============================================================================
// Activation
// =============================================================================

/// Pointwise activation functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Activation {
    /// max(x, 0)
    Relu,
    /// GELU, tanh approximation.
    Gelu,
    /// x * sigmoid(x)
    Silu,
    /// 1 / (1 + e^-x)
    Sigmoid,
    /// Hyperbolic tangent.
    Tanh,
}

impl Activation {
    /// Applies the activation to one value.
    #[must_use]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Self::Relu => x.max(0.0),
            Self::Gelu => {
                let c = (2.0f32 / core::f32::consts::PI).sqrt();
                0.5 * x * (1.0 + (c * (x + 0.044_715 * x * x * x)).tanh())
            }
            Self::Silu => x / (1.0 + (-x).exp()),
            Self::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Self::Tanh => x.tanh(),
        }
    }

    /// Short lowercase name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Relu => "relu",
            Self::Gelu => "gelu",
            Self::Silu => "silu",
            Self::Sigmoid => "sigmoid",
            Self::Tanh => "tanh",
        }
    }
}

// =============================================================================
// Attention Kernels
// =============================================================================

/// Implementation used for scaled dot-product attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AttentionKernel {
    /// Materializes the full score matrix.
    #[default]
    Math,
    /// Streams over key blocks with an online softmax.
    MemoryEfficient,
}

// =============================================================================
// OpKind
// =============================================================================

/// Every operation the runtime executes.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    /// `a + b` with broadcasting.
    Add,
    /// `a - b` with broadcasting.
    Sub,
    /// `a * b` with broadcasting.
    Mul,
    /// `a / b` with broadcasting.
    Div,
    /// `a + value`.
    AddScalar {
        /// Scalar operand.
        value: f64,
    },
    /// `a * value`.
    MulScalar {
        /// Scalar operand.
        value: f64,
    },
    /// `-a`.
    Neg,
    /// `e^a`.
    Exp,
    /// `sqrt(a)`.
    Sqrt,
    /// Pointwise activation.
    Activation(Activation),

    /// Batched matmul `(a, b)`.
    MatMul,
    /// Batched matmul with block-wise reduced-precision accumulation.
    LowpMatMul,
    /// `(x, weight[, bias])`.
    Linear {
        /// Whether a bias operand follows the weight.
        bias: bool,
    },
    /// `(x, weight[, bias][, residual])`: `act(x @ w^T + b) + residual`.
    FusedLinear {
        /// Whether a bias operand follows the weight.
        bias: bool,
        /// Activation applied after the affine map.
        activation: Option<Activation>,
        /// Accumulate in reduced precision.
        lowp: bool,
        /// Whether a residual operand is last.
        residual: bool,
    },
    /// `(x, weight[, bias])` over NCHW input.
    Conv2d {
        /// Spatial stride.
        stride: usize,
        /// Zero padding on each side.
        padding: usize,
        /// Whether a bias operand follows the weight.
        bias: bool,
    },
    /// `(x, weight[, bias][, residual])`: `act(conv(x) + b + residual)`.
    FusedConv2d {
        /// Spatial stride.
        stride: usize,
        /// Zero padding on each side.
        padding: usize,
        /// Whether a bias operand follows the weight.
        bias: bool,
        /// Activation applied last.
        activation: Option<Activation>,
        /// Whether a residual operand is last.
        residual: bool,
    },

    /// `(x[, weight, bias])` normalized over channel groups.
    GroupNorm {
        /// Number of channel groups.
        groups: usize,
        /// Variance epsilon.
        eps: f64,
        /// Whether weight and bias operands follow.
        affine: bool,
    },
    /// `silu(group_norm(x))` in one pass.
    FusedGroupNormSilu {
        /// Number of channel groups.
        groups: usize,
        /// Variance epsilon.
        eps: f64,
        /// Whether weight and bias operands follow.
        affine: bool,
    },
    /// `(x[, weight, bias])` normalized over the last dimension.
    LayerNorm {
        /// Variance epsilon.
        eps: f64,
        /// Whether weight and bias operands follow.
        affine: bool,
    },
    /// Softmax along `dim`.
    Softmax {
        /// Dimension, negative counts from the end.
        dim: i64,
    },
    /// Sum along `dim`.
    Sum {
        /// Dimension, negative counts from the end.
        dim: i64,
        /// Keep the reduced dimension with size 1.
        keepdim: bool,
    },
    /// Mean along `dim`.
    Mean {
        /// Dimension, negative counts from the end.
        dim: i64,
        /// Keep the reduced dimension with size 1.
        keepdim: bool,
    },
    /// `(q, k, v)`: `softmax(q k^T * scale) v`.
    Attention {
        /// Score scale, usually `1/sqrt(d)`.
        scale: f64,
        /// Kernel choice.
        kernel: AttentionKernel,
    },

    /// Inference-mode dropout (identity).
    Dropout {
        /// Drop probability.
        p: f64,
    },
    /// Forces contiguous memory format.
    Contiguous,
    /// Strict view; the input must be contiguous.
    View {
        /// Target shape, one entry may be -1.
        shape: Vec<isize>,
    },
    /// Reshape with copy when needed.
    Reshape {
        /// Target shape, one entry may be -1.
        shape: Vec<isize>,
    },
    /// Swaps two dimensions.
    Transpose {
        /// First dimension.
        dim0: i64,
        /// Second dimension.
        dim1: i64,
    },
    /// Reorders dimensions.
    Permute {
        /// New order of source dimensions.
        dims: Vec<usize>,
    },
    /// Dtype conversion.
    Cast {
        /// Target dtype.
        dtype: DType,
    },
    /// Memory format conversion.
    ToMemoryFormat {
        /// Target format.
        format: MemoryFormat,
    },
}

impl OpKind {
    /// Stable name of the operation.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::AddScalar { .. } => "add_scalar",
            Self::MulScalar { .. } => "mul_scalar",
            Self::Neg => "neg",
            Self::Exp => "exp",
            Self::Sqrt => "sqrt",
            Self::Activation(act) => act.name(),
            Self::MatMul => "matmul",
            Self::LowpMatMul => "lowp_matmul",
            Self::Linear { .. } => "linear",
            Self::FusedLinear { .. } => "fused_linear",
            Self::Conv2d { .. } => "conv2d",
            Self::FusedConv2d { .. } => "fused_conv2d",
            Self::GroupNorm { .. } => "group_norm",
            Self::FusedGroupNormSilu { .. } => "fused_group_norm_silu",
            Self::LayerNorm { .. } => "layer_norm",
            Self::Softmax { .. } => "softmax",
            Self::Sum { .. } => "sum",
            Self::Mean { .. } => "mean",
            Self::Attention { .. } => "attention",
            Self::Dropout { .. } => "dropout",
            Self::Contiguous => "contiguous",
            Self::View { .. } => "view",
            Self::Reshape { .. } => "reshape",
            Self::Transpose { .. } => "transpose",
            Self::Permute { .. } => "permute",
            Self::Cast { .. } => "cast",
            Self::ToMemoryFormat { .. } => "to_memory_format",
        }
    }

    /// Number of tensor operands the operation takes.
    #[must_use]
    pub fn arity(&self) -> usize {
        let flag = usize::from;
        match self {
            Self::Add | Self::Sub | Self::Mul | Self::Div | Self::MatMul | Self::LowpMatMul => 2,
            Self::Linear { bias } => 2 + flag(*bias),
            Self::FusedLinear { bias, residual, .. } | Self::FusedConv2d { bias, residual, .. } => {
                2 + flag(*bias) + flag(*residual)
            }
            Self::Conv2d { bias, .. } => 2 + flag(*bias),
            Self::GroupNorm { affine, .. }
            | Self::FusedGroupNormSilu { affine, .. }
            | Self::LayerNorm { affine, .. } => 1 + 2 * flag(*affine),
            Self::Attention { .. } => 3,
            _ => 1,
        }
    }

    /// True for operations whose output is their input unchanged in value.
    #[must_use]
    pub const fn is_value_identity(&self) -> bool {
        matches!(self, Self::Dropout { .. } | Self::Contiguous)
    }

    /// Runs the reference kernel without recording.
    pub fn execute(&self, inputs: &[&Tensor]) -> Result<Tensor> {
        if inputs.len() != self.arity() {
            return Err(Error::invalid_operation(format!(
                "{} expects {} operands, got {}",
                self.name(),
                self.arity(),
                inputs.len()
            )));
        }
        common_device(inputs)?;

        match self {
            Self::Add => elementwise::binary(inputs[0], inputs[1], |a, b| a + b),
            Self::Sub => elementwise::binary(inputs[0], inputs[1], |a, b| a - b),
            Self::Mul => elementwise::binary(inputs[0], inputs[1], |a, b| a * b),
            Self::Div => elementwise::binary(inputs[0], inputs[1], |a, b| a / b),
            Self::AddScalar { value } => {
                let v = *value as f32;
                Ok(elementwise::unary(inputs[0], |a| a + v))
            }
            Self::MulScalar { value } => {
                let v = *value as f32;
                Ok(elementwise::unary(inputs[0], |a| a * v))
            }
            Self::Neg => Ok(elementwise::unary(inputs[0], |a| -a)),
            Self::Exp => Ok(elementwise::unary(inputs[0], f32::exp)),
            Self::Sqrt => Ok(elementwise::unary(inputs[0], f32::sqrt)),
            Self::Activation(act) => {
                let act = *act;
                Ok(elementwise::unary(inputs[0], move |a| act.apply(a)))
            }

            Self::MatMul => linalg::matmul(inputs[0], inputs[1], false),
            Self::LowpMatMul => linalg::matmul(inputs[0], inputs[1], true),
            Self::Linear { bias } => {
                let b = bias.then(|| inputs[2]);
                linalg::linear(inputs[0], inputs[1], b, None, false, None)
            }
            Self::FusedLinear {
                bias,
                activation,
                lowp,
                residual,
            } => {
                let (b, r) = optional_tail(inputs, 2, *bias, *residual);
                linalg::linear(inputs[0], inputs[1], b, *activation, *lowp, r)
            }
            Self::Conv2d {
                stride,
                padding,
                bias,
            } => {
                let b = bias.then(|| inputs[2]);
                conv::conv2d(inputs[0], inputs[1], b, *stride, *padding, None, None)
            }
            Self::FusedConv2d {
                stride,
                padding,
                bias,
                activation,
                residual,
            } => {
                let (b, r) = optional_tail(inputs, 2, *bias, *residual);
                conv::conv2d(inputs[0], inputs[1], b, *stride, *padding, r, *activation)
            }

            Self::GroupNorm {
                groups,
                eps,
                affine,
            } => norm::group_norm(inputs[0], *groups, affine_pair(inputs, *affine), *eps, false),
            Self::FusedGroupNormSilu {
                groups,
                eps,
                affine,
            } => norm::group_norm(inputs[0], *groups, affine_pair(inputs, *affine), *eps, true),
            Self::LayerNorm { eps, affine } => {
                norm::layer_norm(inputs[0], affine_pair(inputs, *affine), *eps)
            }
            Self::Softmax { dim } => norm::softmax(inputs[0], *dim),
            Self::Sum { dim, keepdim } => norm::reduce(inputs[0], *dim, *keepdim, false),
            Self::Mean { dim, keepdim } => norm::reduce(inputs[0], *dim, *keepdim, true),
            Self::Attention { scale, kernel } => {
                attention::attention(inputs[0], inputs[1], inputs[2], *scale, *kernel)
            }

            Self::Dropout { p } => {
                if !(0.0..1.0).contains(p) {
                    return Err(Error::invalid_operation(format!(
                        "dropout probability must be in [0, 1), got {p}"
                    )));
                }
                Ok(inputs[0].alias())
            }
            Self::Contiguous => Ok(layout::contiguous(inputs[0])),
            Self::View { shape } => layout::view(inputs[0], shape),
            Self::Reshape { shape } => layout::reshape(inputs[0], shape),
            Self::Transpose { dim0, dim1 } => layout::transpose(inputs[0], *dim0, *dim1),
            Self::Permute { dims } => layout::permute(inputs[0], dims),
            Self::Cast { dtype } => Ok(layout::cast(inputs[0], *dtype)),
            Self::ToMemoryFormat { format } => Ok(layout::to_memory_format(inputs[0], *format)),
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Dispatch
// =============================================================================

/// Executes an operation, recording it if a trace is active on this thread.
pub fn dispatch(kind: OpKind, inputs: &[&Tensor]) -> Result<Tensor> {
    let output = kind.execute(inputs)?;
    trace::record(kind, inputs, &output);
    Ok(output)
}

// =============================================================================
// Helpers
// =============================================================================

fn common_device(inputs: &[&Tensor]) -> Result<Device> {
    let device = inputs.first().map_or(Device::Cpu, |t| t.device());
    for t in inputs.iter().skip(1) {
        if t.device() != device {
            return Err(Error::DeviceMismatch {
                expected: device,
                actual: t.device(),
            });
        }
    }
    Ok(device)
}

/// Result dtype of a binary operation.
pub(crate) fn promote(a: DType, b: DType) -> DType {
    if a == b {
        a
    } else if a == DType::F64 || b == DType::F64 {
        DType::F64
    } else {
        DType::F32
    }
}

fn optional_tail<'a>(
    inputs: &[&'a Tensor],
    start: usize,
    first: bool,
    second: bool,
) -> (Option<&'a Tensor>, Option<&'a Tensor>) {
    let a = first.then(|| inputs[start]);
    let b = second.then(|| inputs[start + usize::from(first)]);
    (a, b)
}

fn affine_pair<'a>(inputs: &[&'a Tensor], affine: bool) -> Option<(&'a Tensor, &'a Tensor)> {
    affine.then(|| (inputs[1], inputs[2]))
}

// =============================================================================
// Tests
// =============================================================================
