//! Diffjit Tensor - Reference Host Tensor Runtime
//!
//! This crate provides the `Tensor` value the graph compiler captures and
//! executes. Every tensor operation flows through a single dispatcher
//! ([`ops::dispatch`]) which runs the reference kernel and, while a trace
//! session is active on the current thread, records the operation for the
//! capture engine.
//!
//! # Key Features
//! - Shared, reference-counted storage with stable tensor identities
//! - Half-precision rounding driven by the tensor's dtype
//! - Channels-last physical layout for 4-D tensors
//! - Fused kernels (linear+activation, conv+residual+activation,
//!   group-norm+SiLU, memory-efficient attention, low-precision GEMM)
//! - Thread-local operation tracing
//!
//! # Example
//! ```rust
//! use diffjit_tensor::Tensor;
//!
//! let x = Tensor::from_vec(vec![-1.0, 2.0, -3.0, 4.0], &[2, 2]).unwrap();
//! let w = Tensor::from_vec(vec![1.0, 0.0, 0.0, 1.0], &[2, 2]).unwrap();
//! let y = x.linear(&w, None).unwrap().relu().unwrap();
//! assert_eq!(y.to_vec(), vec![0.0, 2.0, 0.0, 4.0]);
//! ```
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::many_single_char_names)]
#![allow(clippy::too_many_arguments)]

// =============================================================================
// Modules
// =============================================================================

pub mod creation;
pub mod ops;
pub mod shape;
pub mod tensor;
pub mod trace;

// =============================================================================
// Re-exports
// =============================================================================

pub use ops::{dispatch, Activation, AttentionKernel, OpKind};
pub use tensor::{Tensor, TensorId, WeakTensor};

pub use diffjit_core::{DType, Device, Error, MemoryFormat, Result};

// =============================================================================
// Prelude
// =============================================================================

/// Convenient imports for common usage.
pub mod prelude {
    pub use crate::ops::{Activation, AttentionKernel, OpKind};
    pub use crate::tensor::Tensor;
    pub use diffjit_core::prelude::*;
}
