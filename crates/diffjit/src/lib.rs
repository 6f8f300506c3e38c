//! # Diffjit - Lazy Graph Compilation for Diffusion Pipelines
//!
//! Diffjit speeds up the repeated forward calls of a diffusion pipeline by
//! capturing each component's computation once per input signature,
//! rewriting the captured graph and serving later calls from the compiled
//! result:
//!
//! - **Capture**: one concrete call becomes a graph over the tensor runtime
//! - **Rewrite**: dead-op removal, view canonicalization, linear and
//!   convolution fusion, channels-last conversion, reduced-precision GEMMs,
//!   fused normalization and attention kernel selection
//! - **Freeze**: parameters inlined as constants, constant folding
//! - **Cache**: one artifact per signature, permanent eager fallback for
//!   calls that cannot be captured
//! - **Replay**: fixed-shape replay buffers on CUDA devices
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use diffjit::prelude::*;
//! use diffjit::nn::Linear;
//!
//! let device = Device::Cpu;
//! let params = Arc::new(ParamStore::new());
//! let proj = Linear::new(&params, "proj", 16, 16);
//! let forward = move |args: &CallArgs| -> diffjit_core::Result<Value> {
//!     Ok(Value::Tensor(proj.forward_unfused(args.tensor(0)?)?.relu()?))
//! };
//! let mut unet = Submodule::new("unet", device, DType::F32, params)
//!     .with_entry_point("forward", Arc::new(forward));
//!
//! let report = compile_unet(&mut unet, &CompilationConfig::for_device(device)).unwrap();
//! let x = diffjit_tensor::creation::ones(&[2, 16]);
//! let y = unet.forward(&CallArgs::from_tensors([x])).unwrap();
//! assert_eq!(y.into_tensor().unwrap().shape(), &[2, 16]);
//! assert_eq!(report.compilations(), 1);
//! ```
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::struct_excessive_bools)]

// =============================================================================
// Core Re-exports
// =============================================================================

pub use diffjit_core as core;
pub use diffjit_jit as jit;
pub use diffjit_tensor as tensor;

// =============================================================================
// Modules
// =============================================================================

pub mod backend;
pub mod config;
pub mod error;
pub mod nn;
pub mod pipeline;

pub use backend::KernelBackend;
pub use config::CompilationConfig;
pub use error::{PipelineError, PipelineResult};
pub use pipeline::{compile, compile_unet, CompileReport, DiffusionPipeline, Vae};

// =============================================================================
// Prelude
// =============================================================================

/// Common imports for compiling a pipeline.
///
/// ```rust
/// use diffjit::prelude::*;
/// ```
pub mod prelude {
    pub use diffjit_core::{DType, Device, Error, MemoryFormat, Result};
    pub use diffjit_jit::{CallArgs, Forward, ParamStore, Submodule, Value};
    pub use diffjit_tensor::Tensor;

    pub use crate::backend::KernelBackend;
    pub use crate::config::CompilationConfig;
    pub use crate::pipeline::{compile, compile_unet, DiffusionPipeline, Vae};
}
