//! Diffjit JIT - Lazy Graph Compilation for Pipeline Components
//!
//! This crate compiles the callables of a pipeline component on first use:
//!
//! - Capture of one concrete call into a graph ([`capture`])
//! - An ordered rewrite pipeline with pluggable passes ([`passes`])
//! - Parameter freezing and constant folding ([`freeze`])
//! - A per-signature artifact cache with single-flight compilation
//! - Transparent call interception with fallback to eager execution
//! - Optional replay capture on devices with stream replay
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use diffjit_core::{DType, Device};
//! use diffjit_jit::{install, CallArgs, GraphCompiler, ParamStore, Submodule, Value};
//! use diffjit_tensor::Tensor;
//!
//! let params = Arc::new(ParamStore::new());
//! let forward = |args: &CallArgs| -> diffjit_core::Result<Value> {
//!     Ok(Value::Tensor(args.tensor(0)?.mul_scalar(2.0)?.relu()?))
//! };
//! let mut unet = Submodule::new("unet", Device::Cpu, DType::F32, params)
//!     .with_entry_point("forward", Arc::new(forward));
//!
//! let wrapper = install(&mut unet, "forward", Arc::new(GraphCompiler::default())).unwrap();
//! let x = Tensor::from_vec(vec![-1.0, 3.0], &[2]).unwrap();
//! let y = unet.forward(&CallArgs::from_tensors([x])).unwrap();
//! assert_eq!(y.into_tensor().unwrap().to_vec(), vec![0.0, 6.0]);
//! assert_eq!(wrapper.cache().stats().compilations, 1);
//! ```
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod artifact;
pub mod cache;
pub mod capture;
pub mod compile;
pub mod context;
pub mod error;
pub mod freeze;
pub mod intercept;
pub mod ir;
pub mod module;
pub mod passes;
pub mod replay;
pub mod signature;
pub mod value;

pub use artifact::CompiledArtifact;
pub use cache::{CacheEntry, CacheStats, SignatureCache};
pub use capture::capture;
pub use compile::{GraphCompiler, JitConfig};
pub use context::JitContext;
pub use error::{JitError, JitResult};
pub use freeze::freeze;
pub use intercept::{install, install_with_context, LazyTrace};
pub use ir::{Graph, Node, NodeId, NodeKind, TensorMeta};
pub use module::{Forward, ParamStore, Submodule};
pub use passes::{PassStats, RewriteOptions, RewritePass, RewritePipeline};
pub use replay::ReplayBuffer;
pub use signature::{InputSignature, SignatureToken};
pub use value::{CallArgs, OutputTemplate, Value};
