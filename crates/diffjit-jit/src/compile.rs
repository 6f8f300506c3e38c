//! Graph Compiler - Capture, Rewrite, Freeze
//!
//! Turns one concrete call of a callable into a [`CompiledArtifact`]:
//!
//! 1. capture the call into a graph,
//! 2. run the rewrite pipeline,
//! 3. freeze the result unless the call ran in training mode.
//!
//! # Example
//! ```rust
//! use std::sync::Arc;
//! use diffjit_jit::{CallArgs, GraphCompiler, JitConfig, ParamStore, Value};
//! use diffjit_tensor::Tensor;
//!
//! let params = Arc::new(ParamStore::new());
//! let relu = |args: &CallArgs| -> diffjit_core::Result<Value> {
//!     Ok(Value::Tensor(args.tensor(0)?.relu()?))
//! };
//! let compiler = GraphCompiler::new(JitConfig::new().enable_freeze(true));
//! let x = Tensor::from_vec(vec![-1.0, 2.0], &[2]).unwrap();
//! let args = CallArgs::from_tensors([x]);
//! let artifact = compiler.compile(&relu, &args, &params, false).unwrap();
//! let y = artifact.run(&args).unwrap().into_tensor().unwrap();
//! assert_eq!(y.to_vec(), vec![0.0, 2.0]);
//! ```
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::artifact::CompiledArtifact;
use crate::capture::capture;
use crate::error::JitResult;
use crate::freeze::freeze;
use crate::module::{Forward, ParamStore};
use crate::passes::{RewriteOptions, RewritePass, RewritePipeline};
use crate::value::CallArgs;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration of the graph compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitConfig {
    /// Freeze inference-mode graphs.
    pub enable_freeze: bool,
    /// Keep parameters as live references when freezing.
    pub preserve_parameters: bool,
    /// Which rewrite passes run.
    pub rewrite: RewriteOptions,
    /// Record replay buffers for compiled signatures.
    pub enable_replay: bool,
    /// Maximum number of cached signatures per wrapper.
    pub cache_capacity: Option<usize>,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            enable_freeze: true,
            preserve_parameters: true,
            rewrite: RewriteOptions::default(),
            enable_replay: false,
            cache_capacity: None,
        }
    }
}

impl JitConfig {
    /// Creates a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: enable freezing.
    #[must_use]
    pub fn enable_freeze(mut self, enable: bool) -> Self {
        self.enable_freeze = enable;
        self
    }

    /// Builder: keep parameters live when freezing.
    #[must_use]
    pub fn preserve_parameters(mut self, preserve: bool) -> Self {
        self.preserve_parameters = preserve;
        self
    }

    /// Builder: set rewrite options.
    #[must_use]
    pub fn rewrite(mut self, options: RewriteOptions) -> Self {
        self.rewrite = options;
        self
    }

    /// Builder: enable replay capture.
    #[must_use]
    pub fn enable_replay(mut self, enable: bool) -> Self {
        self.enable_replay = enable;
        self
    }

    /// Builder: bound the signature cache.
    #[must_use]
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = Some(capacity);
        self
    }
}

// =============================================================================
// Compiler
// =============================================================================

/// Compiles callables into artifacts.
#[derive(Debug)]
pub struct GraphCompiler {
    config: JitConfig,
    pipeline: RewritePipeline,
    compilations: AtomicUsize,
}

impl GraphCompiler {
    /// Creates a compiler with the standard pass pipeline for `config`.
    pub fn new(config: JitConfig) -> Self {
        let pipeline = RewritePipeline::from_options(&config.rewrite);
        Self {
            config,
            pipeline,
            compilations: AtomicUsize::new(0),
        }
    }

    /// Builder: append a custom pass after the standard ones.
    #[must_use]
    pub fn with_pass(mut self, pass: impl RewritePass + 'static) -> Self {
        self.pipeline.push(pass);
        self
    }

    /// The compiler configuration.
    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    /// The rewrite pipeline.
    pub fn pipeline(&self) -> &RewritePipeline {
        &self.pipeline
    }

    /// Number of artifacts produced so far.
    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::Relaxed)
    }

    /// Compiles one call of `target`.
    pub fn compile(
        &self,
        target: &dyn Forward,
        args: &CallArgs,
        params: &Arc<ParamStore>,
        training: bool,
    ) -> JitResult<CompiledArtifact> {
        let captured = capture(target, args, params)?;
        let captured_nodes = captured.len();
        let rewritten = self.pipeline.run(captured)?;

        let freeze_graph = self.config.enable_freeze && !training;
        let graph = if freeze_graph {
            freeze(&rewritten, params, self.config.preserve_parameters)?
        } else {
            rewritten
        };

        self.compilations.fetch_add(1, Ordering::Relaxed);
        debug!(
            captured_nodes,
            nodes = graph.len(),
            ops = graph.op_count(),
            frozen = freeze_graph,
            "compiled graph"
        );
        Ok(CompiledArtifact::new(graph, params))
    }
}

impl Default for GraphCompiler {
    fn default() -> Self {
        Self::new(JitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JitError;
    use crate::value::Value;
    use diffjit_core::Result;
    use diffjit_tensor::Tensor;

    fn linear_relu(params: &Arc<ParamStore>) -> impl Fn(&CallArgs) -> Result<Value> + Send + Sync {
        let params = Arc::clone(params);
        move |args: &CallArgs| {
            let w = params.require("w")?;
            let b = params.require("b")?;
            let x = args.tensor(0)?;
            let y = x.matmul(&w.transpose(0, 1)?)?.add(&b)?.dropout(0.1)?.relu()?;
            Ok(Value::Tensor(y))
        }
    }

    fn params() -> Arc<ParamStore> {
        let params = Arc::new(ParamStore::new());
        params.register(
            "w",
            Tensor::from_vec(vec![1.0, -1.0, 0.5, 2.0, 0.0, 1.0], &[3, 2]).unwrap(),
        );
        params.register("b", Tensor::from_vec(vec![0.1, 0.2, -0.3], &[3]).unwrap());
        params
    }

    #[test]
    fn test_compile_fuses_and_matches() {
        let params = params();
        let f = linear_relu(&params);
        let x = Tensor::from_vec(vec![1.0, 2.0, -3.0, 0.5], &[2, 2]).unwrap();
        let args = CallArgs::from_tensors([x]);

        let compiler = GraphCompiler::default();
        let artifact = compiler.compile(&f, &args, &params, false).unwrap();
        assert_eq!(artifact.graph().op_count(), 1);
        assert_eq!(artifact.graph().count_ops("fused_linear"), 1);
        assert!(artifact.retains_parameters());
        assert_eq!(compiler.compilations(), 1);

        let eager = f(&args).unwrap().into_tensor().unwrap();
        let compiled = artifact.run(&args).unwrap().into_tensor().unwrap();
        assert!(compiled.allclose(&eager, 1e-5, 1e-6));
    }

    #[test]
    fn test_freeze_inlines_params() {
        let params = params();
        let f = linear_relu(&params);
        let x = Tensor::from_vec(vec![1.0, 2.0], &[1, 2]).unwrap();
        let args = CallArgs::from_tensors([x]);
        let compiler = GraphCompiler::new(JitConfig::new().preserve_parameters(false));
        let artifact = compiler.compile(&f, &args, &params, false).unwrap();
        assert!(!artifact.retains_parameters());
        assert_eq!(artifact.graph().param_count(), 0);
    }

    #[test]
    fn test_training_skips_freeze() {
        let params = params();
        let f = linear_relu(&params);
        let x = Tensor::from_vec(vec![1.0, 2.0], &[1, 2]).unwrap();
        let args = CallArgs::from_tensors([x]);
        let compiler = GraphCompiler::new(JitConfig::new().preserve_parameters(false));
        let artifact = compiler.compile(&f, &args, &params, true).unwrap();
        assert!(artifact.retains_parameters());
    }

    #[test]
    fn test_untraceable_not_counted() {
        let params = Arc::new(ParamStore::new());
        let f = |args: &CallArgs| -> Result<Value> {
            let v = args.tensor(0)?.to_vec();
            Ok(Value::Float(f64::from(v[0])))
        };
        let x = Tensor::from_vec(vec![1.0], &[1]).unwrap();
        let compiler = GraphCompiler::default();
        let err = compiler
            .compile(&f, &CallArgs::from_tensors([x]), &params, false)
            .unwrap_err();
        assert!(matches!(err, JitError::Untraceable { .. }));
        assert_eq!(compiler.compilations(), 0);
    }
}
