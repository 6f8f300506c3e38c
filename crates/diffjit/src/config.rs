//! Compilation Configuration
//!
//! [`CompilationConfig`] selects what the pipeline compiler installs and which
//! rewrites run. It round-trips through serde with every field optional.
//!
//! # Example
//! ```rust
//! use diffjit::CompilationConfig;
//! use diffjit_core::{Device, MemoryFormat};
//!
//! let config = CompilationConfig::for_device(Device::Cuda(0))
//!     .enable_cuda_graph(true)
//!     .prefer_lowp_gemm(false);
//! assert_eq!(config.memory_format, Some(MemoryFormat::ChannelsLast));
//! assert!(config.enable_jit);
//! ```
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use serde::{Deserialize, Serialize};

use diffjit_core::{Device, MemoryFormat};
use diffjit_jit::{JitConfig, RewriteOptions};

use crate::backend::KernelBackend;

// =============================================================================
// CompilationConfig
// =============================================================================

/// Options for [`compile`](crate::compile) and [`compile_unet`](crate::compile_unet).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilationConfig {
    /// Memory format for module parameters and convolution inputs.
    pub memory_format: Option<MemoryFormat>,
    /// Install lazy-trace wrappers.
    pub enable_jit: bool,
    /// Freeze inference-mode graphs.
    pub enable_jit_freeze: bool,
    /// Keep parameters as live references when freezing.
    pub preserve_parameters: bool,
    /// Fuse convolutions with bias, residual and activation.
    pub enable_cnn_optimization: bool,
    /// Fuse matmul, bias and activation into linear ops.
    pub enable_linear_fusion: bool,
    /// Prefer reduced-precision GEMM accumulation.
    pub prefer_lowp_gemm: bool,
    /// Request the vendor memory-efficient attention kernel.
    pub enable_xformers: bool,
    /// Record replay buffers for the denoising networks.
    pub enable_cuda_graph: bool,
    /// Request the fused kernel backend.
    pub enable_triton: bool,
    /// Intercept the scheduler's `scale_model_input` and `step`.
    pub trace_scheduler: bool,
}

impl Default for CompilationConfig {
    fn default() -> Self {
        Self::for_device(Device::default())
    }
}

impl CompilationConfig {
    /// Defaults for a pipeline placed on `device`.
    ///
    /// Devices with tensor cores get channels-last convolution inputs.
    pub fn for_device(device: Device) -> Self {
        Self {
            memory_format: device.has_tensor_cores().then_some(MemoryFormat::ChannelsLast),
            enable_jit: true,
            enable_jit_freeze: true,
            preserve_parameters: true,
            enable_cnn_optimization: true,
            enable_linear_fusion: true,
            prefer_lowp_gemm: true,
            enable_xformers: false,
            enable_cuda_graph: false,
            enable_triton: false,
            trace_scheduler: false,
        }
    }

    /// Builder: set the memory format.
    #[must_use]
    pub fn memory_format(mut self, format: Option<MemoryFormat>) -> Self {
        self.memory_format = format;
        self
    }

    /// Builder: enable lazy tracing.
    #[must_use]
    pub fn enable_jit(mut self, enable: bool) -> Self {
        self.enable_jit = enable;
        self
    }

    /// Builder: enable freezing.
    #[must_use]
    pub fn enable_jit_freeze(mut self, enable: bool) -> Self {
        self.enable_jit_freeze = enable;
        self
    }

    /// Builder: keep parameters live when freezing.
    #[must_use]
    pub fn preserve_parameters(mut self, preserve: bool) -> Self {
        self.preserve_parameters = preserve;
        self
    }

    /// Builder: enable convolution fusion.
    #[must_use]
    pub fn enable_cnn_optimization(mut self, enable: bool) -> Self {
        self.enable_cnn_optimization = enable;
        self
    }

    /// Builder: enable linear fusion.
    #[must_use]
    pub fn enable_linear_fusion(mut self, enable: bool) -> Self {
        self.enable_linear_fusion = enable;
        self
    }

    /// Builder: prefer reduced-precision GEMMs.
    #[must_use]
    pub fn prefer_lowp_gemm(mut self, prefer: bool) -> Self {
        self.prefer_lowp_gemm = prefer;
        self
    }

    /// Builder: request vendor attention kernels.
    #[must_use]
    pub fn enable_xformers(mut self, enable: bool) -> Self {
        self.enable_xformers = enable;
        self
    }

    /// Builder: enable replay capture.
    #[must_use]
    pub fn enable_cuda_graph(mut self, enable: bool) -> Self {
        self.enable_cuda_graph = enable;
        self
    }

    /// Builder: request the fused kernel backend.
    #[must_use]
    pub fn enable_triton(mut self, enable: bool) -> Self {
        self.enable_triton = enable;
        self
    }

    /// Builder: intercept scheduler steps.
    #[must_use]
    pub fn trace_scheduler(mut self, enable: bool) -> Self {
        self.trace_scheduler = enable;
        self
    }

    /// Rewrite options for a resolved kernel backend.
    pub fn rewrite_options(&self, backend: KernelBackend) -> RewriteOptions {
        let mut options = RewriteOptions {
            fuse_linear: self.enable_linear_fusion,
            memory_format: self.memory_format,
            fuse_conv: self.enable_cnn_optimization,
            prefer_lowp_gemm: self.prefer_lowp_gemm,
            fuse_group_norm_silu: false,
            memory_efficient_attention: false,
        };
        backend.apply(&mut options);
        options
    }

    /// Compiler configuration for one component.
    ///
    /// `replay` is decided per component by the pipeline compiler.
    pub fn jit_config(&self, backend: KernelBackend, replay: bool) -> JitConfig {
        JitConfig::new()
            .enable_freeze(self.enable_jit_freeze)
            .preserve_parameters(self.preserve_parameters)
            .rewrite(self.rewrite_options(backend))
            .enable_replay(replay)
    }
}
