//! Kernel Backend Selection
//!
//! The accelerated kernel families a pipeline may request are resolved once,
//! before any wrapper is installed, against the device the pipeline runs on.
//! The result only toggles rewrites; kernels themselves live in the runtime.

use std::fmt;

use tracing::warn;

use diffjit_core::Device;
use diffjit_jit::RewriteOptions;

use crate::config::CompilationConfig;

/// Kernel family used by compiled graphs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KernelBackend {
    /// Runtime kernels only.
    #[default]
    Default,
    /// Vendor memory-efficient attention.
    VendorAttention,
    /// Fused normalization kernels.
    FusedBackend,
}

impl KernelBackend {
    /// Resolves the backend requested by `config` for `device`.
    ///
    /// Both accelerated families need a CUDA device. When both are requested
    /// the fused backend is chosen.
    pub fn resolve(config: &CompilationConfig, device: Device) -> Self {
        let requested = if config.enable_triton {
            Self::FusedBackend
        } else if config.enable_xformers {
            Self::VendorAttention
        } else {
            return Self::Default;
        };
        if config.enable_triton && config.enable_xformers {
            warn!("both attention and fused kernels requested, using fused kernels");
        }
        if !device.is_cuda() {
            warn!(backend = %requested, device = %device, "kernel backend unavailable, using default kernels");
            return Self::Default;
        }
        requested
    }

    /// Enables the rewrites this backend relies on.
    pub fn apply(self, options: &mut RewriteOptions) {
        match self {
            Self::Default => {}
            Self::VendorAttention => options.memory_efficient_attention = true,
            Self::FusedBackend => options.fuse_group_norm_silu = true,
        }
    }

    /// Short name used in logs.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::VendorAttention => "vendor_attention",
            Self::FusedBackend => "fused",
        }
    }
}

impl fmt::Display for KernelBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
