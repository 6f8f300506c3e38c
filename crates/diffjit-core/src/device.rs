//! Device Abstraction - Execution Target Descriptors
//!
//! Describes where tensors live and what the target can do. The compiler
//! never allocates on a device itself; it only reads the descriptor the caller
//! already established and asks capability questions of it (can the device
//! replay a recorded operation stream, does it have tensor cores that prefer
//! channels-last convolution inputs).
//!
//! # Example
//! ```rust
//! use diffjit_core::Device;
//!
//! let cpu = Device::Cpu;
//! assert!(cpu.is_cpu());
//! assert!(!cpu.supports_stream_replay());
//!
//! let gpu: Device = "cuda:1".parse().unwrap();
//! assert_eq!(gpu, Device::Cuda(1));
//! ```
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

// =============================================================================
// Device Enum
// =============================================================================

/// Represents a compute device where tensors are placed and operations executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    /// Host CPU (always available).
    Cpu,

    /// NVIDIA CUDA GPU device with device index.
    Cuda(usize),
}

impl Device {
    /// Returns true if this is a CPU device.
    #[must_use]
    pub const fn is_cpu(self) -> bool {
        matches!(self, Self::Cpu)
    }

    /// Returns true if this is a CUDA device.
    #[must_use]
    pub const fn is_cuda(self) -> bool {
        matches!(self, Self::Cuda(_))
    }

    /// Returns the device index for GPU devices, or 0 for CPU.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Cpu => 0,
            Self::Cuda(idx) => idx,
        }
    }

    /// Returns the name of this device type.
    #[must_use]
    pub const fn device_type(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cuda(_) => "cuda",
        }
    }

    /// Returns true if the device can record an operation stream once and
    /// replay it without host-side dispatch.
    #[must_use]
    pub const fn supports_stream_replay(self) -> bool {
        self.is_cuda()
    }

    /// Returns true if the device has matrix units that favour channels-last
    /// convolution inputs.
    #[must_use]
    pub const fn has_tensor_cores(self) -> bool {
        self.is_cuda()
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::Cpu
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(idx) => write!(f, "cuda:{idx}"),
        }
    }
}

impl FromStr for Device {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda(0)),
            _ => {
                let index = s
                    .strip_prefix("cuda:")
                    .and_then(|idx| idx.parse::<usize>().ok())
                    .ok_or_else(|| Error::invalid_operation(format!("unknown device '{s}'")))?;
                Ok(Self::Cuda(index))
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
