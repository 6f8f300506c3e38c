//! Diffjit Core - Foundation Layer for the Diffjit Graph Compiler
//!
//! This crate provides the core abstractions shared by the tensor runtime and
//! the graph compiler: device descriptors, element types, memory formats,
//! reference-counted storage and the runtime error type.
//!
//! # Key Features
//! - Device descriptors with capability queries (stream replay, tensor cores)
//! - Runtime dtype system including half precision rounding
//! - Memory format tags (contiguous / channels-last)
//! - Reference-counted storage with weak handles for leak checks
//!
//! # Example
//! ```rust
//! use diffjit_core::{Device, Storage};
//!
//! let storage = Storage::zeros(1024, Device::Cpu);
//! assert_eq!(storage.len(), 1024);
//! ```
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

// =============================================================================
// Modules
// =============================================================================

pub mod device;
pub mod dtype;
pub mod error;
pub mod layout;
pub mod storage;

// =============================================================================
// Re-exports
// =============================================================================

pub use device::Device;
pub use dtype::DType;
pub use error::{Error, Result};
pub use layout::MemoryFormat;
pub use storage::{Storage, WeakStorage};

// =============================================================================
// Prelude
// =============================================================================

/// Convenient imports for common usage.
pub mod prelude {
    pub use crate::device::Device;
    pub use crate::dtype::DType;
    pub use crate::error::{Error, Result};
    pub use crate::layout::MemoryFormat;
    pub use crate::storage::Storage;
}
