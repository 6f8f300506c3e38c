//! Error Types - Pipeline Compilation Errors
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use thiserror::Error;

use diffjit_jit::JitError;

/// Errors raised while compiling a pipeline.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// Installing or configuring a wrapper failed.
    #[error("jit error: {0}")]
    Jit(#[from] JitError),

    /// The tensor runtime rejected a conversion.
    #[error(transparent)]
    Runtime(#[from] diffjit_core::Error),

    /// A component does not provide an entry point the compiler needs.
    #[error("component '{component}' has no entry point '{entry}'")]
    MissingEntryPoint {
        /// Component name.
        component: String,
        /// Entry point name.
        entry: String,
    },

    /// The configuration cannot be applied.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for pipeline compilation.
pub type PipelineResult<T> = Result<T, PipelineError>;
