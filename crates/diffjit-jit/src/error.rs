//! JIT Error Types
//!
//! Error handling for capture, rewrite, freeze and interception.
//!
//! `Untraceable`, `UnsupportedDevice` and `ReplayUnavailable` are recovered
//! inside the interception layer. Everything else reaches the caller; at the [`crate::Forward`]
//! boundary runtime errors pass through untouched and compilation failures
//! become [`diffjit_core::Error::Compilation`].

use diffjit_core::Device;
use thiserror::Error;

/// Result type for JIT operations.
pub type JitResult<T> = Result<T, JitError>;

/// JIT compilation errors.
#[derive(Debug, Clone, Error)]
pub enum JitError {
    /// The callable cannot be captured for this signature.
    #[error("untraceable: {reason}")]
    Untraceable {
        /// What the callable did that a graph cannot express.
        reason: String,
    },

    /// A rewrite pass produced an inconsistent graph.
    #[error("rewrite pass '{pass}' failed: {message}")]
    RewritePass {
        /// Name of the failing pass.
        pass: String,
        /// What went wrong.
        message: String,
    },

    /// Replay capture was requested on a device that cannot replay.
    #[error("replay capture is not supported on {device}")]
    UnsupportedDevice {
        /// The offending device.
        device: Device,
    },

    /// This call cannot be recorded for replay; it runs the artifact directly.
    #[error("replay unavailable for this call: {0}")]
    ReplayUnavailable(String),

    /// Invalid graph structure.
    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    /// Call arguments do not match the artifact's signature.
    #[error("signature mismatch: {0}")]
    SignatureMismatch(String),

    /// A parameter referenced by the graph is not in the store.
    #[error("parameter '{0}' not found")]
    MissingParameter(String),

    /// The submodule has no entry point with this name.
    #[error("entry point '{0}' not found")]
    MissingEntryPoint(String),

    /// Capture was attempted while another capture runs on this thread.
    #[error("a trace session is already active on this thread")]
    TraceActive,

    /// Error raised by the tensor runtime or the wrapped callable.
    #[error(transparent)]
    Runtime(#[from] diffjit_core::Error),
}

impl JitError {
    /// Creates an untraceable error.
    pub fn untraceable(reason: impl Into<String>) -> Self {
        Self::Untraceable {
            reason: reason.into(),
        }
    }

    /// Creates a rewrite pass error.
    pub fn rewrite(pass: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RewritePass {
            pass: pass.into(),
            message: message.into(),
        }
    }

    /// True if this error should pin the signature to the original callable.
    pub fn is_untraceable(&self) -> bool {
        matches!(self, Self::Untraceable { .. })
    }
}

impl From<JitError> for diffjit_core::Error {
    fn from(err: JitError) -> Self {
        match err {
            JitError::Runtime(inner) => inner,
            other => Self::compilation(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = JitError::rewrite("fuse_linear", "dangling edge");
        assert_eq!(
            err.to_string(),
            "rewrite pass 'fuse_linear' failed: dangling edge"
        );
    }

    #[test]
    fn test_runtime_error_passes_through() {
        let inner = diffjit_core::Error::invalid_operation("boom");
        let err: JitError = inner.clone().into();
        let back: diffjit_core::Error = err.into();
        assert_eq!(back, inner);
    }

    #[test]
    fn test_compile_errors_become_compilation() {
        let back: diffjit_core::Error = JitError::InvalidGraph("cycle".into()).into();
        assert!(matches!(back, diffjit_core::Error::Compilation { .. }));
    }

    #[test]
    fn test_is_untraceable() {
        assert!(JitError::untraceable("item()").is_untraceable());
        assert!(!JitError::TraceActive.is_untraceable());
    }
}
