//! Logging context carried by each interception wrapper.

use tracing::Span;

/// Explicit logging context for one compiled target.
///
/// Every compile, fallback and replay event of a wrapper is emitted inside
/// this context's span, so log lines carry the target name without any
/// process-wide state.
#[derive(Debug, Clone)]
pub struct JitContext {
    target: String,
    span: Span,
}

impl JitContext {
    /// Creates a context for the named target.
    pub fn new(target: impl Into<String>) -> Self {
        let target = target.into();
        let span = tracing::info_span!("diffjit", target = %target);
        Self { target, span }
    }

    /// Creates a context nested under a parent span.
    pub fn child_of(parent: &Span, target: impl Into<String>) -> Self {
        let target = target.into();
        let span = tracing::info_span!(parent: parent, "diffjit", target = %target);
        Self { target, span }
    }

    /// Name of the target.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The span events are recorded in.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Runs `f` inside the context's span.
    pub fn in_scope<R>(&self, f: impl FnOnce() -> R) -> R {
        self.span.in_scope(f)
    }
}
