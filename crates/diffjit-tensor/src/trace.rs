//! Trace - Thread-Local Operation Recording
//!
//! While a [`TraceSession`] is alive on a thread, every operation dispatched
//! on that thread is appended to the session's recording together with the
//! exact input and output tensor values. Host reads, in-place writes and
//! random sampling cannot be expressed as dataflow, so they mark the
//! recording as untraceable instead.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::cell::RefCell;
use std::marker::PhantomData;

use diffjit_core::error::{Error, Result};

use crate::ops::OpKind;
use crate::tensor::Tensor;

thread_local! {
    static RECORDER: RefCell<Option<Recording>> = const { RefCell::new(None) };
}

// =============================================================================
// Recording
// =============================================================================

/// One dispatched operation.
#[derive(Debug, Clone)]
pub struct TraceEvent {
    /// The operation.
    pub kind: OpKind,
    /// Operand values at dispatch time.
    pub inputs: Vec<Tensor>,
    /// The produced value.
    pub output: Tensor,
}

/// Everything observed during one trace session.
#[derive(Debug, Default)]
pub struct Recording {
    events: Vec<TraceEvent>,
    untraceable: Option<String>,
}

impl Recording {
    /// Recorded operations in dispatch order.
    #[must_use]
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// Consumes the recording, returning its events.
    #[must_use]
    pub fn into_events(self) -> Vec<TraceEvent> {
        self.events
    }

    /// The first reason the recording cannot stand in for the computation.
    #[must_use]
    pub fn untraceable_reason(&self) -> Option<&str> {
        self.untraceable.as_deref()
    }
}

// =============================================================================
// Session
// =============================================================================

/// RAII guard for an active trace on the current thread.
///
/// Dropping the guard without calling [`TraceSession::finish`] discards the
/// recording.
#[derive(Debug)]
pub struct TraceSession {
    // Sessions are tied to the thread that started them.
    _not_send: PhantomData<*const ()>,
}

/// Starts recording on the current thread.
pub fn start() -> Result<TraceSession> {
    RECORDER.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_some() {
            return Err(Error::invalid_operation(
                "a trace session is already active on this thread",
            ));
        }
        *slot = Some(Recording::default());
        Ok(TraceSession {
            _not_send: PhantomData,
        })
    })
}

impl TraceSession {
    /// Stops recording and returns what was captured.
    #[must_use]
    pub fn finish(self) -> Recording {
        // Drop runs afterwards and finds the slot empty.
        RECORDER.with(|slot| slot.borrow_mut().take().unwrap_or_default())
    }
}

impl Drop for TraceSession {
    fn drop(&mut self) {
        RECORDER.with(|slot| {
            slot.borrow_mut().take();
        });
    }
}

/// Returns true while a trace session is active on this thread.
#[must_use]
pub fn is_tracing() -> bool {
    RECORDER.with(|slot| slot.borrow().is_some())
}

/// Marks the active recording untraceable. No-op outside a session.
///
/// Only the first reason is kept.
pub fn flag_untraceable(reason: &str) {
    RECORDER.with(|slot| {
        if let Some(recording) = slot.borrow_mut().as_mut() {
            if recording.untraceable.is_none() {
                recording.untraceable = Some(reason.to_string());
            }
        }
    });
}

pub(crate) fn record(kind: OpKind, inputs: &[&Tensor], output: &Tensor) {
    RECORDER.with(|slot| {
        if let Some(recording) = slot.borrow_mut().as_mut() {
            recording.events.push(TraceEvent {
                kind,
                inputs: inputs.iter().map(|t| (*t).clone()).collect(),
                output: output.clone(),
            });
        }
    });
}

// =============================================================================
// Tests
// =============================================================================
