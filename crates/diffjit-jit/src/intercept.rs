//! Call Interception
//!
//! [`LazyTrace`] stands in for a callable. The first call with a new input
//! signature compiles the callable for that signature; later calls run the
//! cached artifact (or its replay buffer). Signatures that cannot be captured
//! are pinned to the original callable for good.
//!
//! While a capture is running on the calling thread the wrapper calls its
//! original directly, so an outer capture records the inner computation
//! inline.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{info, trace, warn};

use diffjit_core::Result;
use diffjit_tensor::trace as tensor_trace;

use crate::artifact::CompiledArtifact;
use crate::cache::{CacheEntry, SignatureCache};
use crate::compile::GraphCompiler;
use crate::context::JitContext;
use crate::error::{JitError, JitResult};
use crate::module::{Forward, ParamStore, Submodule};
use crate::replay::ReplayBuffer;
use crate::signature::InputSignature;
use crate::value::{CallArgs, Value};

type ReplaySlot = Arc<Mutex<Option<ReplayBuffer>>>;

struct ReplayState {
    enabled: AtomicBool,
    buffers: Mutex<FxHashMap<InputSignature, ReplaySlot>>,
}

/// A lazily compiling wrapper around a callable.
pub struct LazyTrace {
    original: Arc<dyn Forward>,
    params: Arc<ParamStore>,
    compiler: Arc<GraphCompiler>,
    cache: SignatureCache,
    replay: Option<ReplayState>,
    ctx: JitContext,
}

impl std::fmt::Debug for LazyTrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyTrace")
            .field("target", &self.ctx.target())
            .field("cache", &self.cache)
            .field("replay", &self.replay_enabled())
            .finish()
    }
}

impl LazyTrace {
    /// Wraps `original`, compiling with `compiler`.
    pub fn new(
        original: Arc<dyn Forward>,
        params: Arc<ParamStore>,
        compiler: Arc<GraphCompiler>,
        ctx: JitContext,
    ) -> Self {
        let config = compiler.config();
        let cache = match config.cache_capacity {
            Some(capacity) => SignatureCache::with_capacity(capacity),
            None => SignatureCache::new(),
        };
        let replay = config.enable_replay.then(|| ReplayState {
            enabled: AtomicBool::new(true),
            buffers: Mutex::new(FxHashMap::default()),
        });
        Self {
            original,
            params,
            compiler,
            cache,
            replay,
            ctx,
        }
    }

    /// The wrapped callable.
    pub fn original(&self) -> &Arc<dyn Forward> {
        &self.original
    }

    /// The per-signature cache.
    pub fn cache(&self) -> &SignatureCache {
        &self.cache
    }

    /// The logging context.
    pub fn context(&self) -> &JitContext {
        &self.ctx
    }

    /// True while replay capture is active for this wrapper.
    pub fn replay_enabled(&self) -> bool {
        self.replay
            .as_ref()
            .is_some_and(|r| r.enabled.load(Ordering::Acquire))
    }

    /// Number of recorded replay buffers.
    pub fn replay_buffers(&self) -> usize {
        self.replay.as_ref().map_or(0, |r| {
            r.buffers
                .lock()
                .values()
                .filter(|slot| slot.try_lock().is_some_and(|b| b.is_some()))
                .count()
        })
    }

    fn dispatch(&self, args: &CallArgs) -> JitResult<Value> {
        let training = self.params.is_training();
        let signature = InputSignature::of(args, training);

        let entry = self.cache.get_or_compile(&signature, || {
            info!(signature = %signature, "compiling");
            let result = self
                .compiler
                .compile(self.original.as_ref(), args, &self.params, training);
            match &result {
                Ok(artifact) => info!(
                    signature = %signature,
                    ops = artifact.graph().op_count(),
                    "compiled"
                ),
                Err(JitError::Untraceable { reason }) => warn!(
                    signature = %signature,
                    reason = %reason,
                    "falling back to eager execution"
                ),
                Err(err) => warn!(signature = %signature, error = %err, "compilation failed"),
            }
            result.map(Arc::new)
        })?;
        self.drop_evicted_buffers();

        match entry {
            CacheEntry::Fallback(_) => {
                trace!(signature = %signature, "fallback");
                Ok(self.original.call(args)?)
            }
            CacheEntry::Compiled(artifact) => {
                trace!(signature = %signature, "cache hit");
                self.run_compiled(&signature, &artifact, args)
            }
        }
    }

    fn drop_evicted_buffers(&self) {
        let evicted = self.cache.take_evicted();
        if evicted.is_empty() {
            return;
        }
        if let Some(replay) = self.replay.as_ref() {
            let mut buffers = replay.buffers.lock();
            for signature in &evicted {
                buffers.remove(signature);
            }
        }
    }

    fn run_compiled(
        &self,
        signature: &InputSignature,
        artifact: &CompiledArtifact,
        args: &CallArgs,
    ) -> JitResult<Value> {
        let Some(replay) = self.replay.as_ref() else {
            return artifact.run(args);
        };
        if signature.is_training() || !replay.enabled.load(Ordering::Acquire) {
            return artifact.run(args);
        }

        let slot = Arc::clone(replay.buffers.lock().entry(signature.clone()).or_default());
        let mut buffer = slot.lock();
        if let Some(recorded) = buffer.as_ref() {
            return recorded.replay(args);
        }
        match ReplayBuffer::record(artifact, args) {
            Ok((recorded, value)) => {
                info!(signature = %signature, instructions = recorded.len(), "recorded replay buffer");
                *buffer = Some(recorded);
                Ok(value)
            }
            Err(JitError::ReplayUnavailable(reason)) => {
                trace!(signature = %signature, reason = %reason, "replay skipped for this call");
                artifact.run(args)
            }
            Err(JitError::UnsupportedDevice { device }) => {
                warn!(device = %device, "replay unsupported, disabling");
                replay.enabled.store(false, Ordering::Release);
                replay.buffers.lock().clear();
                artifact.run(args)
            }
            Err(err) => Err(err),
        }
    }
}

impl Forward for LazyTrace {
    fn call(&self, args: &CallArgs) -> Result<Value> {
        if tensor_trace::is_tracing() {
            return self.original.call(args);
        }
        self.ctx
            .in_scope(|| self.dispatch(args))
            .map_err(Into::into)
    }
}

/// Replaces `entry` of `module` with a [`LazyTrace`] wrapper.
///
/// Returns the installed wrapper so callers can inspect its cache.
pub fn install(
    module: &mut Submodule,
    entry: &str,
    compiler: Arc<GraphCompiler>,
) -> JitResult<Arc<LazyTrace>> {
    let ctx = JitContext::new(format!("{}.{entry}", module.name()));
    install_with_context(module, entry, compiler, ctx)
}

/// Like [`install`] with an explicit logging context.
pub fn install_with_context(
    module: &mut Submodule,
    entry: &str,
    compiler: Arc<GraphCompiler>,
    ctx: JitContext,
) -> JitResult<Arc<LazyTrace>> {
    let params = Arc::clone(module.params());
    let mut installed = None;
    module.intercept(entry, |original| {
        let wrapper = Arc::new(LazyTrace::new(original, params, compiler, ctx.clone()));
        installed = Some(Arc::clone(&wrapper));
        wrapper as Arc<dyn Forward>
    })?;
    ctx.in_scope(|| info!("installed lazy trace"));
    installed.ok_or_else(|| JitError::MissingEntryPoint(entry.to_string()))
}
