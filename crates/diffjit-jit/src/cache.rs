//! Signature Cache
//!
//! Maps input signatures to compiled artifacts or to a permanent fallback.
//! Each signature owns a slot with its own lock, so concurrent first callers
//! of one signature wait for a single compilation while other signatures
//! compile independently.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::artifact::CompiledArtifact;
use crate::error::{JitError, JitResult};
use crate::signature::InputSignature;

/// What a signature resolved to.
#[derive(Debug, Clone)]
pub enum CacheEntry {
    /// A compiled artifact serves the signature.
    Compiled(Arc<CompiledArtifact>),
    /// The signature is served by the original callable.
    Fallback(String),
}

impl CacheEntry {
    /// Returns the artifact of a compiled entry.
    pub fn artifact(&self) -> Option<&Arc<CompiledArtifact>> {
        match self {
            Self::Compiled(a) => Some(a),
            Self::Fallback(_) => None,
        }
    }

    /// True for fallback entries.
    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback(_))
    }
}

type Slot = Arc<Mutex<Option<CacheEntry>>>;

#[derive(Default)]
struct SlotTable {
    slots: FxHashMap<InputSignature, Slot>,
    order: VecDeque<InputSignature>,
    evicted: Vec<InputSignature>,
}

impl SlotTable {
    /// Makes room for one more slot under `capacity`.
    ///
    /// Only idle slots are evicted: a slot some caller still holds is being
    /// compiled or waited on. Unresolved idle slots are leftovers of failed
    /// compilations and are dropped first without counting as evictions.
    fn make_room(&mut self, capacity: usize) {
        let idle = |slot: &Slot| Arc::strong_count(slot) == 1;
        self.slots
            .retain(|_, slot| !idle(slot) || slot.lock().is_some());
        let slots = &self.slots;
        self.order.retain(|sig| slots.contains_key(sig));

        while self.slots.len() >= capacity {
            let Some(pos) = self
                .order
                .iter()
                .position(|sig| self.slots.get(sig).is_some_and(idle))
            else {
                break;
            };
            if let Some(oldest) = self.order.remove(pos) {
                self.slots.remove(&oldest);
                self.evicted.push(oldest);
            }
        }
    }
}

/// Cache of compiled artifacts keyed by input signature.
pub struct SignatureCache {
    table: RwLock<SlotTable>,
    capacity: Option<usize>,
    hits: AtomicUsize,
    misses: AtomicUsize,
    compilations: AtomicUsize,
    fallbacks: AtomicUsize,
    failures: AtomicUsize,
}

impl SignatureCache {
    /// Creates an unbounded cache.
    pub fn new() -> Self {
        Self {
            table: RwLock::new(SlotTable::default()),
            capacity: None,
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
            compilations: AtomicUsize::new(0),
            fallbacks: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    /// Creates a cache that evicts the oldest signature beyond `capacity`.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity.max(1)),
            ..Self::new()
        }
    }

    fn slot(&self, signature: &InputSignature) -> Slot {
        if let Some(slot) = self.table.read().slots.get(signature) {
            return Arc::clone(slot);
        }
        let mut table = self.table.write();
        if let Some(slot) = table.slots.get(signature) {
            return Arc::clone(slot);
        }
        if let Some(capacity) = self.capacity {
            table.make_room(capacity);
        }
        let slot = Slot::default();
        table.slots.insert(signature.clone(), Arc::clone(&slot));
        table.order.push_back(signature.clone());
        slot
    }

    /// Returns the entry for a signature, compiling it on first use.
    ///
    /// An untraceable error is stored as a permanent fallback. Any other
    /// error is returned and leaves the signature uncompiled, so the next
    /// call retries.
    pub fn get_or_compile(
        &self,
        signature: &InputSignature,
        compile: impl FnOnce() -> JitResult<Arc<CompiledArtifact>>,
    ) -> JitResult<CacheEntry> {
        let slot = self.slot(signature);
        let mut entry = slot.lock();
        if let Some(existing) = entry.as_ref() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(existing.clone());
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let resolved = match compile() {
            Ok(artifact) => {
                self.compilations.fetch_add(1, Ordering::Relaxed);
                CacheEntry::Compiled(artifact)
            }
            Err(JitError::Untraceable { reason }) => {
                self.fallbacks.fetch_add(1, Ordering::Relaxed);
                CacheEntry::Fallback(reason)
            }
            Err(err) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        };
        *entry = Some(resolved.clone());
        Ok(resolved)
    }

    /// Returns the entry for a signature without compiling.
    pub fn get(&self, signature: &InputSignature) -> Option<CacheEntry> {
        let slot = self.table.read().slots.get(signature).cloned()?;
        let entry = slot.lock().clone();
        entry
    }

    /// Number of resolved signatures. Slots being compiled are not counted.
    pub fn len(&self) -> usize {
        self.table
            .read()
            .slots
            .values()
            .filter(|slot| slot.try_lock().is_some_and(|e| e.is_some()))
            .count()
    }

    /// Returns true when no signature is resolved.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes the signatures evicted since the last call.
    pub fn take_evicted(&self) -> Vec<InputSignature> {
        if self.capacity.is_none() {
            return Vec::new();
        }
        std::mem::take(&mut self.table.write().evicted)
    }

    /// Drops every entry. Counters are kept.
    pub fn clear(&self) {
        let mut table = self.table.write();
        table.slots.clear();
        table.order.clear();
        table.evicted.clear();
    }

    /// Returns cache statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            compilations: self.compilations.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for SignatureCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SignatureCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureCache")
            .field("stats", &self.stats())
            .finish()
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of resolved signatures.
    pub entries: usize,
    /// Eviction bound, if any.
    pub capacity: Option<usize>,
    /// Calls served from an existing entry.
    pub hits: usize,
    /// Calls that found no entry.
    pub misses: usize,
    /// Successful compilations.
    pub compilations: usize,
    /// Signatures pinned to the original callable.
    pub fallbacks: usize,
    /// Compilations that failed with a propagated error.
    pub failures: usize,
}
