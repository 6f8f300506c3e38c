//! Callables, Parameters and Submodules
//!
//! A [`Submodule`] is the structure the compiler rewires: a table of named
//! entry points (`forward`, `decode`, ...) plus the device/dtype descriptor and
//! the [`ParamStore`] shared by every entry point's implementation.
//! Interception replaces an entry in that table with a wrapper that has the
//! same call contract.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use diffjit_core::{DType, Device, Error, MemoryFormat, Result};
use diffjit_tensor::{Tensor, TensorId};

use crate::error::{JitError, JitResult};
use crate::value::{CallArgs, Value};

// =============================================================================
// Forward
// =============================================================================

/// A callable with a structured call contract.
pub trait Forward: Send + Sync {
    /// Invokes the callable.
    fn call(&self, args: &CallArgs) -> Result<Value>;
}

impl<F> Forward for F
where
    F: Fn(&CallArgs) -> Result<Value> + Send + Sync,
{
    fn call(&self, args: &CallArgs) -> Result<Value> {
        self(args)
    }
}

// =============================================================================
// Parameter Store
// =============================================================================

/// Named parameter tensors of one module, shared with its callables.
///
/// Callables read parameters through the store on every call, so replacing a
/// parameter is visible to the next call. The training flag lives here as
/// well because it keys compiled artifacts.
#[derive(Debug, Default)]
pub struct ParamStore {
    params: RwLock<Vec<(String, Tensor)>>,
    training: AtomicBool,
}

impl ParamStore {
    /// Creates an empty store in inference mode.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a parameter, replacing any previous one with the same name.
    pub fn register(&self, name: impl Into<String>, tensor: Tensor) {
        let name = name.into();
        let mut params = self.params.write();
        match params.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = tensor,
            None => params.push((name, tensor)),
        }
    }

    /// Returns the current value of a parameter.
    pub fn get(&self, name: &str) -> Option<Tensor> {
        self.params
            .read()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t.clone())
    }

    /// Returns a parameter or a runtime error naming it.
    pub fn require(&self, name: &str) -> Result<Tensor> {
        self.get(name)
            .ok_or_else(|| Error::invalid_operation(format!("unknown parameter '{name}'")))
    }

    /// Replaces an existing parameter with a tensor of the same shape.
    pub fn set(&self, name: &str, tensor: Tensor) -> Result<()> {
        let mut params = self.params.write();
        let slot = params
            .iter_mut()
            .find(|(n, _)| n == name)
            .ok_or_else(|| Error::invalid_operation(format!("unknown parameter '{name}'")))?;
        if slot.1.shape() != tensor.shape() {
            return Err(Error::shape_mismatch(slot.1.shape(), tensor.shape()));
        }
        slot.1 = tensor;
        Ok(())
    }

    /// Finds the name of the parameter holding exactly this tensor value.
    pub fn name_of(&self, id: TensorId) -> Option<String> {
        self.params
            .read()
            .iter()
            .find(|(_, t)| t.id() == id)
            .map(|(n, _)| n.clone())
    }

    /// Parameter names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.params.read().iter().map(|(n, _)| n.clone()).collect()
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.params.read().len()
    }

    /// Returns true when no parameter is registered.
    pub fn is_empty(&self) -> bool {
        self.params.read().is_empty()
    }

    /// Replaces every parameter by `f(parameter)`.
    pub fn map_in_place(&self, f: impl Fn(&Tensor) -> Result<Tensor>) -> Result<()> {
        let mut params = self.params.write();
        for (_, t) in params.iter_mut() {
            *t = f(t)?;
        }
        Ok(())
    }

    /// True when the owning module is in training mode.
    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::Acquire)
    }

    /// Switches training mode.
    pub fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Release);
    }
}

// =============================================================================
// Submodule
// =============================================================================

/// A pipeline component with named entry points.
pub struct Submodule {
    name: String,
    device: Device,
    dtype: DType,
    memory_format: MemoryFormat,
    params: Arc<ParamStore>,
    entry_points: FxHashMap<String, Arc<dyn Forward>>,
}

impl std::fmt::Debug for Submodule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut entries: Vec<&String> = self.entry_points.keys().collect();
        entries.sort();
        f.debug_struct("Submodule")
            .field("name", &self.name)
            .field("device", &self.device)
            .field("dtype", &self.dtype)
            .field("memory_format", &self.memory_format)
            .field("params", &self.params.len())
            .field("entry_points", &entries)
            .finish()
    }
}

impl Submodule {
    /// Creates a submodule with no entry points.
    pub fn new(name: impl Into<String>, device: Device, dtype: DType, params: Arc<ParamStore>) -> Self {
        Self {
            name: name.into(),
            device,
            dtype,
            memory_format: MemoryFormat::Contiguous,
            params,
            entry_points: FxHashMap::default(),
        }
    }

    /// Builder: register an entry point.
    #[must_use]
    pub fn with_entry_point(mut self, name: impl Into<String>, f: Arc<dyn Forward>) -> Self {
        self.set_entry_point(name, f);
        self
    }

    /// Registers or replaces an entry point.
    pub fn set_entry_point(&mut self, name: impl Into<String>, f: Arc<dyn Forward>) {
        self.entry_points.insert(name.into(), f);
    }

    /// Returns an entry point.
    pub fn entry_point(&self, name: &str) -> Option<Arc<dyn Forward>> {
        self.entry_points.get(name).cloned()
    }

    /// Returns true if the entry point exists.
    pub fn has_entry_point(&self, name: &str) -> bool {
        self.entry_points.contains_key(name)
    }

    /// Calls an entry point.
    pub fn call(&self, entry: &str, args: &CallArgs) -> Result<Value> {
        let f = self.entry_points.get(entry).ok_or_else(|| {
            Error::invalid_operation(format!("{} has no entry point '{entry}'", self.name))
        })?;
        f.call(args)
    }

    /// Calls the `forward` entry point.
    pub fn forward(&self, args: &CallArgs) -> Result<Value> {
        self.call("forward", args)
    }

    /// Replaces an entry point with `wrap(original)`.
    pub fn intercept(
        &mut self,
        entry: &str,
        wrap: impl FnOnce(Arc<dyn Forward>) -> Arc<dyn Forward>,
    ) -> JitResult<()> {
        let original = self
            .entry_points
            .remove(entry)
            .ok_or_else(|| JitError::MissingEntryPoint(entry.to_string()))?;
        self.entry_points.insert(entry.to_string(), wrap(original));
        Ok(())
    }

    /// Converts every 4-D parameter to `format`.
    pub fn to_memory_format(&mut self, format: MemoryFormat) -> Result<()> {
        self.params.map_in_place(|t| {
            if t.ndim() == 4 {
                t.to_memory_format(format)
            } else {
                Ok(t.clone())
            }
        })?;
        self.memory_format = format;
        Ok(())
    }

    /// Switches to training mode.
    pub fn train(&self) {
        self.params.set_training(true);
    }

    /// Switches to inference mode.
    pub fn eval(&self) {
        self.params.set_training(false);
    }

    /// Submodule name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Device the parameters live on.
    pub const fn device(&self) -> Device {
        self.device
    }

    /// Parameter dtype.
    pub const fn dtype(&self) -> DType {
        self.dtype
    }

    /// Memory format of 4-D parameters.
    pub const fn memory_format(&self) -> MemoryFormat {
        self.memory_format
    }

    /// The shared parameter store.
    pub fn params(&self) -> &Arc<ParamStore> {
        &self.params
    }

    /// Sorted entry point names.
    pub fn entry_point_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entry_points.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doubler() -> Arc<dyn Forward> {
        Arc::new(|args: &CallArgs| -> Result<Value> {
            Ok(Value::Tensor(args.tensor(0)?.mul_scalar(2.0)?))
        })
    }

    #[test]
    fn test_param_store() {
        let store = ParamStore::new();
        let w = Tensor::from_vec(vec![1.0, 2.0], &[2]).unwrap();
        store.register("w", w.clone());
        assert_eq!(store.name_of(w.id()).as_deref(), Some("w"));
        assert_eq!(store.len(), 1);

        let w2 = Tensor::from_vec(vec![3.0, 4.0], &[2]).unwrap();
        store.set("w", w2.clone()).unwrap();
        assert_eq!(store.get("w").unwrap().id(), w2.id());
        assert!(store.name_of(w.id()).is_none());

        let bad = Tensor::from_vec(vec![1.0], &[1]).unwrap();
        assert!(store.set("w", bad).is_err());
        assert!(store.set("missing", w2).is_err());
    }

    #[test]
    fn test_training_flag() {
        let store = ParamStore::new();
        assert!(!store.is_training());
        store.set_training(true);
        assert!(store.is_training());
    }

    #[test]
    fn test_submodule_call_and_intercept() {
        let mut m = Submodule::new("m", Device::Cpu, DType::F32, Arc::new(ParamStore::new()))
            .with_entry_point("forward", doubler());
        let x = Tensor::from_vec(vec![1.0, 2.0], &[2]).unwrap();
        let args = CallArgs::from_tensors([x]);
        let y = m.forward(&args).unwrap().into_tensor().unwrap();
        assert_eq!(y.to_vec(), vec![2.0, 4.0]);

        m.intercept("forward", |orig| {
            Arc::new(move |args: &CallArgs| -> Result<Value> {
                let y = orig.call(args)?.into_tensor()?;
                Ok(Value::Tensor(y.add_scalar(1.0)?))
            })
        })
        .unwrap();
        let y = m.forward(&args).unwrap().into_tensor().unwrap();
        assert_eq!(y.to_vec(), vec![3.0, 5.0]);

        assert!(matches!(
            m.intercept("decode", |f| f),
            Err(JitError::MissingEntryPoint(_))
        ));
        assert!(m.call("decode", &args).is_err());
    }

    #[test]
    fn test_to_memory_format() {
        let store = Arc::new(ParamStore::new());
        store.register("conv.weight", Tensor::from_vec(vec![0.0; 16], &[2, 2, 2, 2]).unwrap());
        store.register("conv.bias", Tensor::from_vec(vec![0.0; 2], &[2]).unwrap());
        let mut m = Submodule::new("m", Device::Cpu, DType::F32, store.clone());
        m.to_memory_format(MemoryFormat::ChannelsLast).unwrap();
        assert_eq!(m.memory_format(), MemoryFormat::ChannelsLast);
        assert_eq!(
            store.get("conv.weight").unwrap().memory_format(),
            MemoryFormat::ChannelsLast
        );
        assert_eq!(
            store.get("conv.bias").unwrap().memory_format(),
            MemoryFormat::Contiguous
        );
    }
}
