//! Structured Call Values
//!
//! Callables take and return nested values: tensors, scalars, strings and
//! containers of them. Tensors are always enumerated depth-first, positional
//! arguments before keyword arguments, and mapping entries in key order. The
//! capture engine, the signature and the executor all rely on that order.

use std::collections::BTreeMap;

use diffjit_core::{Error, Result};
use diffjit_tensor::{Tensor, TensorId};

// =============================================================================
// Value
// =============================================================================

/// A structured argument or return value.
#[derive(Debug, Clone)]
pub enum Value {
    /// A tensor.
    Tensor(Tensor),
    /// Integer scalar.
    Int(i64),
    /// Floating-point scalar.
    Float(f64),
    /// Boolean scalar.
    Bool(bool),
    /// String.
    Str(String),
    /// Absent value.
    None,
    /// Variable-length sequence.
    List(Vec<Value>),
    /// Fixed-length sequence.
    Tuple(Vec<Value>),
    /// String-keyed mapping.
    Dict(BTreeMap<String, Value>),
}

impl Value {
    /// Returns the tensor if this is a tensor value.
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Self::Tensor(t) => Some(t),
            _ => None,
        }
    }

    /// Unwraps a tensor value.
    pub fn into_tensor(self) -> Result<Tensor> {
        match self {
            Self::Tensor(t) => Ok(t),
            other => Err(Error::invalid_operation(format!(
                "expected a tensor value, got {}",
                other.kind_name()
            ))),
        }
    }

    /// Returns the integer if this is an integer value.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the float, widening integers.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Short name of the value's kind.
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Tensor(_) => "tensor",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Bool(_) => "bool",
            Self::Str(_) => "str",
            Self::None => "none",
            Self::List(_) => "list",
            Self::Tuple(_) => "tuple",
            Self::Dict(_) => "dict",
        }
    }

    /// All tensors in canonical order.
    pub fn tensors(&self) -> Vec<&Tensor> {
        let mut out = Vec::new();
        self.collect_tensors(&mut out);
        out
    }

    fn collect_tensors<'a>(&'a self, out: &mut Vec<&'a Tensor>) {
        match self {
            Self::Tensor(t) => out.push(t),
            Self::List(items) | Self::Tuple(items) => {
                for item in items {
                    item.collect_tensors(out);
                }
            }
            Self::Dict(map) => {
                for item in map.values() {
                    item.collect_tensors(out);
                }
            }
            _ => {}
        }
    }
}

impl From<Tensor> for Value {
    fn from(t: Tensor) -> Self {
        Self::Tensor(t)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

// =============================================================================
// Call Arguments
// =============================================================================

/// Positional and keyword arguments of one call.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Keyword arguments.
    pub kwargs: BTreeMap<String, Value>,
}

impl CallArgs {
    /// Creates an empty argument list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates arguments from positional tensors.
    pub fn from_tensors(tensors: impl IntoIterator<Item = Tensor>) -> Self {
        Self {
            args: tensors.into_iter().map(Value::Tensor).collect(),
            kwargs: BTreeMap::new(),
        }
    }

    /// Builder: append a positional argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Builder: set a keyword argument.
    #[must_use]
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Positional argument `index`.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// Keyword argument `name`.
    pub fn get_kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }

    /// Positional tensor argument `index`, or an error naming it.
    pub fn tensor(&self, index: usize) -> Result<&Tensor> {
        self.get(index).and_then(Value::as_tensor).ok_or_else(|| {
            Error::invalid_operation(format!("argument {index} must be a tensor"))
        })
    }

    /// All tensors in canonical order.
    pub fn tensors(&self) -> Vec<&Tensor> {
        let mut out = Vec::new();
        for value in &self.args {
            value.collect_tensors(&mut out);
        }
        for value in self.kwargs.values() {
            value.collect_tensors(&mut out);
        }
        out
    }

    /// Rebuilds the arguments with their tensors replaced in canonical order.
    pub fn with_tensors(&self, tensors: &[Tensor]) -> Result<Self> {
        let mut iter = tensors.iter();
        let args = self
            .args
            .iter()
            .map(|v| substitute(v, &mut iter))
            .collect::<Result<Vec<_>>>()?;
        let kwargs = self
            .kwargs
            .iter()
            .map(|(k, v)| Ok((k.clone(), substitute(v, &mut iter)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(Self { args, kwargs })
    }
}

fn substitute<'a>(value: &Value, tensors: &mut impl Iterator<Item = &'a Tensor>) -> Result<Value> {
    Ok(match value {
        Value::Tensor(_) => Value::Tensor(
            tensors
                .next()
                .cloned()
                .ok_or_else(|| Error::invalid_operation("not enough tensors to substitute"))?,
        ),
        Value::List(items) => Value::List(
            items
                .iter()
                .map(|v| substitute(v, tensors))
                .collect::<Result<_>>()?,
        ),
        Value::Tuple(items) => Value::Tuple(
            items
                .iter()
                .map(|v| substitute(v, tensors))
                .collect::<Result<_>>()?,
        ),
        Value::Dict(map) => Value::Dict(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), substitute(v, tensors)?)))
                .collect::<Result<_>>()?,
        ),
        other => other.clone(),
    })
}

// =============================================================================
// Output Template
// =============================================================================

/// Shape of a callable's return value with tensors replaced by output slots.
#[derive(Debug, Clone)]
pub enum OutputTemplate {
    /// The `n`-th graph output.
    Tensor(usize),
    /// A non-tensor leaf, returned as captured.
    Leaf(Value),
    /// List of templates.
    List(Vec<OutputTemplate>),
    /// Tuple of templates.
    Tuple(Vec<OutputTemplate>),
    /// Mapping of templates.
    Dict(BTreeMap<String, OutputTemplate>),
}

impl Default for OutputTemplate {
    fn default() -> Self {
        Self::Leaf(Value::None)
    }
}

impl OutputTemplate {
    /// Builds a template from a returned value, listing its tensors in order.
    pub fn from_value(value: &Value, tensors: &mut Vec<TensorId>) -> Self {
        match value {
            Value::Tensor(t) => {
                tensors.push(t.id());
                Self::Tensor(tensors.len() - 1)
            }
            Value::List(items) => {
                Self::List(items.iter().map(|v| Self::from_value(v, tensors)).collect())
            }
            Value::Tuple(items) => {
                Self::Tuple(items.iter().map(|v| Self::from_value(v, tensors)).collect())
            }
            Value::Dict(map) => Self::Dict(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_value(v, tensors)))
                    .collect(),
            ),
            leaf => Self::Leaf(leaf.clone()),
        }
    }

    /// Rebuilds the return value from output tensors.
    pub fn fill(&self, outputs: &[Tensor]) -> Result<Value> {
        Ok(match self {
            Self::Tensor(i) => Value::Tensor(outputs.get(*i).cloned().ok_or_else(|| {
                Error::internal(format!("output slot {i} missing ({} outputs)", outputs.len()))
            })?),
            Self::Leaf(v) => v.clone(),
            Self::List(items) => {
                Value::List(items.iter().map(|t| t.fill(outputs)).collect::<Result<_>>()?)
            }
            Self::Tuple(items) => {
                Value::Tuple(items.iter().map(|t| t.fill(outputs)).collect::<Result<_>>()?)
            }
            Self::Dict(map) => Value::Dict(
                map.iter()
                    .map(|(k, t)| Ok((k.clone(), t.fill(outputs)?)))
                    .collect::<Result<_>>()?,
            ),
        })
    }

    /// Highest output slot referenced, plus one.
    pub fn slot_count(&self) -> usize {
        match self {
            Self::Tensor(i) => i + 1,
            Self::Leaf(_) => 0,
            Self::List(items) | Self::Tuple(items) => {
                items.iter().map(Self::slot_count).max().unwrap_or(0)
            }
            Self::Dict(map) => map.values().map(Self::slot_count).max().unwrap_or(0),
        }
    }
}
