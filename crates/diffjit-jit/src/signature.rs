//! Input Signatures
//!
//! The cache key of a compiled artifact. Two calls with equal signatures
//! capture structurally identical graphs: same tensor metadata, same
//! container structure, same scalar values (scalars are baked into the graph
//! as constants) and the same aliasing between tensor arguments.

use std::fmt;

use diffjit_core::{DType, Device, MemoryFormat};
use diffjit_tensor::Tensor;

use crate::value::{CallArgs, Value};

/// One element of a flattened signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SignatureToken {
    /// Positional argument count.
    Args(usize),
    /// Keyword argument names in canonical order.
    Kwargs(Vec<String>),
    /// A tensor leaf.
    Tensor {
        /// Logical shape.
        shape: Vec<usize>,
        /// Element type.
        dtype: DType,
        /// Device tag.
        device: Device,
        /// Physical memory format.
        format: MemoryFormat,
        /// Index of an earlier tensor argument sharing this storage.
        alias_of: Option<usize>,
    },
    /// List of the given length.
    List(usize),
    /// Tuple of the given length.
    Tuple(usize),
    /// Mapping with the given keys.
    Dict(Vec<String>),
    /// Integer scalar.
    Int(i64),
    /// Float scalar, by bit pattern.
    Float(u64),
    /// Boolean scalar.
    Bool(bool),
    /// String leaf.
    Str(String),
    /// Absent value.
    None,
}

/// Cache key derived from one call's arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InputSignature {
    tokens: Vec<SignatureToken>,
    training: bool,
}

impl InputSignature {
    /// Computes the signature of a call.
    pub fn of(args: &CallArgs, training: bool) -> Self {
        let mut builder = Builder::default();
        builder.tokens.push(SignatureToken::Args(args.args.len()));
        for value in &args.args {
            builder.visit(value);
        }
        builder
            .tokens
            .push(SignatureToken::Kwargs(args.kwargs.keys().cloned().collect()));
        for value in args.kwargs.values() {
            builder.visit(value);
        }
        Self {
            tokens: builder.tokens,
            training,
        }
    }

    /// The flattened tokens.
    pub fn tokens(&self) -> &[SignatureToken] {
        &self.tokens
    }

    /// Whether the call ran in training mode.
    pub const fn is_training(&self) -> bool {
        self.training
    }

    /// Number of tensor leaves.
    pub fn tensor_count(&self) -> usize {
        self.tokens
            .iter()
            .filter(|t| matches!(t, SignatureToken::Tensor { .. }))
            .count()
    }

    /// Tensor metadata in canonical order.
    pub fn tensor_shapes(&self) -> Vec<&[usize]> {
        self.tokens
            .iter()
            .filter_map(|t| match t {
                SignatureToken::Tensor { shape, .. } => Some(shape.as_slice()),
                _ => None,
            })
            .collect()
    }
}

impl fmt::Display for InputSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for token in &self.tokens {
            if let SignatureToken::Tensor {
                shape,
                dtype,
                device,
                format,
                alias_of,
            } = token
            {
                if !first {
                    write!(f, ", ")?;
                }
                first = false;
                write!(f, "{dtype}{shape:?}@{device}")?;
                if *format == MemoryFormat::ChannelsLast {
                    write!(f, "/cl")?;
                }
                if let Some(i) = alias_of {
                    write!(f, "=#{i}")?;
                }
            }
        }
        if self.training {
            write!(f, " [train]")?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct Builder<'a> {
    tokens: Vec<SignatureToken>,
    seen: Vec<&'a Tensor>,
}

impl<'a> Builder<'a> {
    fn visit(&mut self, value: &'a Value) {
        match value {
            Value::Tensor(t) => {
                let alias_of = self.seen.iter().position(|s| s.shares_storage(t));
                self.tokens.push(SignatureToken::Tensor {
                    shape: t.shape().to_vec(),
                    dtype: t.dtype(),
                    device: t.device(),
                    format: t.memory_format(),
                    alias_of,
                });
                self.seen.push(t);
            }
            Value::List(items) => {
                self.tokens.push(SignatureToken::List(items.len()));
                items.iter().for_each(|v| self.visit(v));
            }
            Value::Tuple(items) => {
                self.tokens.push(SignatureToken::Tuple(items.len()));
                items.iter().for_each(|v| self.visit(v));
            }
            Value::Dict(map) => {
                self.tokens
                    .push(SignatureToken::Dict(map.keys().cloned().collect()));
                map.values().for_each(|v| self.visit(v));
            }
            Value::Int(v) => self.tokens.push(SignatureToken::Int(*v)),
            Value::Float(v) => self.tokens.push(SignatureToken::Float(v.to_bits())),
            Value::Bool(v) => self.tokens.push(SignatureToken::Bool(*v)),
            Value::Str(v) => self.tokens.push(SignatureToken::Str(v.clone())),
            Value::None => self.tokens.push(SignatureToken::None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn x(shape: &[usize]) -> Tensor {
        Tensor::from_vec(vec![0.0; shape.iter().product()], shape).unwrap()
    }

    #[test]
    fn test_same_shapes_same_signature() {
        let a = InputSignature::of(&CallArgs::from_tensors([x(&[1, 128])]), false);
        let b = InputSignature::of(&CallArgs::from_tensors([x(&[1, 128])]), false);
        assert_eq!(a, b);
        assert_eq!(a.tensor_count(), 1);
    }

    #[test]
    fn test_shape_dtype_mode_distinguish() {
        let base = InputSignature::of(&CallArgs::from_tensors([x(&[1, 128])]), false);
        let other_shape = InputSignature::of(&CallArgs::from_tensors([x(&[4, 128])]), false);
        let half = x(&[1, 128]).to_dtype(DType::F16).unwrap();
        let other_dtype = InputSignature::of(&CallArgs::from_tensors([half]), false);
        let training = InputSignature::of(&CallArgs::from_tensors([x(&[1, 128])]), true);
        assert_ne!(base, other_shape);
        assert_ne!(base, other_dtype);
        assert_ne!(base, training);
    }

    #[test]
    fn test_scalars_and_structure_key() {
        let a = InputSignature::of(&CallArgs::new().arg(x(&[2])).arg(1.0), false);
        let b = InputSignature::of(&CallArgs::new().arg(x(&[2])).arg(2.0), false);
        let c = InputSignature::of(&CallArgs::new().arg(x(&[2])).kwarg("scale", 1.0), false);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_aliasing_is_part_of_signature() {
        let t = x(&[3]);
        let aliased = InputSignature::of(&CallArgs::from_tensors([t.clone(), t]), false);
        let distinct = InputSignature::of(&CallArgs::from_tensors([x(&[3]), x(&[3])]), false);
        assert_ne!(aliased, distinct);
        assert!(aliased.to_string().contains("=#0"));
    }
}
