//! Capture Engine
//!
//! Runs a callable once under a trace session and turns the recorded
//! operations into a [`Graph`]. Call tensors become graph inputs, registered
//! module parameters become named parameter nodes, and any other tensor the
//! callable touched without producing it is inlined as a private copy.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use rustc_hash::FxHashMap;
use tracing::debug;

use diffjit_tensor::{trace, Tensor, TensorId};

use crate::error::{JitError, JitResult};
use crate::ir::{Graph, NodeId, NodeKind, TensorMeta};
use crate::module::{Forward, ParamStore};
use crate::value::{CallArgs, OutputTemplate};

/// Captures one call of `target` into a graph.
///
/// Errors raised by the callable propagate as [`JitError::Runtime`]. A
/// callable that reads tensor data on the host, writes into a tensor buffer
/// or samples random numbers yields [`JitError::Untraceable`].
pub fn capture(target: &dyn Forward, args: &CallArgs, params: &ParamStore) -> JitResult<Graph> {
    let session = trace::start().map_err(|_| JitError::TraceActive)?;
    let result = target.call(args);
    let recording = session.finish();
    let value = result?;
    if let Some(reason) = recording.untraceable_reason() {
        return Err(JitError::untraceable(reason));
    }

    let mut builder = GraphBuilder::new(params);
    for tensor in args.tensors() {
        builder.add_input(tensor);
    }
    for event in recording.into_events() {
        let inputs = event.inputs.iter().map(|t| builder.resolve(t)).collect();
        let id = builder
            .graph
            .add_op(event.kind, inputs, TensorMeta::of(&event.output));
        builder.values.insert(event.output.id(), id);
    }

    let template = OutputTemplate::from_value(&value, &mut Vec::new());
    let outputs = value
        .tensors()
        .into_iter()
        .map(|t| builder.resolve(t))
        .collect();

    let mut graph = builder.graph;
    graph.set_outputs(outputs, template);
    graph.validate().map_err(JitError::InvalidGraph)?;
    debug!(
        nodes = graph.len(),
        ops = graph.op_count(),
        params = graph.param_count(),
        "captured graph"
    );
    Ok(graph)
}

struct GraphBuilder<'a> {
    graph: Graph,
    values: FxHashMap<TensorId, NodeId>,
    params: &'a ParamStore,
}

impl<'a> GraphBuilder<'a> {
    fn new(params: &'a ParamStore) -> Self {
        Self {
            graph: Graph::new(),
            values: FxHashMap::default(),
            params,
        }
    }

    fn add_input(&mut self, tensor: &Tensor) {
        let id = self.graph.add_input(TensorMeta::of(tensor));
        // an argument passed twice resolves to its first position
        self.values.entry(tensor.id()).or_insert(id);
    }

    /// Node for a tensor, creating a parameter or constant node for tensors
    /// that did not flow in through the arguments.
    fn resolve(&mut self, tensor: &Tensor) -> NodeId {
        if let Some(id) = self.values.get(&tensor.id()) {
            return *id;
        }
        let id = match self.params.name_of(tensor.id()) {
            Some(name) => {
                self.graph
                    .add_node(NodeKind::Param(name), Vec::new(), TensorMeta::of(tensor))
            }
            None => self.graph.add_constant(tensor.deep_clone()),
        };
        self.values.insert(tensor.id(), id);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use diffjit_core::Result;
    use diffjit_tensor::creation;

    fn t(values: Vec<f32>, shape: &[usize]) -> Tensor {
        Tensor::from_vec(values, shape).unwrap()
    }

    #[test]
    fn test_capture_params_and_inputs() {
        let params = ParamStore::new();
        let w = t(vec![1.0, 0.0, 0.0, 1.0], &[2, 2]);
        params.register("w", w);
        let store = &params;
        let f = |args: &CallArgs| -> Result<Value> {
            let w = store.require("w")?;
            Ok(Value::Tensor(args.tensor(0)?.linear(&w, None)?.relu()?))
        };
        let x = t(vec![1.0, -2.0], &[1, 2]);
        let graph = capture(&f, &CallArgs::from_tensors([x]), &params).unwrap();

        assert_eq!(graph.inputs().len(), 1);
        assert_eq!(graph.param_count(), 1);
        assert_eq!(graph.count_ops("linear"), 1);
        assert_eq!(graph.count_ops("relu"), 1);
        assert!(!trace::is_tracing());
    }

    #[test]
    fn test_free_tensors_become_constants() {
        let params = ParamStore::new();
        let bias = t(vec![10.0, 20.0], &[2]);
        let f = move |args: &CallArgs| -> Result<Value> {
            Ok(Value::Tensor(args.tensor(0)?.add(&bias)?))
        };
        let graph = capture(&f, &CallArgs::from_tensors([t(vec![1.0, 2.0], &[2])]), &params)
            .unwrap();
        let constants = graph
            .nodes()
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Constant(_)))
            .count();
        assert_eq!(constants, 1);
    }

    #[test]
    fn test_untraceable_host_read() {
        let f = |args: &CallArgs| -> Result<Value> {
            let x = args.tensor(0)?;
            let s = x.item()?;
            Ok(Value::Tensor(x.mul_scalar(f64::from(s))?))
        };
        let err = capture(&f, &CallArgs::from_tensors([t(vec![1.0], &[1])]), &ParamStore::new())
            .unwrap_err();
        assert!(err.is_untraceable());
    }

    #[test]
    fn test_untraceable_random() {
        let f = |args: &CallArgs| -> Result<Value> {
            let noise = creation::randn(args.tensor(0)?.shape());
            Ok(Value::Tensor(args.tensor(0)?.add(&noise)?))
        };
        let err = capture(&f, &CallArgs::from_tensors([t(vec![1.0], &[1])]), &ParamStore::new())
            .unwrap_err();
        assert!(err.is_untraceable());
    }

    #[test]
    fn test_callable_error_propagates_and_session_ends() {
        let f = |_: &CallArgs| -> Result<Value> {
            Err(diffjit_core::Error::invalid_operation("bad input"))
        };
        let err = capture(&f, &CallArgs::new(), &ParamStore::new()).unwrap_err();
        assert!(matches!(err, JitError::Runtime(_)));
        assert!(!trace::is_tracing());
    }

    #[test]
    fn test_nested_capture_rejected() {
        let _session = trace::start().unwrap();
        let f = |_: &CallArgs| -> Result<Value> { Ok(Value::None) };
        assert!(matches!(
            capture(&f, &CallArgs::new(), &ParamStore::new()),
            Err(JitError::TraceActive)
        ));
    }

    #[test]
    fn test_structured_outputs_and_aliases() {
        let f = |args: &CallArgs| -> Result<Value> {
            let a = args.tensor(0)?;
            Ok(Value::Tuple(vec![
                Value::Tensor(a.neg()?),
                Value::Int(4),
                Value::Tensor(args.tensor(1)?.clone()),
            ]))
        };
        let x = t(vec![1.0], &[1]);
        let graph = capture(&f, &CallArgs::from_tensors([x.clone(), x]), &ParamStore::new())
            .unwrap();
        assert_eq!(graph.inputs().len(), 2);
        // the second argument aliases the first
        assert_eq!(graph.outputs()[1], graph.inputs()[0]);
        assert_eq!(graph.template().slot_count(), 2);
    }
}
