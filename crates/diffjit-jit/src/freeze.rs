//! Freeze - Parameter Inlining and Constant Folding
//!
//! Specializes a rewritten graph for inference. Without parameter
//! preservation every parameter node is replaced by a private copy of its
//! current value, after which any operation whose operands are all constants
//! is evaluated once and replaced by its result.

use tracing::debug;

use diffjit_tensor::Tensor;

use crate::error::{JitError, JitResult};
use crate::ir::{Graph, NodeKind};
use crate::module::ParamStore;
use crate::passes::Rebuild;

/// Freezes a graph against a parameter store.
///
/// With `preserve_parameters` the parameter nodes stay and only constants
/// captured from free tensors are folded; the artifact then resolves
/// parameters by name on every run.
pub fn freeze(graph: &Graph, params: &ParamStore, preserve_parameters: bool) -> JitResult<Graph> {
    let mut rb = Rebuild::new(graph);
    let mut inlined = 0usize;
    let mut folded = 0usize;

    for node in graph.nodes() {
        match &node.kind {
            NodeKind::Param(name) if !preserve_parameters => {
                let value = params
                    .get(name)
                    .ok_or_else(|| JitError::MissingParameter(name.clone()))?;
                if value.shape() != node.meta.shape.as_slice() {
                    return Err(JitError::InvalidGraph(format!(
                        "parameter '{name}' changed shape from {:?} to {:?}",
                        node.meta.shape,
                        value.shape()
                    )));
                }
                rb.bind_constant(value.deep_clone());
                inlined += 1;
            }
            NodeKind::Op(op) => {
                let inputs = rb.inputs(node);
                let operands: Option<Vec<&Tensor>> =
                    inputs.iter().map(|i| rb.constant(*i)).collect();
                match operands {
                    Some(operands) => {
                        let value = op.execute(&operands)?;
                        rb.bind_constant(value);
                        folded += 1;
                    }
                    None => rb.keep(node),
                }
            }
            _ => rb.keep(node),
        }
    }

    let frozen = rb.finish();
    debug!(
        inlined,
        folded,
        nodes = frozen.len(),
        preserve_parameters,
        "froze graph"
    );
    Ok(frozen)
}
