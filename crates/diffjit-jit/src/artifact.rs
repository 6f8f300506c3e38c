//! Compiled Artifacts
//!
//! A compiled artifact is a finished graph plus an execution plan: every
//! intermediate value is released right after its last consumer runs.

use std::sync::Arc;

use diffjit_tensor::{dispatch, Tensor};

use crate::error::{JitError, JitResult};
use crate::ir::{Graph, NodeKind};
use crate::module::ParamStore;
use crate::value::{CallArgs, Value};

const KEEP: usize = usize::MAX;

/// An executable, specialized graph.
#[derive(Debug)]
pub struct CompiledArtifact {
    graph: Graph,
    params: Option<Arc<ParamStore>>,
    last_use: Vec<usize>,
}

impl CompiledArtifact {
    /// Builds the execution plan for a graph.
    ///
    /// The parameter store is only retained when the graph still refers to
    /// parameters by name.
    pub fn new(graph: Graph, params: &Arc<ParamStore>) -> Self {
        let mut last_use = vec![KEEP; graph.len()];
        for node in graph.nodes() {
            for input in &node.inputs {
                last_use[input.index()] = node.id.index();
            }
        }
        for out in graph.outputs() {
            last_use[out.index()] = KEEP;
        }
        let params = (graph.param_count() > 0).then(|| Arc::clone(params));
        Self {
            graph,
            params,
            last_use,
        }
    }

    /// The executed graph.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// True if the artifact reads parameters from the live store.
    pub fn retains_parameters(&self) -> bool {
        self.params.is_some()
    }

    /// The live store, when the graph still refers to parameters.
    pub(crate) fn param_store(&self) -> Option<&Arc<ParamStore>> {
        self.params.as_ref()
    }

    /// Current value of a parameter the graph refers to.
    pub(crate) fn param(&self, name: &str) -> JitResult<Tensor> {
        self.params
            .as_ref()
            .and_then(|p| p.get(name))
            .ok_or_else(|| JitError::MissingParameter(name.to_string()))
    }

    /// Runs the artifact on structured arguments.
    pub fn run(&self, args: &CallArgs) -> JitResult<Value> {
        let inputs: Vec<Tensor> = args.tensors().into_iter().cloned().collect();
        let outputs = self.run_tensors(&inputs)?;
        Ok(self.graph.template().fill(&outputs)?)
    }

    /// Runs the artifact on the flattened call tensors.
    pub fn run_tensors(&self, inputs: &[Tensor]) -> JitResult<Vec<Tensor>> {
        self.check_inputs(inputs)?;

        let mut values: Vec<Option<Tensor>> = vec![None; self.graph.len()];
        for node in self.graph.nodes() {
            let value = match &node.kind {
                NodeKind::Input(i) => inputs[*i].clone(),
                NodeKind::Param(name) => self.param(name)?,
                NodeKind::Constant(t) => t.clone(),
                NodeKind::Op(op) => {
                    let operands = node
                        .inputs
                        .iter()
                        .map(|i| {
                            values[i.index()].as_ref().ok_or_else(|| {
                                JitError::InvalidGraph(format!(
                                    "value of node {} released before node {}",
                                    i.index(),
                                    node.id.index()
                                ))
                            })
                        })
                        .collect::<JitResult<Vec<&Tensor>>>()?;
                    dispatch(op.clone(), &operands)?
                }
            };
            values[node.id.index()] = Some(value);
            for input in &node.inputs {
                if self.last_use[input.index()] == node.id.index() {
                    values[input.index()] = None;
                }
            }
        }

        self.graph
            .outputs()
            .iter()
            .map(|out| {
                let value = values[out.index()]
                    .clone()
                    .ok_or_else(|| JitError::InvalidGraph(format!("output node {} empty", out.index())))?;
                // callers must never write into graph-owned constants
                Ok(match self.graph.node(*out).kind {
                    NodeKind::Constant(_) => value.deep_clone(),
                    _ => value,
                })
            })
            .collect()
    }

    fn check_inputs(&self, inputs: &[Tensor]) -> JitResult<()> {
        if inputs.len() != self.graph.inputs().len() {
            return Err(JitError::SignatureMismatch(format!(
                "expected {} tensors, got {}",
                self.graph.inputs().len(),
                inputs.len()
            )));
        }
        for (i, (tensor, id)) in inputs.iter().zip(self.graph.inputs()).enumerate() {
            let meta = &self.graph.node(*id).meta;
            if tensor.shape() != meta.shape.as_slice() || tensor.dtype() != meta.dtype {
                return Err(JitError::SignatureMismatch(format!(
                    "tensor {i} is {}{:?}, compiled for {}{:?}",
                    tensor.dtype(),
                    tensor.shape(),
                    meta.dtype,
                    meta.shape
                )));
            }
        }
        Ok(())
    }
}
