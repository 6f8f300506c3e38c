//! Intermediate Representation
//!
//! Captured computations are stored as a flat list of nodes in topological
//! order. A node is a graph input, a named module parameter, an inlined
//! constant tensor, or an operation over earlier nodes.

use std::hash::{Hash, Hasher};

use rustc_hash::{FxHashSet, FxHasher};

use diffjit_core::{DType, MemoryFormat};
use diffjit_tensor::{OpKind, Tensor};

use crate::value::OutputTemplate;

/// Unique identifier for a node in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    /// Returns the raw index.
    pub fn index(self) -> usize {
        self.0
    }
}

/// What a node computes.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// The `n`-th tensor of the call arguments.
    Input(usize),
    /// A module parameter, resolved by name at run time.
    Param(String),
    /// A tensor owned by the graph.
    Constant(Tensor),
    /// An operation over the node's inputs.
    Op(OpKind),
}

impl NodeKind {
    /// Returns the operation if this is an op node.
    pub fn op(&self) -> Option<&OpKind> {
        match self {
            Self::Op(kind) => Some(kind),
            _ => None,
        }
    }
}

/// Output metadata of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorMeta {
    /// Logical shape.
    pub shape: Vec<usize>,
    /// Element type.
    pub dtype: DType,
    /// Physical memory format.
    pub format: MemoryFormat,
}

impl TensorMeta {
    /// Metadata of a concrete tensor.
    pub fn of(tensor: &Tensor) -> Self {
        Self {
            shape: tensor.shape().to_vec(),
            dtype: tensor.dtype(),
            format: tensor.memory_format(),
        }
    }
}

/// A node in the computation graph.
#[derive(Debug, Clone)]
pub struct Node {
    /// Unique identifier.
    pub id: NodeId,
    /// What this node computes.
    pub kind: NodeKind,
    /// Operand nodes, in operand order.
    pub inputs: Vec<NodeId>,
    /// Output metadata.
    pub meta: TensorMeta,
}

impl Node {
    /// Returns the operation if this is an op node.
    pub fn op(&self) -> Option<&OpKind> {
        self.kind.op()
    }
}

/// Computation graph.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    inputs: Vec<NodeId>,
    outputs: Vec<NodeId>,
    template: OutputTemplate,
}

impl Graph {
    /// Creates a new empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node to the graph.
    pub fn add_node(&mut self, kind: NodeKind, inputs: Vec<NodeId>, meta: TensorMeta) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            id,
            kind,
            inputs,
            meta,
        });
        id
    }

    /// Adds the next graph input.
    pub fn add_input(&mut self, meta: TensorMeta) -> NodeId {
        let id = self.add_node(NodeKind::Input(self.inputs.len()), Vec::new(), meta);
        self.inputs.push(id);
        id
    }

    /// Adds an operation node.
    pub fn add_op(&mut self, op: OpKind, inputs: Vec<NodeId>, meta: TensorMeta) -> NodeId {
        self.add_node(NodeKind::Op(op), inputs, meta)
    }

    /// Adds a constant node holding `tensor`.
    pub fn add_constant(&mut self, tensor: Tensor) -> NodeId {
        let meta = TensorMeta::of(&tensor);
        self.add_node(NodeKind::Constant(tensor), Vec::new(), meta)
    }

    /// Sets the graph outputs and the structure they are returned in.
    pub fn set_outputs(&mut self, outputs: Vec<NodeId>, template: OutputTemplate) {
        self.outputs = outputs;
        self.template = template;
    }

    /// Returns the node for an ID.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    /// Returns all nodes.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Returns the number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns whether the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Input nodes, one per call tensor.
    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    /// Output nodes, in output-slot order.
    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    /// Structure of the return value.
    pub fn template(&self) -> &OutputTemplate {
        &self.template
    }

    /// Returns true if the node is a graph output.
    pub fn is_output(&self, id: NodeId) -> bool {
        self.outputs.contains(&id)
    }

    /// Number of consumers of every node, counting each output use.
    pub fn use_counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.nodes.len()];
        for node in &self.nodes {
            for input in &node.inputs {
                counts[input.0] += 1;
            }
        }
        for out in &self.outputs {
            counts[out.0] += 1;
        }
        counts
    }

    /// Nodes consuming `id`.
    pub fn users(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.inputs.contains(&id))
            .map(|n| n.id)
            .collect()
    }

    /// Number of op nodes.
    pub fn op_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.op().is_some()).count()
    }

    /// Number of op nodes whose operation has the given name.
    pub fn count_ops(&self, name: &str) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.op().is_some_and(|op| op.name() == name))
            .count()
    }

    /// Number of parameter nodes.
    pub fn param_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Param(_)))
            .count()
    }

    /// Removes nodes that no output depends on. Inputs are always kept.
    #[must_use]
    pub fn prune(&self) -> Self {
        let mut live: FxHashSet<NodeId> = self.inputs.iter().copied().collect();
        let mut worklist: Vec<NodeId> = self.outputs.clone();
        while let Some(id) = worklist.pop() {
            if live.insert(id) {
                worklist.extend(self.node(id).inputs.iter().copied());
            }
        }

        let mut map = vec![None; self.nodes.len()];
        let mut pruned = Self::new();
        for node in &self.nodes {
            if !live.contains(&node.id) {
                continue;
            }
            let inputs = node.inputs.iter().filter_map(|i| map[i.0]).collect();
            let new_id = match node.kind {
                NodeKind::Input(_) => pruned.add_input(node.meta.clone()),
                _ => pruned.add_node(node.kind.clone(), inputs, node.meta.clone()),
            };
            map[node.id.0] = Some(new_id);
        }
        let outputs = self.outputs.iter().filter_map(|o| map[o.0]).collect();
        pruned.set_outputs(outputs, self.template.clone());
        pruned
    }

    /// Validates the graph structure.
    pub fn validate(&self) -> Result<(), String> {
        for node in &self.nodes {
            for input in &node.inputs {
                if input.0 >= node.id.0 {
                    return Err(format!(
                        "node {} ({}) references later node {}",
                        node.id.0,
                        describe(&node.kind),
                        input.0
                    ));
                }
            }
            match &node.kind {
                NodeKind::Op(op) => {
                    if op.arity() != node.inputs.len() {
                        return Err(format!(
                            "node {} ({}) has {} operands, expected {}",
                            node.id.0,
                            op.name(),
                            node.inputs.len(),
                            op.arity()
                        ));
                    }
                }
                other => {
                    if !node.inputs.is_empty() {
                        return Err(format!(
                            "leaf node {} ({}) has operands",
                            node.id.0,
                            describe(other)
                        ));
                    }
                }
            }
        }

        for (position, id) in self.inputs.iter().enumerate() {
            match self.nodes.get(id.0).map(|n| &n.kind) {
                Some(NodeKind::Input(index)) if *index == position => {}
                _ => return Err(format!("graph input {position} is not an input node")),
            }
        }
        let input_nodes = self
            .nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Input(_)))
            .count();
        if input_nodes != self.inputs.len() {
            return Err("unregistered input node".to_string());
        }

        for out in &self.outputs {
            if out.0 >= self.nodes.len() {
                return Err(format!("output references missing node {}", out.0));
            }
        }
        if self.template.slot_count() > self.outputs.len() {
            return Err(format!(
                "return structure needs {} outputs, graph has {}",
                self.template.slot_count(),
                self.outputs.len()
            ));
        }
        Ok(())
    }

    /// Structural hash of the graph.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = FxHasher::default();
        for node in &self.nodes {
            std::mem::discriminant(&node.kind).hash(&mut hasher);
            match &node.kind {
                NodeKind::Input(i) => i.hash(&mut hasher),
                NodeKind::Param(name) => name.hash(&mut hasher),
                NodeKind::Constant(t) => t.id().hash(&mut hasher),
                // OpKind carries floats, so hash its rendered form
                NodeKind::Op(op) => format!("{op:?}").hash(&mut hasher),
            }
            node.inputs.hash(&mut hasher);
            node.meta.hash(&mut hasher);
        }
        self.inputs.hash(&mut hasher);
        self.outputs.hash(&mut hasher);
        hasher.finish()
    }
}

fn describe(kind: &NodeKind) -> &'static str {
    match kind {
        NodeKind::Input(_) => "input",
        NodeKind::Param(_) => "param",
        NodeKind::Constant(_) => "constant",
        NodeKind::Op(op) => op.name(),
    }
}
