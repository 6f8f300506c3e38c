//! Graph Rewrite Passes
//!
//! Each pass maps a [`Graph`] to a new graph with the same inputs and the same
//! output contract. Passes never mutate their input; they rebuild the graph
//! node by node through a rebuild helper that remaps edges and drops whatever
//! became unreachable.
//!
//! A pass that meets a pattern it does not fully recognise (wrong rank, an
//! intermediate with several consumers, a graph output inside the pattern)
//! leaves it untouched. Running any pass twice yields the same graph as
//! running it once.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

mod cleanup;
mod conv;
mod kernels;
mod linear;

pub use cleanup::{CanonicalizeViews, EliminateDeadOps};
pub use conv::{ConvertConvLayout, FuseConv};
pub use kernels::{FuseGroupNormSilu, SelectAttentionKernel};
pub use linear::{FuseLinear, FuseLowpLinearAdd, PreferLowpGemm};

use std::sync::Arc;

use tracing::debug;

use diffjit_core::MemoryFormat;
use diffjit_tensor::{OpKind, Tensor};

use crate::error::{JitError, JitResult};
use crate::ir::{Graph, Node, NodeId, NodeKind, TensorMeta};

// =============================================================================
// Pass Trait
// =============================================================================

/// A graph-to-graph transformation.
pub trait RewritePass: Send + Sync {
    /// Stable name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Rewrites the graph.
    fn run(&self, graph: &Graph) -> JitResult<Graph>;
}

/// Statistics of one pass execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassStats {
    /// Pass name.
    pub name: &'static str,
    /// Whether the graph changed.
    pub changed: bool,
    /// Node count before the pass.
    pub nodes_before: usize,
    /// Node count after the pass.
    pub nodes_after: usize,
}

// =============================================================================
// Rebuild Helper
// =============================================================================

/// Rebuilds a graph in topological order, mapping old node IDs to new ones.
///
/// Every old node must be bound exactly once, in order, through
/// [`Rebuild::keep`], [`Rebuild::replace`] or [`Rebuild::forward`].
pub(crate) struct Rebuild<'a> {
    old: &'a Graph,
    uses: Vec<usize>,
    graph: Graph,
    map: Vec<NodeId>,
}

impl<'a> Rebuild<'a> {
    pub(crate) fn new(old: &'a Graph) -> Self {
        Self {
            old,
            uses: old.use_counts(),
            graph: Graph::new(),
            map: Vec::with_capacity(old.len()),
        }
    }

    /// New ID of an already bound old node.
    pub(crate) fn get(&self, old: NodeId) -> NodeId {
        self.map[old.0]
    }

    /// Remapped operands of an old node.
    pub(crate) fn inputs(&self, node: &Node) -> Vec<NodeId> {
        node.inputs.iter().map(|i| self.get(*i)).collect()
    }

    /// The new node an old operand was bound to.
    pub(crate) fn producer(&self, old: NodeId) -> &Node {
        self.graph.node(self.get(old))
    }

    /// Metadata of an old node in the source graph.
    pub(crate) fn old_meta(&self, old: NodeId) -> &TensorMeta {
        &self.old.node(old).meta
    }

    /// True if an old node has exactly one consumer and is not a graph output,
    /// so a pattern may absorb it.
    pub(crate) fn fusible(&self, old: NodeId) -> bool {
        self.uses[old.0] == 1 && !self.old.is_output(old)
    }

    /// Copies an old node with remapped operands.
    pub(crate) fn keep(&mut self, node: &Node) {
        let id = match node.kind {
            NodeKind::Input(_) => self.graph.add_input(node.meta.clone()),
            _ => {
                let inputs = self.inputs(node);
                self.graph
                    .add_node(node.kind.clone(), inputs, node.meta.clone())
            }
        };
        self.map.push(id);
    }

    /// Replaces an old op node by another op over new operands.
    pub(crate) fn replace(&mut self, node: &Node, op: OpKind, inputs: Vec<NodeId>) {
        let id = self.graph.add_op(op, inputs, node.meta.clone());
        self.map.push(id);
    }

    /// Binds an old node to an existing new node.
    pub(crate) fn forward(&mut self, to: NodeId) {
        self.map.push(to);
    }

    /// Binds an old node to a new constant node.
    pub(crate) fn bind_constant(&mut self, tensor: Tensor) {
        let id = self.graph.add_constant(tensor);
        self.map.push(id);
    }

    /// The tensor held by a new node, if it is a constant.
    pub(crate) fn constant(&self, new: NodeId) -> Option<&Tensor> {
        match &self.graph.node(new).kind {
            NodeKind::Constant(t) => Some(t),
            _ => None,
        }
    }

    /// Emits an extra node that no old node maps to.
    pub(crate) fn insert(&mut self, op: OpKind, inputs: Vec<NodeId>, meta: TensorMeta) -> NodeId {
        self.graph.add_op(op, inputs, meta)
    }

    /// Finishes the rebuild and drops unreachable nodes.
    pub(crate) fn finish(mut self) -> Graph {
        let outputs = self.old.outputs().iter().map(|o| self.map[o.0]).collect();
        self.graph.set_outputs(outputs, self.old.template().clone());
        self.graph.prune()
    }
}

/// Rebuilds `graph`, letting `rewrite` handle every op node. Non-op nodes are
/// copied as they are.
pub(crate) fn rebuild_ops(
    graph: &Graph,
    mut rewrite: impl FnMut(&mut Rebuild<'_>, &Node, &OpKind),
) -> Graph {
    let mut rb = Rebuild::new(graph);
    for node in graph.nodes() {
        match node.op() {
            Some(op) => rewrite(&mut rb, node, op),
            None => rb.keep(node),
        }
    }
    rb.finish()
}

// =============================================================================
// Options
// =============================================================================

/// Which optional passes run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteOptions {
    /// Fuse matmul/bias/activation chains into linear ops.
    pub fuse_linear: bool,
    /// Convert convolution inputs to this memory format.
    pub memory_format: Option<MemoryFormat>,
    /// Fuse convolutions with residual adds and activations.
    pub fuse_conv: bool,
    /// Use reduced-precision accumulation for GEMMs.
    pub prefer_lowp_gemm: bool,
    /// Fuse group norm with a following SiLU.
    pub fuse_group_norm_silu: bool,
    /// Select the memory-efficient attention kernel.
    pub memory_efficient_attention: bool,
}

impl Default for RewriteOptions {
    fn default() -> Self {
        Self {
            fuse_linear: true,
            memory_format: None,
            fuse_conv: true,
            prefer_lowp_gemm: false,
            fuse_group_norm_silu: false,
            memory_efficient_attention: false,
        }
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Ordered list of passes with validation after each one.
#[derive(Clone, Default)]
pub struct RewritePipeline {
    passes: Vec<Arc<dyn RewritePass>>,
}

impl std::fmt::Debug for RewritePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.passes.iter().map(|p| p.name()))
            .finish()
    }
}

impl RewritePipeline {
    /// Creates an empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the standard pass order for a set of options.
    pub fn from_options(options: &RewriteOptions) -> Self {
        let mut pipeline = Self::new()
            .with_pass(EliminateDeadOps)
            .with_pass(CanonicalizeViews);
        if options.fuse_group_norm_silu {
            pipeline.push(FuseGroupNormSilu);
        }
        if options.fuse_linear {
            pipeline.push(FuseLinear);
        }
        if let Some(format) = options.memory_format {
            pipeline.push(ConvertConvLayout::new(format));
        }
        if options.fuse_conv {
            pipeline.push(FuseConv);
        }
        if options.prefer_lowp_gemm {
            pipeline.push(PreferLowpGemm);
            pipeline.push(FuseLowpLinearAdd);
        }
        if options.memory_efficient_attention {
            pipeline.push(SelectAttentionKernel);
        }
        pipeline.with_pass(EliminateDeadOps)
    }

    /// Appends a pass.
    pub fn push(&mut self, pass: impl RewritePass + 'static) {
        self.passes.push(Arc::new(pass));
    }

    /// Appends a shared pass.
    pub fn push_shared(&mut self, pass: Arc<dyn RewritePass>) {
        self.passes.push(pass);
    }

    /// Builder: append a pass.
    #[must_use]
    pub fn with_pass(mut self, pass: impl RewritePass + 'static) -> Self {
        self.push(pass);
        self
    }

    /// Pass names in execution order.
    pub fn names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Runs every pass.
    pub fn run(&self, graph: Graph) -> JitResult<Graph> {
        self.run_with_stats(graph).map(|(graph, _)| graph)
    }

    /// Runs every pass and reports what each one did.
    pub fn run_with_stats(&self, mut graph: Graph) -> JitResult<(Graph, Vec<PassStats>)> {
        let mut stats = Vec::with_capacity(self.passes.len());
        for pass in &self.passes {
            let name = pass.name();
            let before = graph.fingerprint();
            let nodes_before = graph.len();

            let next = pass.run(&graph).map_err(|e| match e {
                JitError::RewritePass { .. } => e,
                other => JitError::rewrite(name, other.to_string()),
            })?;
            next.validate().map_err(|m| JitError::rewrite(name, m))?;
            check_contract(&graph, &next).map_err(|m| JitError::rewrite(name, m))?;

            let entry = PassStats {
                name,
                changed: next.fingerprint() != before,
                nodes_before,
                nodes_after: next.len(),
            };
            debug!(
                pass = name,
                changed = entry.changed,
                nodes_before,
                nodes_after = entry.nodes_after,
                "rewrite pass"
            );
            stats.push(entry);
            graph = next;
        }
        Ok((graph, stats))
    }
}

/// Checks that a pass kept the input and output contract.
fn check_contract(before: &Graph, after: &Graph) -> Result<(), String> {
    if before.inputs().len() != after.inputs().len() {
        return Err(format!(
            "input count changed from {} to {}",
            before.inputs().len(),
            after.inputs().len()
        ));
    }
    if before.outputs().len() != after.outputs().len() {
        return Err(format!(
            "output count changed from {} to {}",
            before.outputs().len(),
            after.outputs().len()
        ));
    }
    for (i, (a, b)) in before.outputs().iter().zip(after.outputs()).enumerate() {
        let (a, b) = (&before.node(*a).meta, &after.node(*b).meta);
        if a.shape != b.shape || a.dtype != b.dtype {
            return Err(format!(
                "output {i} changed from {}{:?} to {}{:?}",
                a.dtype, a.shape, b.dtype, b.shape
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_util {
    use diffjit_core::{DType, MemoryFormat};

    use crate::ir::TensorMeta;

    pub fn meta(shape: &[usize]) -> TensorMeta {
        TensorMeta {
            shape: shape.to_vec(),
            dtype: DType::F32,
            format: MemoryFormat::Contiguous,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::meta;
    use super::*;
    use crate::value::OutputTemplate;
    use diffjit_tensor::Activation;

    struct DropOutputs;

    impl RewritePass for DropOutputs {
        fn name(&self) -> &'static str {
            "drop_outputs"
        }

        fn run(&self, graph: &Graph) -> JitResult<Graph> {
            let mut g = graph.clone();
            g.set_outputs(Vec::new(), OutputTemplate::default());
            Ok(g)
        }
    }

    struct Failing;

    impl RewritePass for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn run(&self, _graph: &Graph) -> JitResult<Graph> {
            Err(JitError::InvalidGraph("dangling edge".into()))
        }
    }

    fn graph() -> Graph {
        let mut g = Graph::new();
        let x = g.add_input(meta(&[2, 2]));
        let d = g.add_op(OpKind::Dropout { p: 0.1 }, vec![x], meta(&[2, 2]));
        let y = g.add_op(OpKind::Activation(Activation::Relu), vec![d], meta(&[2, 2]));
        g.set_outputs(vec![y], OutputTemplate::Tensor(0));
        g
    }

    #[test]
    fn test_default_order() {
        let names = RewritePipeline::from_options(&RewriteOptions::default()).names();
        assert_eq!(
            names,
            vec![
                "eliminate_dead_ops",
                "canonicalize_views",
                "fuse_linear",
                "fuse_conv",
                "eliminate_dead_ops"
            ]
        );
    }

    #[test]
    fn test_full_order() {
        let options = RewriteOptions {
            fuse_linear: true,
            memory_format: Some(MemoryFormat::ChannelsLast),
            fuse_conv: true,
            prefer_lowp_gemm: true,
            fuse_group_norm_silu: true,
            memory_efficient_attention: true,
        };
        let names = RewritePipeline::from_options(&options).names();
        assert_eq!(
            names,
            vec![
                "eliminate_dead_ops",
                "canonicalize_views",
                "fuse_group_norm_silu",
                "fuse_linear",
                "convert_conv_layout",
                "fuse_conv",
                "prefer_lowp_gemm",
                "fuse_lowp_linear_add",
                "select_attention_kernel",
                "eliminate_dead_ops"
            ]
        );
    }

    #[test]
    fn test_stats() {
        let pipeline = RewritePipeline::new().with_pass(EliminateDeadOps);
        let (g, stats) = pipeline.run_with_stats(graph()).unwrap();
        assert_eq!(g.len(), 2);
        assert_eq!(stats.len(), 1);
        assert!(stats[0].changed);
        assert_eq!(stats[0].nodes_before, 3);
        assert_eq!(stats[0].nodes_after, 2);
    }

    #[test]
    fn test_contract_violation_reported() {
        let err = RewritePipeline::new()
            .with_pass(DropOutputs)
            .run(graph())
            .unwrap_err();
        match err {
            JitError::RewritePass { pass, .. } => assert_eq!(pass, "drop_outputs"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_pass_error_reported() {
        let err = RewritePipeline::new().with_pass(Failing).run(graph()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "rewrite pass 'failing' failed: invalid graph: dangling edge"
        );
    }
}
