//! Dead-op elimination and view canonicalization.

use diffjit_tensor::OpKind;

use super::{rebuild_ops, RewritePass};
use crate::error::JitResult;
use crate::ir::{Graph, Node};

// =============================================================================
// Dead Ops
// =============================================================================

/// Removes operations that return their input unchanged.
///
/// Covers inference dropout, `contiguous` on already contiguous data,
/// reshapes/views/casts/format conversions whose output metadata equals their
/// input's, identity permutes, `x * 1` and `x + 0`. Unreachable nodes are
/// dropped by the rebuild.
#[derive(Debug, Clone, Copy, Default)]
pub struct EliminateDeadOps;

impl RewritePass for EliminateDeadOps {
    fn name(&self) -> &'static str {
        "eliminate_dead_ops"
    }

    fn run(&self, graph: &Graph) -> JitResult<Graph> {
        Ok(rebuild_ops(graph, |rb, node, op| {
            if is_identity(graph, node, op) {
                let to = rb.get(node.inputs[0]);
                rb.forward(to);
            } else {
                rb.keep(node);
            }
        }))
    }
}

fn is_identity(graph: &Graph, node: &Node, op: &OpKind) -> bool {
    let Some(input) = node.inputs.first() else {
        return false;
    };
    let same_meta = graph.node(*input).meta == node.meta;
    match op {
        OpKind::Dropout { .. } => true,
        OpKind::Contiguous
        | OpKind::Reshape { .. }
        | OpKind::View { .. }
        | OpKind::Cast { .. }
        | OpKind::ToMemoryFormat { .. } => same_meta,
        OpKind::Permute { dims } => dims.iter().enumerate().all(|(i, d)| i == *d),
        OpKind::MulScalar { value } => *value == 1.0,
        OpKind::AddScalar { value } => *value == 0.0,
        _ => false,
    }
}

// =============================================================================
// Views
// =============================================================================

/// Rewrites strict views as reshapes with concrete shapes and collapses
/// chains of single-use reshapes.
#[derive(Debug, Clone, Copy, Default)]
pub struct CanonicalizeViews;

impl RewritePass for CanonicalizeViews {
    fn name(&self) -> &'static str {
        "canonicalize_views"
    }

    fn run(&self, graph: &Graph) -> JitResult<Graph> {
        Ok(rebuild_ops(graph, |rb, node, op| {
            if !matches!(op, OpKind::View { .. } | OpKind::Reshape { .. }) {
                rb.keep(node);
                return;
            }
            let target = OpKind::Reshape {
                shape: node.meta.shape.iter().map(|&d| d as isize).collect(),
            };
            let input = node.inputs[0];
            let producer = rb.producer(input);
            let source = match producer.op() {
                Some(OpKind::Reshape { .. }) if rb.fusible(input) => producer.inputs[0],
                _ => rb.get(input),
            };
            if *op == target && source == rb.get(input) {
                rb.keep(node);
            } else {
                rb.replace(node, target, vec![source]);
            }
        }))
    }
}
