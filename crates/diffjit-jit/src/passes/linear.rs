//! Linear-layer fusion and reduced-precision GEMM selection.

use diffjit_tensor::shape::normalize_dim;
use diffjit_tensor::OpKind;

use super::{rebuild_ops, Rebuild, RewritePass};
use crate::error::JitResult;
use crate::ir::{Graph, Node, NodeId};

/// Fuses `matmul(x, transpose(w))`, a following bias add and a following
/// activation into a single linear op.
#[derive(Debug, Clone, Copy, Default)]
pub struct FuseLinear;

impl RewritePass for FuseLinear {
    fn name(&self) -> &'static str {
        "fuse_linear"
    }

    fn run(&self, graph: &Graph) -> JitResult<Graph> {
        Ok(rebuild_ops(graph, |rb, node, op| {
            let fused = match op {
                OpKind::MatMul => matmul_as_linear(rb, node),
                OpKind::Add => linear_bias(rb, node),
                OpKind::Activation(act) => {
                    let input = node.inputs[0];
                    match rb.producer(input).op() {
                        Some(OpKind::Linear { bias }) if rb.fusible(input) => Some((
                            OpKind::FusedLinear {
                                bias: *bias,
                                activation: Some(*act),
                                lowp: false,
                                residual: false,
                            },
                            rb.producer(input).inputs.clone(),
                        )),
                        _ => None,
                    }
                }
                _ => None,
            };
            match fused {
                Some((op, inputs)) => rb.replace(node, op, inputs),
                None => rb.keep(node),
            }
        }))
    }
}

fn matmul_as_linear(rb: &Rebuild<'_>, node: &Node) -> Option<(OpKind, Vec<NodeId>)> {
    let (x, wt) = (node.inputs[0], node.inputs[1]);
    if !rb.fusible(wt) || rb.old_meta(x).shape.len() < 2 {
        return None;
    }
    let transpose = rb.producer(wt);
    let Some(OpKind::Transpose { dim0, dim1 }) = transpose.op() else {
        return None;
    };
    let w = rb.old_meta(wt);
    if w.shape.len() != 2 || w.dtype != rb.old_meta(x).dtype {
        return None;
    }
    let swapped = matches!(
        (normalize_dim(*dim0, 2), normalize_dim(*dim1, 2)),
        (Ok(0), Ok(1)) | (Ok(1), Ok(0))
    );
    swapped.then(|| {
        (
            OpKind::Linear { bias: false },
            vec![rb.get(x), transpose.inputs[0]],
        )
    })
}

fn linear_bias(rb: &Rebuild<'_>, node: &Node) -> Option<(OpKind, Vec<NodeId>)> {
    for (lin, bias) in [(0, 1), (1, 0)] {
        let (lin, bias) = (node.inputs[lin], node.inputs[bias]);
        let producer = rb.producer(lin);
        if !matches!(producer.op(), Some(OpKind::Linear { bias: false })) || !rb.fusible(lin) {
            continue;
        }
        let (out, b) = (rb.old_meta(lin), rb.old_meta(bias));
        let features = out.shape.last().copied();
        if b.shape.len() == 1
            && Some(b.shape[0]) == features
            && b.dtype == out.dtype
            && node.meta.shape == out.shape
        {
            let mut inputs = producer.inputs.clone();
            inputs.push(rb.get(bias));
            return Some((OpKind::Linear { bias: true }, inputs));
        }
    }
    None
}

/// Switches GEMMs to reduced-precision accumulation.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreferLowpGemm;

impl RewritePass for PreferLowpGemm {
    fn name(&self) -> &'static str {
        "prefer_lowp_gemm"
    }

    fn run(&self, graph: &Graph) -> JitResult<Graph> {
        Ok(rebuild_ops(graph, |rb, node, op| {
            let lowp = match op {
                OpKind::MatMul => Some(OpKind::LowpMatMul),
                OpKind::Linear { bias } => Some(OpKind::FusedLinear {
                    bias: *bias,
                    activation: None,
                    lowp: true,
                    residual: false,
                }),
                OpKind::FusedLinear {
                    bias,
                    activation,
                    lowp: false,
                    residual,
                } => Some(OpKind::FusedLinear {
                    bias: *bias,
                    activation: *activation,
                    lowp: true,
                    residual: *residual,
                }),
                _ => None,
            };
            match lowp {
                Some(op) => rb.replace(node, op, rb.inputs(node)),
                None => rb.keep(node),
            }
        }))
    }
}

/// Folds a residual add into a preceding reduced-precision linear op.
#[derive(Debug, Clone, Copy, Default)]
pub struct FuseLowpLinearAdd;

impl RewritePass for FuseLowpLinearAdd {
    fn name(&self) -> &'static str {
        "fuse_lowp_linear_add"
    }

    fn run(&self, graph: &Graph) -> JitResult<Graph> {
        Ok(rebuild_ops(graph, |rb, node, op| {
            let fused = if *op == OpKind::Add {
                lowp_residual(rb, node)
            } else {
                None
            };
            match fused {
                Some((op, inputs)) => rb.replace(node, op, inputs),
                None => rb.keep(node),
            }
        }))
    }
}

fn lowp_residual(rb: &Rebuild<'_>, node: &Node) -> Option<(OpKind, Vec<NodeId>)> {
    for (lin, res) in [(0, 1), (1, 0)] {
        let (lin, res) = (node.inputs[lin], node.inputs[res]);
        let producer = rb.producer(lin);
        let Some(OpKind::FusedLinear {
            bias,
            activation,
            lowp: true,
            residual: false,
        }) = producer.op()
        else {
            continue;
        };
        let (out, r) = (rb.old_meta(lin), rb.old_meta(res));
        if rb.fusible(lin) && r.shape == out.shape && r.dtype == out.dtype && lin != res {
            let mut inputs = producer.inputs.clone();
            inputs.push(rb.get(res));
            return Some((
                OpKind::FusedLinear {
                    bias: *bias,
                    activation: *activation,
                    lowp: true,
                    residual: true,
                },
                inputs,
            ));
        }
    }
    None
}
