//! Kernel selection passes driven by the accelerator backend.

use diffjit_tensor::{Activation, AttentionKernel, OpKind};

use super::{rebuild_ops, RewritePass};
use crate::error::JitResult;
use crate::ir::Graph;

/// Fuses `silu(group_norm(x))` into one normalization kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct FuseGroupNormSilu;

impl RewritePass for FuseGroupNormSilu {
    fn name(&self) -> &'static str {
        "fuse_group_norm_silu"
    }

    fn run(&self, graph: &Graph) -> JitResult<Graph> {
        Ok(rebuild_ops(graph, |rb, node, op| {
            let fused = match op {
                OpKind::Activation(Activation::Silu) => {
                    let input = node.inputs[0];
                    let producer = rb.producer(input);
                    match producer.op() {
                        Some(OpKind::GroupNorm {
                            groups,
                            eps,
                            affine,
                        }) if rb.fusible(input) => Some((
                            OpKind::FusedGroupNormSilu {
                                groups: *groups,
                                eps: *eps,
                                affine: *affine,
                            },
                            producer.inputs.clone(),
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

/// Routes attention through the chunked memory-efficient kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectAttentionKernel;

impl RewritePass for SelectAttentionKernel {
    fn name(&self) -> &'static str {
        "select_attention_kernel"
    }

    fn run(&self, graph: &Graph) -> JitResult<Graph> {
        Ok(rebuild_ops(graph, |rb, node, op| match op {
            OpKind::Attention {
                scale,
                kernel: AttentionKernel::Math,
            } => {
                let op = OpKind::Attention {
                    scale: *scale,
                    kernel: AttentionKernel::MemoryEfficient,
                };
                rb.replace(node, op, rb.inputs(node));
            }
            _ => rb.keep(node),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::meta;
    use super::*;
    use crate::value::OutputTemplate;

    #[test]
    fn test_group_norm_silu() {
        let mut g = Graph::new();
        let x = g.add_input(meta(&[1, 4, 2, 2]));
        let n = g.add_op(
            OpKind::GroupNorm {
                groups: 2,
                eps: 1e-5,
                affine: false,
            },
            vec![x],
            meta(&[1, 4, 2, 2]),
        );
        let y = g.add_op(OpKind::Activation(Activation::Silu), vec![n], meta(&[1, 4, 2, 2]));
        g.set_outputs(vec![y], OutputTemplate::Tensor(0));

        let out = FuseGroupNormSilu.run(&g).unwrap();
        assert_eq!(out.op_count(), 1);
        assert_eq!(out.count_ops("fused_group_norm_silu"), 1);
    }

    #[test]
    fn test_attention_kernel() {
        let mut g = Graph::new();
        let q = g.add_input(meta(&[1, 4, 8]));
        let a = g.add_op(
            OpKind::Attention {
                scale: 0.5,
                kernel: AttentionKernel::Math,
            },
            vec![q, q, q],
            meta(&[1, 4, 8]),
        );
        g.set_outputs(vec![a], OutputTemplate::Tensor(0));
        let out = SelectAttentionKernel.run(&g).unwrap();
        assert_eq!(
            out.node(out.outputs()[0]).op(),
            Some(&OpKind::Attention {
                scale: 0.5,
                kernel: AttentionKernel::MemoryEfficient,
            })
        );
    }
}
