//! Convolution layout conversion and CNN fusion.

use diffjit_core::MemoryFormat;
use diffjit_tensor::OpKind;

use super::{rebuild_ops, Rebuild, RewritePass};
use crate::error::JitResult;
use crate::ir::{Graph, Node, NodeId, TensorMeta};

/// Converts the data input of every convolution to a memory format.
///
/// Weights are converted with the module before capture; this pass only
/// handles the activations flowing into a convolution.
#[derive(Debug, Clone, Copy)]
pub struct ConvertConvLayout {
    format: MemoryFormat,
}

impl ConvertConvLayout {
    /// Creates the pass for a target format.
    pub const fn new(format: MemoryFormat) -> Self {
        Self { format }
    }
}

impl RewritePass for ConvertConvLayout {
    fn name(&self) -> &'static str {
        "convert_conv_layout"
    }

    fn run(&self, graph: &Graph) -> JitResult<Graph> {
        Ok(rebuild_ops(graph, |rb, node, op| {
            let is_conv = matches!(op, OpKind::Conv2d { .. } | OpKind::FusedConv2d { .. });
            let x = rb.producer(node.inputs[0]);
            if !is_conv || x.meta.shape.len() != 4 || x.meta.format == self.format {
                rb.keep(node);
                return;
            }
            let meta = TensorMeta {
                format: self.format,
                ..x.meta.clone()
            };
            let source = x.id;
            let converted = rb.insert(OpKind::ToMemoryFormat { format: self.format }, vec![source], meta);
            let mut inputs = rb.inputs(node);
            inputs[0] = converted;
            rb.replace(node, op.clone(), inputs);
        }))
    }
}

/// Fuses convolutions with a following residual add and activation.
///
/// A residual is only absorbed before the activation, matching
/// `act(conv(x) + b + residual)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FuseConv;

impl RewritePass for FuseConv {
    fn name(&self) -> &'static str {
        "fuse_conv"
    }

    fn run(&self, graph: &Graph) -> JitResult<Graph> {
        Ok(rebuild_ops(graph, |rb, node, op| {
            let fused = match op {
                OpKind::Add => conv_residual(rb, node),
                OpKind::Activation(act) => {
                    let input = node.inputs[0];
                    let producer = rb.producer(input);
                    match conv_params(producer.op()) {
                        Some((stride, padding, bias, None, residual)) if rb.fusible(input) => {
                            Some((
                                OpKind::FusedConv2d {
                                    stride,
                                    padding,
                                    bias,
                                    activation: Some(*act),
                                    residual,
                                },
                                producer.inputs.clone(),
                            ))
                        }
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

type ConvParams = (usize, usize, bool, Option<diffjit_tensor::Activation>, bool);

fn conv_params(op: Option<&OpKind>) -> Option<ConvParams> {
    match op? {
        OpKind::Conv2d {
            stride,
            padding,
            bias,
        } => Some((*stride, *padding, *bias, None, false)),
        OpKind::FusedConv2d {
            stride,
            padding,
            bias,
            activation,
            residual,
        } => Some((*stride, *padding, *bias, *activation, *residual)),
        _ => None,
    }
}

fn conv_residual(rb: &Rebuild<'_>, node: &Node) -> Option<(OpKind, Vec<NodeId>)> {
    for (conv, res) in [(0, 1), (1, 0)] {
        let (conv, res) = (node.inputs[conv], node.inputs[res]);
        let producer = rb.producer(conv);
        let Some((stride, padding, bias, None, false)) = conv_params(producer.op()) else {
            continue;
        };
        let (out, r) = (rb.old_meta(conv), rb.old_meta(res));
        if rb.fusible(conv)
            && conv != res
            && r.shape == out.shape
            && r.dtype == out.dtype
            && node.meta.shape == out.shape
        {
            let mut inputs = producer.inputs.clone();
            inputs.push(rb.get(res));
            return Some((
                OpKind::FusedConv2d {
                    stride,
                    padding,
                    bias,
                    activation: None,
                    residual: true,
                },
                inputs,
            ));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::super::test_util::meta;
    use super::*;
    use crate::ir::NodeKind;
    use crate::value::OutputTemplate;
    use diffjit_tensor::Activation;

    fn block(act_first: bool) -> Graph {
        let mut g = Graph::new();
        let x = g.add_input(meta(&[1, 2, 4, 4]));
        let w = g.add_node(NodeKind::Param("w".into()), vec![], meta(&[2, 2, 3, 3]));
        let b = g.add_node(NodeKind::Param("b".into()), vec![], meta(&[2]));
        let c = g.add_op(
            OpKind::Conv2d {
                stride: 1,
                padding: 1,
                bias: true,
            },
            vec![x, w, b],
            meta(&[1, 2, 4, 4]),
        );
        let silu = OpKind::Activation(Activation::Silu);
        let y = if act_first {
            let a = g.add_op(silu, vec![c], meta(&[1, 2, 4, 4]));
            g.add_op(OpKind::Add, vec![a, x], meta(&[1, 2, 4, 4]))
        } else {
            let s = g.add_op(OpKind::Add, vec![c, x], meta(&[1, 2, 4, 4]));
            g.add_op(silu, vec![s], meta(&[1, 2, 4, 4]))
        };
        g.set_outputs(vec![y], OutputTemplate::Tensor(0));
        g
    }

    #[test]
    fn test_fuse_residual_then_activation() {
        let out = FuseConv.run(&block(false)).unwrap();
        assert_eq!(out.op_count(), 1);
        let node = out.node(out.outputs()[0]);
        assert_eq!(
            node.op(),
            Some(&OpKind::FusedConv2d {
                stride: 1,
                padding: 1,
                bias: true,
                activation: Some(Activation::Silu),
                residual: true,
            })
        );
        assert_eq!(node.inputs.len(), 4);
        assert_eq!(FuseConv.run(&out).unwrap().fingerprint(), out.fingerprint());
    }

    #[test]
    fn test_residual_after_activation_stays() {
        let out = FuseConv.run(&block(true)).unwrap();
        assert_eq!(out.count_ops("fused_conv2d"), 1);
        assert_eq!(out.count_ops("add"), 1);
    }

    #[test]
    fn test_layout_conversion_idempotent() {
        let pass = ConvertConvLayout::new(MemoryFormat::ChannelsLast);
        let out = pass.run(&block(false)).unwrap();
        assert_eq!(out.count_ops("to_memory_format"), 1);
        let conv = out
            .nodes()
            .iter()
            .find(|n| n.op().is_some_and(|op| op.name() == "conv2d"))
            .unwrap();
        let converted = out.node(conv.inputs[0]);
        assert_eq!(converted.meta.format, MemoryFormat::ChannelsLast);
        assert_eq!(pass.run(&out).unwrap().fingerprint(), out.fingerprint());
    }
}
