//! Replay Capture
//!
//! Records one execution of a compiled artifact into a flat instruction tape
//! over preallocated buffers. Later calls with the same signature copy their
//! inputs into the static input buffers, run the tape and copy the results
//! out of the static output buffers. Constants are bound into the tape when it
//! is recorded. Parameters get static buffers of their own that are refreshed
//! from the store before every replay, so swapped weights are picked up.

use std::sync::Arc;

use diffjit_core::Device;
use diffjit_tensor::{dispatch, OpKind, Tensor};

use crate::artifact::CompiledArtifact;
use crate::error::{JitError, JitResult};
use crate::ir::NodeKind;
use crate::module::ParamStore;
use crate::value::{CallArgs, OutputTemplate, Value};

#[derive(Debug, Clone)]
enum Operand {
    Slot(usize),
    Param(usize),
    Bound(Tensor),
}

#[derive(Debug, Clone)]
struct Instruction {
    kind: OpKind,
    operands: Vec<Operand>,
    out: usize,
}

/// A recorded execution with static input and output buffers.
#[derive(Debug)]
pub struct ReplayBuffer {
    device: Device,
    static_inputs: Vec<Tensor>,
    params: Option<Arc<ParamStore>>,
    static_params: Vec<(String, Tensor)>,
    tape: Vec<Instruction>,
    slots: usize,
    outputs: Vec<Operand>,
    static_outputs: Vec<Tensor>,
    template: OutputTemplate,
}

impl ReplayBuffer {
    /// Records `artifact` for the signature of `args`.
    ///
    /// Returns the buffer and the result of the recorded execution. Fails
    /// with [`JitError::UnsupportedDevice`] when the call runs on a device
    /// without stream replay, and with [`JitError::ReplayUnavailable`] when
    /// this particular call cannot be recorded (no tensors, mixed devices).
    pub fn record(artifact: &CompiledArtifact, args: &CallArgs) -> JitResult<(Self, Value)> {
        let inputs = args.tensors();
        let Some(device) = inputs.first().map(|t| t.device()) else {
            return Err(JitError::ReplayUnavailable("call has no tensor inputs".into()));
        };
        if let Some(t) = inputs.iter().find(|t| t.device() != device) {
            return Err(JitError::ReplayUnavailable(format!(
                "inputs span {device} and {}",
                t.device()
            )));
        }
        if !device.supports_stream_replay() {
            return Err(JitError::UnsupportedDevice { device });
        }

        let graph = artifact.graph();
        let mut slot_of = vec![None; graph.len()];
        let mut bound = vec![None; graph.len()];
        let mut param_of = vec![None; graph.len()];
        let mut tape = Vec::new();
        let mut slots = graph.inputs().len();
        let mut static_params: Vec<(String, Tensor)> = Vec::new();

        for node in graph.nodes() {
            let idx = node.id.index();
            match &node.kind {
                NodeKind::Input(i) => slot_of[idx] = Some(*i),
                NodeKind::Param(name) => {
                    let index = match static_params.iter().position(|(n, _)| n == name) {
                        Some(index) => index,
                        None => {
                            static_params.push((name.clone(), artifact.param(name)?.deep_clone()));
                            static_params.len() - 1
                        }
                    };
                    param_of[idx] = Some(index);
                }
                NodeKind::Constant(t) => bound[idx] = Some(t.clone()),
                NodeKind::Op(op) => {
                    let operands = node
                        .inputs
                        .iter()
                        .map(|i| operand(&slot_of, &param_of, &bound, i.index()))
                        .collect::<JitResult<Vec<_>>>()?;
                    tape.push(Instruction {
                        kind: op.clone(),
                        operands,
                        out: slots,
                    });
                    slot_of[idx] = Some(slots);
                    slots += 1;
                }
            }
        }
        let outputs = graph
            .outputs()
            .iter()
            .map(|o| operand(&slot_of, &param_of, &bound, o.index()))
            .collect::<JitResult<Vec<_>>>()?;

        let static_inputs: Vec<Tensor> = inputs.iter().map(|t| t.deep_clone()).collect();
        let mut buffer = Self {
            device,
            static_inputs,
            params: artifact.param_store().cloned(),
            static_params,
            tape,
            slots,
            outputs,
            static_outputs: Vec::new(),
            template: graph.template().clone(),
        };
        let results = buffer.execute()?;
        buffer.static_outputs = results.iter().map(Tensor::deep_clone).collect();
        let value = buffer.template.fill(&results)?;
        Ok((buffer, value))
    }

    /// Replays the tape on new inputs of the recorded signature.
    pub fn replay(&self, args: &CallArgs) -> JitResult<Value> {
        let inputs = args.tensors();
        if inputs.len() != self.static_inputs.len() {
            return Err(JitError::SignatureMismatch(format!(
                "replay recorded {} tensors, got {}",
                self.static_inputs.len(),
                inputs.len()
            )));
        }
        for (buffer, input) in self.static_inputs.iter().zip(&inputs) {
            if buffer.shape() != input.shape() || buffer.dtype() != input.dtype() {
                return Err(JitError::SignatureMismatch(format!(
                    "replay recorded {}{:?}, got {}{:?}",
                    buffer.dtype(),
                    buffer.shape(),
                    input.dtype(),
                    input.shape()
                )));
            }
            buffer.copy_from(input)?;
        }
        self.refresh_params()?;

        let results = self.execute()?;
        for (buffer, result) in self.static_outputs.iter().zip(&results) {
            buffer.copy_from(result)?;
        }
        let copies: Vec<Tensor> = self.static_outputs.iter().map(Tensor::deep_clone).collect();
        Ok(self.template.fill(&copies)?)
    }

    /// Device the buffers live on.
    pub const fn device(&self) -> Device {
        self.device
    }

    /// Number of recorded instructions.
    pub fn len(&self) -> usize {
        self.tape.len()
    }

    /// True if the tape is empty.
    pub fn is_empty(&self) -> bool {
        self.tape.is_empty()
    }

    /// Number of parameters with a static buffer.
    pub fn param_count(&self) -> usize {
        self.static_params.len()
    }

    fn fetch<'a>(&'a self, slots: &'a [Option<Tensor>], op: &'a Operand) -> JitResult<&'a Tensor> {
        match op {
            Operand::Slot(i) => slots[*i]
                .as_ref()
                .ok_or_else(|| JitError::InvalidGraph(format!("slot {i} read before write"))),
            Operand::Param(i) => Ok(&self.static_params[*i].1),
            Operand::Bound(t) => Ok(t),
        }
    }

    fn refresh_params(&self) -> JitResult<()> {
        if self.static_params.is_empty() {
            return Ok(());
        }
        let store = self
            .params
            .as_ref()
            .ok_or_else(|| JitError::MissingParameter(self.static_params[0].0.clone()))?;
        for (name, buffer) in &self.static_params {
            let live = store
                .get(name)
                .ok_or_else(|| JitError::MissingParameter(name.clone()))?;
            buffer.copy_from(&live)?;
        }
        Ok(())
    }

    fn execute(&self) -> JitResult<Vec<Tensor>> {
        let mut slots: Vec<Option<Tensor>> = vec![None; self.slots];
        for (slot, input) in slots.iter_mut().zip(&self.static_inputs) {
            *slot = Some(input.clone());
        }
        for inst in &self.tape {
            let operands = inst
                .operands
                .iter()
                .map(|op| self.fetch(&slots, op))
                .collect::<JitResult<Vec<&Tensor>>>()?;
            let value = dispatch(inst.kind.clone(), &operands)?;
            slots[inst.out] = Some(value);
        }
        self.outputs
            .iter()
            .map(|op| self.fetch(&slots, op).cloned())
            .collect()
    }
}

fn operand(
    slot_of: &[Option<usize>],
    param_of: &[Option<usize>],
    bound: &[Option<Tensor>],
    idx: usize,
) -> JitResult<Operand> {
    if let Some(slot) = slot_of[idx] {
        return Ok(Operand::Slot(slot));
    }
    if let Some(param) = param_of[idx] {
        return Ok(Operand::Param(param));
    }
    bound[idx]
        .clone()
        .map(Operand::Bound)
        .ok_or_else(|| JitError::InvalidGraph(format!("node {idx} has no value")))
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Graph, TensorMeta};
    use crate::module::ParamStore;
    use std::sync::Arc;

    fn artifact() -> CompiledArtifact {
        let x = Tensor::from_vec(vec![0.0; 2], &[2]).unwrap();
        let mut g = Graph::new();
        let xi = g.add_input(TensorMeta::of(&x));
        let c = g.add_constant(cuda(vec![1.0, 2.0]));
        let y = g.add_op(OpKind::Add, vec![xi, c], TensorMeta::of(&x));
        g.set_outputs(vec![y], OutputTemplate::Tensor(0));
        CompiledArtifact::new(g, &Arc::new(ParamStore::new()))
    }

    fn cuda(values: Vec<f32>) -> Tensor {
        Tensor::from_vec(values, &[2]).unwrap().to_device(Device::Cuda(0))
    }

    #[test]
    fn test_record_and_replay() {
        let art = artifact();
        let (buffer, first) = ReplayBuffer::record(&art, &CallArgs::from_tensors([cuda(vec![1.0, 1.0])]))
            .unwrap();
        assert_eq!(buffer.len(), 1);
        assert_eq!(first.into_tensor().unwrap().to_vec(), vec![2.0, 3.0]);

        let y = buffer
            .replay(&CallArgs::from_tensors([cuda(vec![10.0, 20.0])]))
            .unwrap()
            .into_tensor()
            .unwrap();
        assert_eq!(y.to_vec(), vec![11.0, 22.0]);
        assert_eq!(y.device(), Device::Cuda(0));
    }

    #[test]
    fn test_returned_values_are_copies() {
        let art = artifact();
        let (buffer, _) =
            ReplayBuffer::record(&art, &CallArgs::from_tensors([cuda(vec![0.0, 0.0])])).unwrap();
        let a = buffer.replay(&CallArgs::from_tensors([cuda(vec![1.0, 1.0])])).unwrap();
        let b = buffer.replay(&CallArgs::from_tensors([cuda(vec![5.0, 5.0])])).unwrap();
        assert_eq!(a.into_tensor().unwrap().to_vec(), vec![2.0, 3.0]);
        assert_eq!(b.into_tensor().unwrap().to_vec(), vec![6.0, 7.0]);
    }

    #[test]
    fn test_cpu_unsupported() {
        let art = artifact();
        let x = Tensor::from_vec(vec![1.0, 1.0], &[2]).unwrap();
        assert!(matches!(
            ReplayBuffer::record(&art, &CallArgs::from_tensors([x])),
            Err(JitError::UnsupportedDevice { device: Device::Cpu })
        ));
    }

    #[test]
    fn test_params_follow_the_store() {
        let params = Arc::new(ParamStore::new());
        params.register("w", cuda(vec![2.0, 3.0]));
        let x = Tensor::from_vec(vec![0.0; 2], &[2]).unwrap();
        let mut g = Graph::new();
        let xi = g.add_input(TensorMeta::of(&x));
        let w = g.add_node(NodeKind::Param("w".into()), vec![], TensorMeta::of(&x));
        let y = g.add_op(OpKind::Mul, vec![xi, w], TensorMeta::of(&x));
        g.set_outputs(vec![y], OutputTemplate::Tensor(0));
        let art = CompiledArtifact::new(g, &params);

        let ones = || CallArgs::from_tensors([cuda(vec![1.0, 1.0])]);
        let (buffer, first) = ReplayBuffer::record(&art, &ones()).unwrap();
        assert_eq!(buffer.param_count(), 1);
        assert_eq!(first.into_tensor().unwrap().to_vec(), vec![2.0, 3.0]);

        params.set("w", cuda(vec![0.0, 0.0])).unwrap();
        let y = buffer.replay(&ones()).unwrap().into_tensor().unwrap();
        assert_eq!(y.to_vec(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_unrecordable_calls() {
        let art = artifact();
        assert!(matches!(
            ReplayBuffer::record(&art, &CallArgs::new()),
            Err(JitError::ReplayUnavailable(_))
        ));
        let cpu = Tensor::from_vec(vec![1.0, 1.0], &[2]).unwrap();
        assert!(matches!(
            ReplayBuffer::record(&art, &CallArgs::from_tensors([cuda(vec![1.0, 1.0]), cpu])),
            Err(JitError::ReplayUnavailable(_))
        ));
    }

    #[test]
    fn test_shape_mismatch() {
        let art = artifact();
        let (buffer, _) =
            ReplayBuffer::record(&art, &CallArgs::from_tensors([cuda(vec![0.0, 0.0])])).unwrap();
        let wrong = Tensor::from_vec(vec![0.0; 3], &[3]).unwrap().to_device(Device::Cuda(0));
        assert!(matches!(
            buffer.replay(&CallArgs::from_tensors([wrong])),
            Err(JitError::SignatureMismatch(_))
        ));
    }
}
