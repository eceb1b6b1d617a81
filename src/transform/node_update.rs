//! Node-state update from a sentence (or query) representation.

use candle_core::{Tensor, D};
use candle_nn::VarBuilder;

use super::{per_node, GatedUpdate};
use crate::dropout::{self, DropoutSampler, StageMasks};
use crate::error::Result;
use crate::graph_state::{GraphState, GraphStateSpec};

/// Updates every node's state from `[node_ids, input]`, gated by node strength.
#[derive(Debug, Clone)]
pub struct NodeStateUpdate {
    spec: GraphStateSpec,
    input_width: usize,
    cell: GatedUpdate,
}

impl NodeStateUpdate {
    /// Cell reading `[node_ids, input]` for `input_width`-wide inputs.
    pub fn new(input_width: usize, spec: GraphStateSpec, vb: VarBuilder) -> Result<Self> {
        let cell = GatedUpdate::new(spec.num_node_ids + input_width, spec.node_state_size, vb.pp("cell"))?;
        Ok(Self { spec, input_width, cell })
    }

    /// Input mask plus the shared `states` mask.
    pub fn dropout_masks(&self, sampler: &mut DropoutSampler, states: Option<&Tensor>) -> Result<StageMasks> {
        sampler.stage(states, self.spec.num_node_ids + self.input_width, None)
    }

    /// `input`: `(b, input_width)`.
    pub fn process(&self, gstate: &GraphState, input: &Tensor, masks: &StageMasks) -> Result<GraphState> {
        let n = gstate.n_nodes();
        if n == 0 {
            return Ok(gstate.clone());
        }
        let x = Tensor::cat(&[gstate.node_ids(), &per_node(input, n)?], D::Minus1)?;
        let x = dropout::apply(&x, masks.input.as_ref())?;
        let next = self.cell.forward(&x, gstate.node_states(), gstate.node_strengths(), masks.states.as_ref())?;
        gstate.with_node_states(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn only_present_nodes_change() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let spec = GraphStateSpec::new(3, 4, 1);
        let update = NodeStateUpdate::new(5, spec, vb).unwrap();
        let g = GraphState::create_empty(1, &spec, &dev)
            .unwrap()
            .with_additional_nodes(
                &Tensor::new(&[[1.0f32, 0.0]], &dev).unwrap(),
                &Tensor::new(&[[[1.0f32, 0.0, 0.0], [0.0, 1.0, 0.0]]], &dev).unwrap(),
            )
            .unwrap();
        let input = Tensor::ones((1, 5), DType::F32, &dev).unwrap();
        let next = update.process(&g, &input, &StageMasks::default()).unwrap();
        let states = next.node_states().to_vec3::<f32>().unwrap();
        assert!(states[0][1].iter().all(|&v| v == 0.0));
        assert!(states[0][0].iter().any(|&v| v != 0.0));
    }

    #[test]
    fn dropped_states_do_not_leak_into_absent_nodes() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let spec = GraphStateSpec::new(2, 3, 1);
        let update = NodeStateUpdate::new(4, spec, vb).unwrap();
        let g = GraphState::create_empty(1, &spec, &dev)
            .unwrap()
            .with_additional_nodes(
                &Tensor::new(&[[0.0f32]], &dev).unwrap(),
                &Tensor::new(&[[[1.0f32, 0.0]]], &dev).unwrap(),
            )
            .unwrap()
            .with_node_states(Tensor::new(&[[[0.5f32, -0.25, 0.75]]], &dev).unwrap())
            .unwrap();
        let masks = StageMasks { states: Some(Tensor::new(&[2.0f32, 2.0, 2.0], &dev).unwrap()), ..Default::default() };
        let input = Tensor::ones((1, 4), DType::F32, &dev).unwrap();
        let next = update.process(&g, &input, &masks).unwrap();
        let after = next.node_states().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for (a, b) in after.iter().zip([0.5f32, -0.25, 0.75]) {
            assert!((a - b).abs() < 1e-6, "a={} b={}", a, b);
        }
    }

    #[test]
    fn empty_graph_passes_through() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let spec = GraphStateSpec::new(3, 4, 1);
        let update = NodeStateUpdate::new(5, spec, vb).unwrap();
        let g = GraphState::create_empty(2, &spec, &dev).unwrap();
        let input = Tensor::ones((2, 5), DType::F32, &dev).unwrap();
        let next = update.process(&g, &input, &StageMasks::default()).unwrap();
        assert_eq!(next.n_nodes(), 0);
    }
}
