//! Node-state update from words that name a node id directly.
//!
//! The encoder supplies a reference matrix `(b, num_node_ids, width)` whose
//! row `i` sums the representations of words mapped to id `i`. Each node reads
//! those rows through its soft identity, `node_ids · refs`, so a node that is
//! 70% "id 2" receives 70% of the reference to id 2.

use candle_core::{Tensor, D};
use candle_nn::VarBuilder;

use super::GatedUpdate;
use crate::dropout::{self, DropoutSampler, StageMasks};
use crate::error::Result;
use crate::graph_state::{GraphState, GraphStateSpec};

#[derive(Debug, Clone)]
/// Gated node update reading the reference rows selected by each identity.
pub struct DirectReferenceUpdate {
    spec: GraphStateSpec,
    input_width: usize,
    cell: GatedUpdate,
}

impl DirectReferenceUpdate {
    /// Fresh parameters under `vb` for `input_width`-wide references.
    pub fn new(input_width: usize, spec: GraphStateSpec, vb: VarBuilder) -> Result<Self> {
        let cell = GatedUpdate::new(spec.num_node_ids + input_width, spec.node_state_size, vb.pp("cell"))?;
        Ok(Self { spec, input_width, cell })
    }

    /// Input mask plus the shared `states` mask.
    pub fn dropout_masks(&self, sampler: &mut DropoutSampler, states: Option<&Tensor>) -> Result<StageMasks> {
        sampler.stage(states, self.spec.num_node_ids + self.input_width, None)
    }

    /// `refs`: `(b, num_node_ids, input_width)`.
    pub fn process(&self, gstate: &GraphState, refs: &Tensor, masks: &StageMasks) -> Result<GraphState> {
        if gstate.n_nodes() == 0 {
            return Ok(gstate.clone());
        }
        let received = gstate.node_ids().matmul(&refs.contiguous()?)?;
        let x = Tensor::cat(&[gstate.node_ids(), &received], D::Minus1)?;
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
    fn updates_keep_graph_shape() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let spec = GraphStateSpec::new(4, 3, 2);
        let stage = DirectReferenceUpdate::new(6, spec, vb).unwrap();
        let g = GraphState::create_full_unique(2, &spec, &dev).unwrap();
        let refs = Tensor::randn(0f32, 1f32, (2, 4, 6), &dev).unwrap();
        let next = stage.process(&g, &refs, &StageMasks::default()).unwrap();
        assert_eq!(next.node_states().dims(), &[2, 4, 3]);
        assert_eq!(next.n_nodes(), 4);
    }
}
