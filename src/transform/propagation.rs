//! Message passing along soft typed edges.
//!
//! For each edge type `t`, every node emits a forward message `f_t` along its
//! outgoing edges and a backward message `b_t` along its incoming edges, both
//! scaled by the sender's existence strength. Node `j` receives
//! \[
//! m_j = \sum_t \sum_i e_{ijt}\, s_i f_t(v_i) + \sum_t \sum_i e_{jit}\, s_i b_t(v_i)
//! \]
//! and updates its state through a gated cell with input `[ids_j, m_j]`.

use candle_core::{Tensor, D};
use candle_nn::{linear, Linear, VarBuilder};

use super::{dense, GatedUpdate};
use crate::dropout::{self, DropoutSampler, StageMasks};
use crate::error::Result;
use crate::graph_state::{GraphState, GraphStateSpec};

#[derive(Debug, Clone)]
/// Message passing followed by a gated state update.
pub struct PropagationTransformation {
    spec: GraphStateSpec,
    message_width: usize,
    forward_message: Linear,
    backward_message: Linear,
    cell: GatedUpdate,
}

impl PropagationTransformation {
    /// Messages of width `message_width` per edge type.
    pub fn new(message_width: usize, spec: GraphStateSpec, vb: VarBuilder) -> Result<Self> {
        let fan_out = message_width * spec.num_edge_types;
        Ok(Self {
            spec,
            message_width,
            forward_message: linear(spec.node_feature_size(), fan_out, vb.pp("forward"))?,
            backward_message: linear(spec.node_feature_size(), fan_out, vb.pp("backward"))?,
            cell: GatedUpdate::new(spec.num_node_ids + message_width, spec.node_state_size, vb.pp("cell"))?,
        })
    }

    /// Feature and message masks plus the shared `states` mask.
    pub fn dropout_masks(&self, sampler: &mut DropoutSampler, states: Option<&Tensor>) -> Result<StageMasks> {
        sampler.stage(states, self.spec.node_feature_size(), Some(self.message_width))
    }

    fn messages(&self, layer: &Linear, features: &Tensor, strengths: &Tensor, masks: &StageMasks) -> Result<Tensor> {
        let (b, n, _) = features.dims3()?;
        let m = dense(layer, features)?.tanh()?;
        let m = m.reshape((b, n, self.spec.num_edge_types, self.message_width))?;
        let m = dropout::apply(&m, masks.hidden.as_ref())?;
        Ok(m.broadcast_mul(&strengths.unsqueeze(2)?.unsqueeze(3)?)?)
    }

    /// One round of message passing.
    pub fn process(&self, gstate: &GraphState, masks: &StageMasks) -> Result<GraphState> {
        if gstate.n_nodes() == 0 {
            return Ok(gstate.clone());
        }
        let h = dropout::apply(gstate.node_states(), masks.states.as_ref())?;
        let features = Tensor::cat(&[gstate.node_ids(), &h], D::Minus1)?;
        let features = dropout::apply(&features, masks.input.as_ref())?;
        let strengths = gstate.node_strengths();
        let fwd = self.messages(&self.forward_message, &features, strengths, masks)?;
        let bwd = self.messages(&self.backward_message, &features, strengths, masks)?;

        let mut received: Option<Tensor> = None;
        for t in 0..self.spec.num_edge_types {
            // edges[b, i, j] = strength of i -> j
            let edges = gstate.edge_strengths().narrow(3, t, 1)?.squeeze(3)?.contiguous()?;
            let incoming = edges.t()?.contiguous()?.matmul(&fwd.narrow(2, t, 1)?.squeeze(2)?.contiguous()?)?;
            let outgoing = edges.matmul(&bwd.narrow(2, t, 1)?.squeeze(2)?.contiguous()?)?;
            let total = (incoming + outgoing)?;
            received = Some(match received {
                Some(acc) => (acc + total)?,
                None => total,
            });
        }
        let received = match received {
            Some(r) => r,
            None => return Ok(gstate.clone()),
        };
        let x = Tensor::cat(&[gstate.node_ids(), &received], D::Minus1)?;
        let next = self.cell.forward(&x, gstate.node_states(), strengths, masks.states.as_ref())?;
        gstate.with_node_states(next)
    }

    /// `iterations` rounds, reusing the same masks each round.
    pub fn process_multiple(&self, gstate: &GraphState, iterations: usize, masks: &StageMasks) -> Result<GraphState> {
        let mut g = gstate.clone();
        for _ in 0..iterations {
            g = self.process(&g, masks)?;
        }
        Ok(g)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn two_node_graph(edge: f32) -> GraphState {
        let dev = Device::Cpu;
        let spec = GraphStateSpec::new(2, 3, 1);
        let g = GraphState::create_full_unique(1, &spec, &dev).unwrap();
        let edges = Tensor::new(&[[[[0.0f32], [edge]], [[0.0], [0.0]]]], &dev).unwrap();
        g.with_edge_strengths(edges).unwrap()
    }

    #[test]
    fn edges_change_what_nodes_receive() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let prop = PropagationTransformation::new(4, GraphStateSpec::new(2, 3, 1), vb).unwrap();
        let masks = StageMasks::default();
        let connected = prop.process_multiple(&two_node_graph(1.0), 2, &masks).unwrap();
        let isolated = prop.process_multiple(&two_node_graph(0.0), 2, &masks).unwrap();
        let a = connected.node_states().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = isolated.node_states().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(a.iter().zip(&b).any(|(x, y)| (x - y).abs() > 1e-6));
    }

    #[test]
    fn zero_iterations_is_identity() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let prop = PropagationTransformation::new(4, GraphStateSpec::new(2, 3, 1), vb).unwrap();
        let g = two_node_graph(1.0);
        let same = prop.process_multiple(&g, 0, &StageMasks::default()).unwrap();
        assert_eq!(
            same.node_states().flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            g.node_states().flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }
}
