//! Edge update: per ordered node pair, soft "add" and "clear" gates per edge type.
//!
//! \[
//! e'_{ijt} = s_i s_j \big( (1 - c_{ijt})\, e_{ijt} + a_{ijt} (1 - e_{ijt}) \big)
//! \]
//! with `a, c ∈ (0,1)` computed from both endpoints' features and the step
//! input. The result stays in \([0,1]\) and vanishes when either endpoint is absent.

use candle_core::{Tensor, D};
use candle_nn::{linear, Linear, VarBuilder};

use super::dense;
use crate::dropout::{self, DropoutSampler, StageMasks};
use crate::error::Result;
use crate::graph_state::{GraphState, GraphStateSpec};
use crate::numeric::{complement, sigmoid};

#[derive(Debug, Clone)]
/// Add/clear gates over every ordered node pair.
pub struct EdgeStateUpdate {
    spec: GraphStateSpec,
    input_width: usize,
    hidden_width: usize,
    hidden: Linear,
    add_gate: Linear,
    clear_gate: Linear,
}

impl EdgeStateUpdate {
    /// Gates conditioned on `input_width`-wide sentence representations.
    pub fn new(input_width: usize, spec: GraphStateSpec, vb: VarBuilder) -> Result<Self> {
        let hidden_width = input_width;
        let pair_width = 2 * spec.node_feature_size() + input_width;
        Ok(Self {
            spec,
            input_width,
            hidden_width,
            hidden: linear(pair_width, hidden_width, vb.pp("hidden"))?,
            add_gate: linear(hidden_width, spec.num_edge_types, vb.pp("add"))?,
            clear_gate: linear(hidden_width, spec.num_edge_types, vb.pp("clear"))?,
        })
    }

    /// Masks over the pair features and the hidden layer.
    pub fn dropout_masks(&self, sampler: &mut DropoutSampler) -> Result<StageMasks> {
        let pair_width = 2 * self.spec.node_feature_size() + self.input_width;
        sampler.stage(None, pair_width, Some(self.hidden_width))
    }

    /// `input`: `(b, input_width)`.
    pub fn process(&self, gstate: &GraphState, input: &Tensor, masks: &StageMasks) -> Result<GraphState> {
        let n = gstate.n_nodes();
        if n == 0 {
            return Ok(gstate.clone());
        }
        let b = gstate.n_batch();
        let h = dropout::apply(gstate.node_states(), masks.states.as_ref())?;
        let features = Tensor::cat(&[gstate.node_ids(), &h], D::Minus1)?;
        let f = features.dim(2)?;
        let src = features.unsqueeze(2)?.broadcast_as((b, n, n, f))?;
        let dst = features.unsqueeze(1)?.broadcast_as((b, n, n, f))?;
        let ctx = input.unsqueeze(1)?.unsqueeze(1)?.broadcast_as((b, n, n, self.input_width))?;
        let pairs = Tensor::cat(&[&src, &dst, &ctx], D::Minus1)?;
        let pairs = dropout::apply(&pairs, masks.input.as_ref())?;

        let hidden = dense(&self.hidden, &pairs)?.tanh()?;
        let hidden = dropout::apply(&hidden, masks.hidden.as_ref())?;
        let add = sigmoid(&dense(&self.add_gate, &hidden)?)?;
        let clear = sigmoid(&dense(&self.clear_gate, &hidden)?)?;

        let edges = gstate.edge_strengths();
        let kept = (complement(&clear)? * edges)?;
        let added = (add * complement(edges)?)?;
        let s = gstate.node_strengths();
        let pair_mask = s.unsqueeze(2)?.unsqueeze(3)?.broadcast_mul(&s.unsqueeze(1)?.unsqueeze(3)?)?;
        let next = (kept + added)?.broadcast_mul(&pair_mask)?;
        gstate.with_edge_strengths(next)
    }
}
