//! Candidate node proposal.
//!
//! The whole graph is read out (same aggregator family as the query readout),
//! combined with the step input, and unrolled over `k` slots:
//! \[
//! h_0 = \tanh(W_0[c, x]),\quad h_i = \tanh(W_h[h_{i-1}, c]),\quad
//! p_i = \sigma(w_s \cdot h_i),\quad q_i = \operatorname{softmax}(W_q h_i)
//! \]
//! so each slot can condition on what earlier slots proposed. Slots are
//! unordered with respect to the ground truth; see [`crate::matching`].

use candle_core::{Tensor, D};
use candle_nn::{linear, Linear, Module, VarBuilder};

use super::aggregate::{AggregateActivation, AggregateRepresentation};
use crate::dropout::{self, DropoutSampler, StageMasks};
use crate::error::Result;
use crate::graph_state::{GraphState, GraphStateSpec};
use crate::numeric::sigmoid;

#[derive(Debug, Clone)]
/// Proposes a fixed number of candidate nodes per sentence.
pub struct NewNodesInform {
    input_width: usize,
    propose_width: usize,
    slots: usize,
    readout: AggregateRepresentation,
    start: Linear,
    step: Linear,
    strength: Linear,
    ids: Linear,
}

impl NewNodesInform {
    /// A proposer of `slots` candidates per call.
    pub fn new(
        input_width: usize,
        propose_width: usize,
        slots: usize,
        spec: GraphStateSpec,
        activation: AggregateActivation,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            input_width,
            propose_width,
            slots,
            readout: AggregateRepresentation::new(propose_width, spec, activation, vb.pp("readout"))?,
            start: linear(propose_width + input_width, propose_width, vb.pp("start"))?,
            step: linear(2 * propose_width, propose_width, vb.pp("step"))?,
            strength: linear(propose_width, 1, vb.pp("strength"))?,
            ids: linear(propose_width, spec.num_node_ids, vb.pp("ids"))?,
        })
    }

    /// Masks over the proposer input and its hidden state.
    pub fn dropout_masks(&self, sampler: &mut DropoutSampler) -> Result<StageMasks> {
        sampler.stage(None, self.propose_width + self.input_width, Some(self.propose_width))
    }

    /// Proposed strengths `(b, k)` in \([0,1]\) and identity distributions `(b, k, num_node_ids)`.
    pub fn get_candidates(&self, gstate: &GraphState, input: &Tensor, masks: &StageMasks) -> Result<(Tensor, Tensor)> {
        let context = self.readout.process(gstate, &StageMasks::default())?;
        let x = Tensor::cat(&[&context, input], D::Minus1)?;
        let x = dropout::apply(&x, masks.input.as_ref())?;
        let mut h = self.start.forward(&x)?.tanh()?;
        let mut strengths = Vec::with_capacity(self.slots);
        let mut ids = Vec::with_capacity(self.slots);
        for _ in 0..self.slots {
            h = self.step.forward(&Tensor::cat(&[&h, &context], D::Minus1)?)?.tanh()?;
            let hd = dropout::apply(&h, masks.hidden.as_ref())?;
            strengths.push(sigmoid(&self.strength.forward(&hd)?)?);
            ids.push(candle_nn::ops::softmax(&self.ids.forward(&hd)?, D::Minus1)?);
        }
        let strengths = Tensor::cat(&strengths, 1)?;
        let ids = Tensor::stack(&ids, 1)?;
        Ok((strengths, ids))
    }
}
