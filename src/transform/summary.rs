//! Attention readout over a sequence of per-timestep graph readouts.

use candle_core::{Tensor, D};
use candle_nn::{linear, Linear, VarBuilder};

use super::dense;
use crate::dropout::{self, DropoutSampler, StageMasks};
use crate::error::Result;

/// `(b, T, input_width) -> (b, output_width)` by softmax attention over `T`.
#[derive(Debug, Clone)]
pub struct SequenceAggregateSummary {
    input_width: usize,
    output_width: usize,
    layer: Linear,
}

impl SequenceAggregateSummary {
    /// Summary from `input_width` readouts to `output_width`.
    pub fn new(input_width: usize, output_width: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            input_width,
            output_width,
            layer: linear(input_width, output_width + 1, vb.pp("summary"))?,
        })
    }

    /// Mask over the per-timestep readouts.
    pub fn dropout_masks(&self, sampler: &mut DropoutSampler) -> Result<StageMasks> {
        sampler.stage(None, self.input_width, None)
    }

    /// `sequence`: `(b, T, input_width)` to `(b, output_width)`.
    pub fn process(&self, sequence: &Tensor, masks: &StageMasks) -> Result<Tensor> {
        let x = dropout::apply(sequence, masks.input.as_ref())?;
        let activations = dense(&self.layer, &x)?;
        let weights = candle_nn::ops::softmax(&activations.narrow(D::Minus1, 0, 1)?, 1)?;
        let candidates = activations.narrow(D::Minus1, 1, self.output_width)?.tanh()?;
        Ok(candidates.broadcast_mul(&weights)?.sum(1)?)
    }
}
