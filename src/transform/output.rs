//! Answer heads over the aggregated graph representation.
//!
//! All heads return `(b, len, num_output_words)`; `len` is 1 for category and
//! subset answers and caller-chosen for sequences.

use candle_core::{DType, Tensor, D};
use candle_nn::{linear, Linear, Module, VarBuilder};

use crate::config::OutputFormat;
use crate::error::Result;
use crate::numeric::{categorical_best, independent_best, sigmoid};

#[derive(Debug, Clone)]
/// Answer head, one variant per [`OutputFormat`].
pub enum OutputHead {
    /// `softmax(W r)`.
    Category { layer: Linear },
    /// `σ(W r)` per output word.
    Subset { layer: Linear },
    /// `h_t = tanh(W[h_{t-1}, y_{t-1}])`, `y_t = softmax(W_o h_t)`, `h_0 = r`, `y_0 = 0`.
    Sequence { step: Linear, out: Linear, num_output_words: usize },
}

impl OutputHead {
    /// Head for `format` over `repr_width`-wide readouts.
    pub fn new(format: OutputFormat, repr_width: usize, num_output_words: usize, vb: VarBuilder) -> Result<Self> {
        Ok(match format {
            OutputFormat::Category => Self::Category { layer: linear(repr_width, num_output_words, vb.pp("category"))? },
            OutputFormat::Subset => Self::Subset { layer: linear(repr_width, num_output_words, vb.pp("subset"))? },
            OutputFormat::Sequence => Self::Sequence {
                step: linear(repr_width + num_output_words, repr_width, vb.pp("sequence_step"))?,
                out: linear(repr_width, num_output_words, vb.pp("sequence_out"))?,
                num_output_words,
            },
        })
    }

    /// Format this head produces.
    pub fn format(&self) -> OutputFormat {
        match self {
            Self::Category { .. } => OutputFormat::Category,
            Self::Subset { .. } => OutputFormat::Subset,
            Self::Sequence { .. } => OutputFormat::Sequence,
        }
    }

    /// `repr`: `(b, repr_width)`. `len` is ignored except for sequences.
    pub fn process(&self, repr: &Tensor, len: usize) -> Result<Tensor> {
        match self {
            Self::Category { layer } => Ok(candle_nn::ops::softmax(&layer.forward(repr)?, D::Minus1)?.unsqueeze(1)?),
            Self::Subset { layer } => Ok(sigmoid(&layer.forward(repr)?)?.unsqueeze(1)?),
            Self::Sequence { step, out, num_output_words } => {
                let b = repr.dim(0)?;
                let mut h = repr.clone();
                let mut y = Tensor::zeros((b, *num_output_words), DType::F32, repr.device())?;
                let mut outputs = Vec::with_capacity(len);
                for _ in 0..len {
                    h = step.forward(&Tensor::cat(&[&h, &y], D::Minus1)?)?.tanh()?;
                    y = candle_nn::ops::softmax(&out.forward(&h)?, D::Minus1)?;
                    outputs.push(y.clone());
                }
                if outputs.is_empty() {
                    return Ok(Tensor::zeros((b, 0, *num_output_words), DType::F32, repr.device())?);
                }
                Ok(Tensor::stack(&outputs, 1)?)
            }
        }
    }

    /// Hard answer: one-hot argmax for distributions, `p >= 0.5` for subsets.
    pub fn snap_to_best(&self, output: &Tensor) -> Result<Tensor> {
        match self {
            Self::Subset { .. } => independent_best(output),
            _ => categorical_best(output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn head(format: OutputFormat) -> (OutputHead, VarMap) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        (OutputHead::new(format, 6, 4, vb).unwrap(), varmap)
    }

    #[test]
    fn shapes_per_format() {
        let repr = Tensor::randn(0f32, 1f32, (3, 6), &Device::Cpu).unwrap();
        let (category, _a) = head(OutputFormat::Category);
        let (subset, _b) = head(OutputFormat::Subset);
        let (sequence, _c) = head(OutputFormat::Sequence);
        assert_eq!(category.process(&repr, 9).unwrap().dims(), &[3, 1, 4]);
        assert_eq!(subset.process(&repr, 9).unwrap().dims(), &[3, 1, 4]);
        assert_eq!(sequence.process(&repr, 5).unwrap().dims(), &[3, 5, 4]);
    }

    #[test]
    fn snapped_sequence_is_one_hot_per_step() {
        let repr = Tensor::randn(0f32, 1f32, (2, 6), &Device::Cpu).unwrap();
        let (sequence, _vm) = head(OutputFormat::Sequence);
        let out = sequence.process(&repr, 3).unwrap();
        let snapped = sequence.snap_to_best(&out).unwrap();
        let sums = snapped.sum(D::Minus1).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(sums.iter().all(|&s| s == 1.0));
    }
}
