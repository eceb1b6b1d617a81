//! Graph readout: collapse all nodes into one vector by existence-masked attention.
//!
//! Each node's features `[node_ids, node_states]` pass through one affine map
//! to `width + 1` activations. The first is an attention logit, shifted by
//! `log(s + ε)` so absent nodes drop out of the softmax:
//! \[
//! \alpha = \operatorname{softmax}_n\big(a_{n,0} + \log(s_n + \epsilon)\big),\qquad
//! r = \sum_n \alpha_n\, \phi(a_{n,1..})
//! \]
//! where `φ` is `tanh` for [`AggregateActivation::Tanh`] and a softmax over the
//! representation axis for [`AggregateActivation::Softmax`].

use candle_core::{DType, Tensor, D};
use candle_nn::{linear, Linear, VarBuilder};

use super::dense;
use crate::dropout::{self, DropoutSampler, StageMasks};
use crate::error::Result;
use crate::graph_state::{GraphState, GraphStateSpec};
use crate::numeric::EPSILON;

/// Activation applied to per-node candidate representations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateActivation {
    /// `tanh`; the default readout.
    Tanh,
    /// Softmax over the representation axis (the older readout).
    Softmax,
}

#[derive(Debug, Clone)]
/// Existence-masked attention readout of a whole graph.
pub struct AggregateRepresentation {
    spec: GraphStateSpec,
    width: usize,
    layer: Linear,
    activation: AggregateActivation,
}

impl AggregateRepresentation {
    /// Readout of width `width`, with fresh parameters.
    pub fn new(width: usize, spec: GraphStateSpec, activation: AggregateActivation, vb: VarBuilder) -> Result<Self> {
        let layer = linear(spec.node_feature_size(), width + 1, vb.pp("representation"))?;
        Ok(Self { spec, width, layer, activation })
    }

    /// Build from an existing `(node_feature_size -> width + 1)` layer.
    pub fn from_layer(layer: Linear, width: usize, spec: GraphStateSpec, activation: AggregateActivation) -> Self {
        Self { spec, width, layer, activation }
    }

    /// Mask over the node features.
    pub fn dropout_masks(&self, sampler: &mut DropoutSampler) -> Result<StageMasks> {
        sampler.stage(None, self.spec.node_feature_size(), None)
    }

    /// Readout of shape `(b, width)`; an empty graph reads out as zeros.
    pub fn process(&self, gstate: &GraphState, masks: &StageMasks) -> Result<Tensor> {
        let n = gstate.n_nodes();
        if n == 0 {
            return Ok(Tensor::zeros((gstate.n_batch(), self.width), DType::F32, gstate.device())?);
        }
        let features = dropout::apply(&gstate.node_features()?, masks.input.as_ref())?;
        let activations = dense(&self.layer, &features)?;
        let logits = activations.narrow(2, 0, 1)?.squeeze(2)?;
        let existence = gstate.node_strengths().affine(1.0, EPSILON)?.log()?;
        let selector = candle_nn::ops::softmax(&(logits + existence)?, 1)?.unsqueeze(2)?;
        let raw = activations.narrow(2, 1, self.width)?;
        let representations = match self.activation {
            AggregateActivation::Tanh => raw.tanh()?,
            AggregateActivation::Softmax => candle_nn::ops::softmax(&raw, D::Minus1)?,
        };
        Ok(representations.broadcast_mul(&selector)?.sum(1)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph_state::GraphUpdate;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn fixed_layer(dev: &Device) -> Linear {
        // 2 ids + 1 state -> 1 logit + 2 outputs
        let w = Tensor::new(&[[0.5f32, -0.3, 0.2], [0.4, 0.1, -0.6], [-0.2, 0.7, 0.3]], dev).unwrap();
        let b = Tensor::new(&[0.1f32, -0.1, 0.05], dev).unwrap();
        Linear::new(w, Some(b))
    }

    #[test]
    fn single_present_node_is_selected_exactly() {
        let dev = Device::Cpu;
        let spec = GraphStateSpec::new(2, 1, 1);
        let agg = AggregateRepresentation::from_layer(fixed_layer(&dev), 2, spec, AggregateActivation::Tanh);
        let ids = Tensor::new(&[[[1.0f32, 0.0], [0.0, 1.0], [0.5, 0.5]]], &dev).unwrap();
        let states = Tensor::new(&[[[0.8f32], [-3.0], [2.5]]], &dev).unwrap();
        let g = GraphState::from_parts(
            Tensor::new(&[[1.0f32, 0.0, 0.0]], &dev).unwrap(),
            ids,
            states,
            Tensor::zeros((1, 3, 3, 1), DType::F32, &dev).unwrap(),
        )
        .unwrap();
        let out = agg.process(&g, &StageMasks::default()).unwrap().to_vec2::<f32>().unwrap();

        // node 0 features [1, 0, 0.8]: raw = W[1..] x + b[1..]
        let raw0 = 0.4 * 1.0 + 0.1 * 0.0 - 0.6 * 0.8 - 0.1;
        let raw1 = -0.2 * 1.0 + 0.7 * 0.0 + 0.3 * 0.8 + 0.05;
        assert!((out[0][0] - f32::tanh(raw0)).abs() < 1e-4, "{:?}", out);
        assert!((out[0][1] - f32::tanh(raw1)).abs() < 1e-4, "{:?}", out);

        // other nodes' values do not matter
        let g2 = g
            .with_updates(GraphUpdate {
                node_states: Some(Tensor::new(&[[[0.8f32], [9.0], [-7.0]]], &dev).unwrap()),
                ..Default::default()
            })
            .unwrap();
        let out2 = agg.process(&g2, &StageMasks::default()).unwrap().to_vec2::<f32>().unwrap();
        for (a, b) in out[0].iter().zip(&out2[0]) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn padding_nodes_do_not_change_readout() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let spec = GraphStateSpec::new(3, 2, 1);
        let agg = AggregateRepresentation::new(4, spec, AggregateActivation::Softmax, vb).unwrap();
        let g = GraphState::create_full_unique(2, &spec, &dev).unwrap();
        let padded = g
            .with_additional_nodes(
                &Tensor::zeros((2, 2), DType::F32, &dev).unwrap(),
                &Tensor::zeros((2, 2, 3), DType::F32, &dev).unwrap(),
            )
            .unwrap();
        let a = agg.process(&g, &StageMasks::default()).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = agg
            .process(&padded, &StageMasks::default())
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-5, "x={} y={}", x, y);
        }
    }

    #[test]
    fn empty_graph_reads_out_zeros() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let spec = GraphStateSpec::new(3, 2, 1);
        let agg = AggregateRepresentation::new(4, spec, AggregateActivation::Tanh, vb).unwrap();
        let g = GraphState::create_empty(2, &spec, &dev).unwrap();
        let out = agg.process(&g, &StageMasks::default()).unwrap();
        assert_eq!(out.dims(), &[2, 4]);
        assert!(out.flatten_all().unwrap().to_vec1::<f32>().unwrap().iter().all(|&v| v == 0.0));
    }
}
