//! Per-step graph transformations.
//!
//! Every transformation is a pure function of its parameters, a
//! [`GraphState`](crate::graph_state::GraphState) and a step input: it returns
//! a new state (or a score) and never mutates its arguments.
//!
//! - [`node_update`]: gated node-state update from the sentence representation
//! - [`direct_reference`]: node-state update from directly referenced words
//! - [`propagation`]: message passing along soft typed edges
//! - [`edge_update`]: edge add/clear gates per ordered node pair
//! - [`new_nodes`]: candidate node proposal
//! - [`aggregate`]: existence-masked attention readout of a whole graph
//! - [`summary`]: attention readout over a sequence of graph readouts
//! - [`output`]: category / subset / sequence answer heads

pub mod aggregate;
pub mod direct_reference;
pub mod edge_update;
pub mod new_nodes;
pub mod node_update;
pub mod output;
pub mod propagation;
pub mod summary;

use candle_core::{Tensor, D};
use candle_nn::{linear, Linear, Module, VarBuilder};

use crate::dropout;
use crate::error::Result;
use crate::numeric::{complement, sigmoid};

/// Apply `layer` to the last axis of a tensor of any rank.
pub(crate) fn dense(layer: &Linear, x: &Tensor) -> Result<Tensor> {
    let dims = x.dims().to_vec();
    let (last, lead) = match dims.split_last() {
        Some((last, lead)) => (*last, lead.to_vec()),
        None => return Ok(layer.forward(x)?),
    };
    let rows: usize = lead.iter().product();
    let out = layer.forward(&x.reshape((rows, last))?)?;
    let mut out_dims = lead;
    out_dims.push(out.dim(1)?);
    Ok(out.reshape(out_dims)?)
}

/// Repeat a per-graph vector `(b, w)` for each of `n` nodes: `(b, n, w)`.
pub(crate) fn per_node(x: &Tensor, n: usize) -> Result<Tensor> {
    let (b, w) = x.dims2()?;
    Ok(x.unsqueeze(1)?.broadcast_as((b, n, w))?.contiguous()?)
}

/// GRU-style cell that updates node states, gated by node existence.
///
/// With input `x`, state `h` and strength `s`:
/// \[
/// r=\sigma(W_r[x,h]),\ z=\sigma(W_z[x,h]),\ \tilde h=\tanh(W_h[x,r\odot h]),\
/// h' = s\,(z\odot\tilde h + (1-z)\odot h) + (1-s)\,h .
/// \]
/// The states dropout mask, when present, only affects what the gates and the
/// candidate read; the carried `h` is never masked, so a node with `s = 0`
/// keeps its state exactly.
#[derive(Debug, Clone)]
pub struct GatedUpdate {
    reset: Linear,
    update: Linear,
    candidate: Linear,
}

impl GatedUpdate {
    /// Cell reading `input_width` features into `state_width` units.
    pub fn new(input_width: usize, state_width: usize, vb: VarBuilder) -> Result<Self> {
        let width = input_width + state_width;
        Ok(Self {
            reset: linear(width, state_width, vb.pp("reset"))?,
            update: linear(width, state_width, vb.pp("update"))?,
            candidate: linear(width, state_width, vb.pp("candidate"))?,
        })
    }

    /// `x`: `(b, n, input_width)`, `h`: `(b, n, state_width)`, `strengths`: `(b, n)`,
    /// `states_mask`: `(state_width)`.
    pub fn forward(&self, x: &Tensor, h: &Tensor, strengths: &Tensor, states_mask: Option<&Tensor>) -> Result<Tensor> {
        let seen = dropout::apply(h, states_mask)?;
        let xh = Tensor::cat(&[x, &seen], D::Minus1)?;
        let r = sigmoid(&dense(&self.reset, &xh)?)?;
        let z = sigmoid(&dense(&self.update, &xh)?)?;
        let xrh = Tensor::cat(&[x, &(r * seen)?], D::Minus1)?;
        let candidate = dense(&self.candidate, &xrh)?.tanh()?;
        let next = ((&z * candidate)? + (complement(&z)? * h)?)?;
        let s = strengths.unsqueeze(D::Minus1)?;
        let gated = next.broadcast_mul(&s)?.add(&h.broadcast_mul(&complement(&s)?)?)?;
        Ok(gated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn dense_handles_higher_rank_inputs() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let layer = linear(5, 3, vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (2, 4, 4, 5), &Device::Cpu).unwrap();
        let y = dense(&layer, &x).unwrap();
        assert_eq!(y.dims(), &[2, 4, 4, 3]);
    }

    #[test]
    fn absent_nodes_keep_their_state() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cell = GatedUpdate::new(3, 4, vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (1, 2, 3), &Device::Cpu).unwrap();
        let h = Tensor::randn(0f32, 1f32, (1, 2, 4), &Device::Cpu).unwrap();
        let s = Tensor::new(&[[1.0f32, 0.0]], &Device::Cpu).unwrap();
        let out = cell.forward(&x, &h, &s, None).unwrap();
        let absent = out.narrow(1, 1, 1).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let before = h.narrow(1, 1, 1).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for (a, b) in absent.iter().zip(before) {
            assert!((a - b).abs() < 1e-6, "a={} b={}", a, b);
        }
    }

    #[test]
    fn states_mask_is_not_carried_into_the_kept_state() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let cell = GatedUpdate::new(2, 3, vb).unwrap();
        let x = Tensor::new(&[[[0.3f32, -0.7], [1.0, 0.2]]], &dev).unwrap();
        let h = Tensor::new(&[[[0.5f32, -0.25, 0.75], [0.1, 0.2, -0.3]]], &dev).unwrap();
        let s = Tensor::new(&[[0.0f32, 1.0]], &dev).unwrap();
        let mask = Tensor::new(&[2.0f32, 2.0, 2.0], &dev).unwrap();
        let out = cell.forward(&x, &h, &s, Some(&mask)).unwrap().to_vec3::<f32>().unwrap();
        let before = h.to_vec3::<f32>().unwrap();
        for (a, b) in out[0][0].iter().zip(&before[0][0]) {
            assert!((a - b).abs() < 1e-6, "absent node moved: a={} b={}", a, b);
        }
        // a present node is a convex mix of its unmasked state and a tanh candidate
        for (a, b) in out[0][1].iter().zip(&before[0][1]) {
            assert!(a.abs() <= b.abs().max(1.0) + 1e-6, "a={} b={}", a, b);
        }
    }
}
