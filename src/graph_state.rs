//! Batched soft graph: node existence strengths, soft identities, continuous
//! node states and typed edge strengths.
//!
//! Shapes, for a batch of `b` graphs with `n` node slots:
//! - `node_strengths`: `(b, n)`, in \([0,1]\)
//! - `node_ids`: `(b, n, num_node_ids)`
//! - `node_states`: `(b, n, node_state_size)`
//! - `edge_strengths`: `(b, n, n, num_edge_types)`, in \([0,1]\)
//!
//! Public invariants:
//! - Values are immutable; every update returns a new [`GraphState`].
//! - Node slots are append-only: `n` never shrinks within a sequence.
//! - A slot with strength 0 is absent. It is never removed, only masked out at
//!   every scoring site, so batched shapes stay fixed.
//! - Padding written by [`GraphState::flatten_to_const_size`] is all zeros.

use candle_core::{DType, Device, Tensor};

use crate::error::{Error, Result};

/// Static sizes shared by every graph of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphStateSpec {
    /// Width of a soft node identity.
    pub num_node_ids: usize,
    /// Width of a continuous node state.
    pub node_state_size: usize,
    /// Number of edge types.
    pub num_edge_types: usize,
}

impl GraphStateSpec {
    /// Bundle the three sizes.
    pub fn new(num_node_ids: usize, node_state_size: usize, num_edge_types: usize) -> Self {
        Self { num_node_ids, node_state_size, num_edge_types }
    }

    /// Width of the `[node_ids, node_states]` feature vector of one node.
    pub fn node_feature_size(&self) -> usize {
        self.num_node_ids + self.node_state_size
    }
}

/// Field replacements for [`GraphState::with_updates`]; `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct GraphUpdate {
    /// Replacement `(b, n)` strengths.
    pub node_strengths: Option<Tensor>,
    /// Replacement `(b, n, num_node_ids)` identities.
    pub node_ids: Option<Tensor>,
    /// Replacement `(b, n, node_state_size)` states.
    pub node_states: Option<Tensor>,
    /// Replacement `(b, n, n, num_edge_types)` edges.
    pub edge_strengths: Option<Tensor>,
}

/// A batch of soft graphs with a common node count.
#[derive(Debug, Clone)]
pub struct GraphState {
    node_strengths: Tensor,
    node_ids: Tensor,
    node_states: Tensor,
    edge_strengths: Tensor,
}

fn expect_dims(what: &'static str, t: &Tensor, expected: &[usize]) -> Result<()> {
    if t.dims() != expected {
        return Err(Error::ShapeMismatch { what, expected: expected.to_vec(), got: t.dims().to_vec() });
    }
    Ok(())
}

/// Zero-pad `t` along each of `dims` from `from` to `to` entries.
fn pad_axes(t: &Tensor, dims: &[usize], from: usize, to: usize) -> Result<Tensor> {
    let mut out = t.clone();
    for &d in dims {
        out = out.pad_with_zeros(d, 0, to - from)?;
    }
    Ok(out)
}

impl GraphState {
    /// Assemble a state from its four tensors, checking that their shapes agree.
    pub fn from_parts(
        node_strengths: Tensor,
        node_ids: Tensor,
        node_states: Tensor,
        edge_strengths: Tensor,
    ) -> Result<Self> {
        let (b, n) = node_strengths.dims2()?;
        let ids = node_ids.dim(2)?;
        let state = node_states.dim(2)?;
        let types = edge_strengths.dim(3)?;
        expect_dims("node_ids", &node_ids, &[b, n, ids])?;
        expect_dims("node_states", &node_states, &[b, n, state])?;
        expect_dims("edge_strengths", &edge_strengths, &[b, n, n, types])?;
        Ok(Self { node_strengths, node_ids, node_states, edge_strengths })
    }

    /// A batch of graphs with no nodes.
    pub fn create_empty(n_batch: usize, spec: &GraphStateSpec, device: &Device) -> Result<Self> {
        Ok(Self {
            node_strengths: Tensor::zeros((n_batch, 0), DType::F32, device)?,
            node_ids: Tensor::zeros((n_batch, 0, spec.num_node_ids), DType::F32, device)?,
            node_states: Tensor::zeros((n_batch, 0, spec.node_state_size), DType::F32, device)?,
            edge_strengths: Tensor::zeros((n_batch, 0, 0, spec.num_edge_types), DType::F32, device)?,
        })
    }

    /// One fully-present node per identity, with identity `i` at slot `i`, zero state and no edges.
    pub fn create_full_unique(n_batch: usize, spec: &GraphStateSpec, device: &Device) -> Result<Self> {
        let n = spec.num_node_ids;
        let ids = Tensor::eye(n, DType::F32, device)?
            .unsqueeze(0)?
            .broadcast_as((n_batch, n, n))?
            .contiguous()?;
        Ok(Self {
            node_strengths: Tensor::ones((n_batch, n), DType::F32, device)?,
            node_ids: ids,
            node_states: Tensor::zeros((n_batch, n, spec.node_state_size), DType::F32, device)?,
            edge_strengths: Tensor::zeros((n_batch, n, n, spec.num_edge_types), DType::F32, device)?,
        })
    }

    /// Existence strengths `(b, n)`.
    pub fn node_strengths(&self) -> &Tensor {
        &self.node_strengths
    }

    /// Soft identities `(b, n, num_node_ids)`.
    pub fn node_ids(&self) -> &Tensor {
        &self.node_ids
    }

    /// Node states `(b, n, node_state_size)`.
    pub fn node_states(&self) -> &Tensor {
        &self.node_states
    }

    /// Typed edge strengths `(b, n, n, num_edge_types)`; `[b, i, j]` is `i -> j`.
    pub fn edge_strengths(&self) -> &Tensor {
        &self.edge_strengths
    }

    /// Graphs in the batch.
    pub fn n_batch(&self) -> usize {
        self.node_strengths.dims()[0]
    }

    /// Node slots, present or not.
    pub fn n_nodes(&self) -> usize {
        self.node_strengths.dims()[1]
    }

    /// Device of every tensor in the state.
    pub fn device(&self) -> &Device {
        self.node_strengths.device()
    }

    /// Sizes recovered from the tensor shapes.
    pub fn spec(&self) -> GraphStateSpec {
        GraphStateSpec {
            num_node_ids: self.node_ids.dims()[2],
            node_state_size: self.node_states.dims()[2],
            num_edge_types: self.edge_strengths.dims()[3],
        }
    }

    /// Per-node `[node_ids, node_states]` features, shape `(b, n, ids + state)`.
    pub fn node_features(&self) -> Result<Tensor> {
        Ok(Tensor::cat(&[&self.node_ids, &self.node_states], 2)?)
    }

    /// Append `k` nodes with the given strengths `(b, k)` and identities `(b, k, ids)`.
    ///
    /// New nodes start with zero state and no edges; existing values are kept exactly.
    pub fn with_additional_nodes(&self, new_strengths: &Tensor, new_ids: &Tensor) -> Result<Self> {
        let spec = self.spec();
        let b = self.n_batch();
        let n = self.n_nodes();
        let k = new_strengths.dim(1)?;
        expect_dims("new_strengths", new_strengths, &[b, k])?;
        expect_dims("new_ids", new_ids, &[b, k, spec.num_node_ids])?;
        let new_states = Tensor::zeros((b, k, spec.node_state_size), DType::F32, self.device())?;
        if n == 0 {
            return Ok(Self {
                node_strengths: new_strengths.clone(),
                node_ids: new_ids.clone(),
                node_states: new_states,
                edge_strengths: Tensor::zeros((b, k, k, spec.num_edge_types), DType::F32, self.device())?,
            });
        }
        Ok(Self {
            node_strengths: Tensor::cat(&[&self.node_strengths, new_strengths], 1)?,
            node_ids: Tensor::cat(&[&self.node_ids, new_ids], 1)?,
            node_states: Tensor::cat(&[&self.node_states, &new_states], 1)?,
            edge_strengths: pad_axes(&self.edge_strengths, &[1, 2], n, n + k)?,
        })
    }

    /// Replace any subset of fields; shapes must match the current ones.
    pub fn with_updates(&self, update: GraphUpdate) -> Result<Self> {
        let next = Self {
            node_strengths: update.node_strengths.unwrap_or_else(|| self.node_strengths.clone()),
            node_ids: update.node_ids.unwrap_or_else(|| self.node_ids.clone()),
            node_states: update.node_states.unwrap_or_else(|| self.node_states.clone()),
            edge_strengths: update.edge_strengths.unwrap_or_else(|| self.edge_strengths.clone()),
        };
        let spec = self.spec();
        let (b, n) = (self.n_batch(), self.n_nodes());
        expect_dims("node_strengths", &next.node_strengths, &[b, n])?;
        expect_dims("node_ids", &next.node_ids, &[b, n, spec.num_node_ids])?;
        expect_dims("node_states", &next.node_states, &[b, n, spec.node_state_size])?;
        expect_dims("edge_strengths", &next.edge_strengths, &[b, n, n, spec.num_edge_types])?;
        Ok(next)
    }

    /// Same graph with new node states.
    pub fn with_node_states(&self, node_states: Tensor) -> Result<Self> {
        self.with_updates(GraphUpdate { node_states: Some(node_states), ..Default::default() })
    }

    /// Same graph with new edge strengths.
    pub fn with_edge_strengths(&self, edge_strengths: Tensor) -> Result<Self> {
        self.with_updates(GraphUpdate { edge_strengths: Some(edge_strengths), ..Default::default() })
    }

    /// Zero-pad to exactly `pad_size` node slots.
    pub fn flatten_to_const_size(&self, pad_size: usize) -> Result<FlatGraphState> {
        let n = self.n_nodes();
        if pad_size < n {
            return Err(Error::ShapeMismatch {
                what: "pad_size",
                expected: vec![n],
                got: vec![pad_size],
            });
        }
        let spec = self.spec();
        let b = self.n_batch();
        let device = self.device();
        let (node_strengths, node_ids, node_states, edge_strengths) = if n == 0 {
            (
                Tensor::zeros((b, pad_size), DType::F32, device)?,
                Tensor::zeros((b, pad_size, spec.num_node_ids), DType::F32, device)?,
                Tensor::zeros((b, pad_size, spec.node_state_size), DType::F32, device)?,
                Tensor::zeros((b, pad_size, pad_size, spec.num_edge_types), DType::F32, device)?,
            )
        } else {
            (
                pad_axes(&self.node_strengths, &[1], n, pad_size)?,
                pad_axes(&self.node_ids, &[1], n, pad_size)?,
                pad_axes(&self.node_states, &[1], n, pad_size)?,
                pad_axes(&self.edge_strengths, &[1, 2], n, pad_size)?,
            )
        };
        Ok(FlatGraphState { node_strengths, node_ids, node_states, edge_strengths, n_nodes: n })
    }

    /// Inverse of [`GraphState::flatten_to_const_size`].
    pub fn unflatten_from_const_size(flat: &FlatGraphState) -> Result<Self> {
        let n = flat.n_nodes;
        if n == 0 {
            let b = flat.node_strengths.dim(0)?;
            let spec = flat.spec();
            return Self::create_empty(b, &spec, flat.node_strengths.device());
        }
        Self::from_parts(
            flat.node_strengths.narrow(1, 0, n)?,
            flat.node_ids.narrow(1, 0, n)?,
            flat.node_states.narrow(1, 0, n)?,
            flat.edge_strengths.narrow(1, 0, n)?.narrow(2, 0, n)?,
        )
    }
}

/// A [`GraphState`] zero-padded to a fixed node capacity, plus its true node count.
#[derive(Debug, Clone)]
pub struct FlatGraphState {
    /// `(b, pad)`
    pub node_strengths: Tensor,
    /// `(b, pad, num_node_ids)`
    pub node_ids: Tensor,
    /// `(b, pad, node_state_size)`
    pub node_states: Tensor,
    /// `(b, pad, pad, num_edge_types)`
    pub edge_strengths: Tensor,
    /// Number of leading slots that belong to the graph.
    pub n_nodes: usize,
}

impl FlatGraphState {
    /// Node capacity of the padded tensors.
    pub fn pad_size(&self) -> usize {
        self.node_strengths.dims()[1]
    }

    /// Sizes of the padded graphs.
    pub fn spec(&self) -> GraphStateSpec {
        GraphStateSpec {
            num_node_ids: self.node_ids.dims()[2],
            node_state_size: self.node_states.dims()[2],
            num_edge_types: self.edge_strengths.dims()[3],
        }
    }

    /// Merge per-timestep states `t = 0..T` (same pad size) into one batch of
    /// `b * T` graphs ordered batch-major, carrying the largest node count.
    ///
    /// Slots past a timestep's own node count are padding and have zero strength.
    pub fn concat_timesteps(steps: &[FlatGraphState]) -> Result<FlatGraphState> {
        let first = steps.first().ok_or(Error::ShapeMismatch {
            what: "timesteps",
            expected: vec![1],
            got: vec![0],
        })?;
        let b = first.node_strengths.dim(0)?;
        let t = steps.len();
        let merge = |pick: fn(&FlatGraphState) -> &Tensor| -> Result<Tensor> {
            let parts: Vec<&Tensor> = steps.iter().map(pick).collect();
            let stacked = Tensor::stack(&parts, 1)?;
            let mut dims = stacked.dims().to_vec();
            dims.remove(0);
            dims[0] = b * t;
            Ok(stacked.reshape(dims)?)
        };
        Ok(FlatGraphState {
            node_strengths: merge(|s| &s.node_strengths)?,
            node_ids: merge(|s| &s.node_ids)?,
            node_states: merge(|s| &s.node_states)?,
            edge_strengths: merge(|s| &s.edge_strengths)?,
            n_nodes: steps.iter().map(|s| s.n_nodes).max().unwrap_or(0),
        })
    }
}
