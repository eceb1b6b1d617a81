//! Scoring of predicted graphs against ground truth.
//!
//! New nodes are proposed in `k` unordered slots while the ground truth lists
//! its new nodes in some fixed order, so the node log-likelihood is taken over
//! every assignment \(\pi\) of ground-truth slots to proposed slots:
//! \[
//! \ell_\pi = \sum_i \big[c_{\pi(i)} \ln p_i + (1-c_{\pi(i)}) \ln(1-p_i)\big]
//!          + \sum_i \sum_v y_{\pi(i),v} \ln q_{i,v}.
//! \]
//! With `best_only` the loss is \(-\max_\pi \ell_\pi\); otherwise it is
//! \(-(\operatorname{LSE}_\pi \ell_\pi - \ln((k-c)!))\), where `c` is the number
//! of real new nodes: the `k - c` empty slots are interchangeable, so every
//! distinct assignment appears `(k-c)!` times in the sum.
//!
//! Enumeration is \(O(k!)\); `k` is capped by
//! [`MAX_NEW_NODES_PER_ITER`](crate::config::MAX_NEW_NODES_PER_ITER).
//!
//! Public invariants:
//! - absent nodes (strength 0) contribute exactly 0 to the edge loss;
//! - accuracy ignores edges touching an absent node.

use candle_core::{DType, Tensor};

use crate::config::OutputFormat;
use crate::error::{Error, Result};
use crate::numeric::{
    bernoulli_log_likelihood, categorical_best, categorical_log_likelihood, independent_best, is_close,
    ln_factorial, log_sum_exp_dim,
};

/// All permutations of `0..k` in lexicographic order; the first is the identity.
pub fn permutations(k: usize) -> Vec<Vec<usize>> {
    let mut current: Vec<usize> = (0..k).collect();
    let mut out = vec![current.clone()];
    // Narayana's next-permutation.
    loop {
        let Some(i) = (1..k).rev().find(|&i| current[i - 1] < current[i]) else {
            return out;
        };
        let pivot = i - 1;
        let Some(j) = (pivot + 1..k).rev().find(|&j| current[j] > current[pivot]) else {
            return out;
        };
        current.swap(pivot, j);
        current[pivot + 1..].reverse();
        out.push(current.clone());
    }
}

/// Node-matching scores for one step.
#[derive(Debug, Clone)]
pub struct NodeMatch {
    /// Per-example loss, `(b)`.
    pub loss: Tensor,
    /// Log-likelihood of each assignment, `(b, k!)`.
    pub perm_ll: Tensor,
    /// Ground-truth strengths reordered by each assignment, `(b, k!, k)`.
    pub permuted_strengths: Tensor,
    /// Ground-truth ids reordered by each assignment, `(b, k!, k, num_node_ids)`.
    pub permuted_ids: Tensor,
}

/// Permutation-invariant loss of proposed nodes against ground truth.
///
/// `correct_num_new_nodes[i]` is the number of real new nodes in example `i`.
pub fn node_matching_loss(
    new_strengths: &Tensor,
    new_ids: &Tensor,
    correct_strengths: &Tensor,
    correct_ids: &Tensor,
    correct_num_new_nodes: &[u32],
    best_only: bool,
) -> Result<NodeMatch> {
    let (b, k) = new_strengths.dims2()?;
    let num_ids = new_ids.dim(2)?;
    if correct_strengths.dims() != [b, k] {
        return Err(Error::ShapeMismatch {
            what: "correct_new_strengths",
            expected: vec![b, k],
            got: correct_strengths.dims().to_vec(),
        });
    }
    if correct_ids.dims() != [b, k, num_ids] {
        return Err(Error::ShapeMismatch {
            what: "correct_new_ids",
            expected: vec![b, k, num_ids],
            got: correct_ids.dims().to_vec(),
        });
    }
    if correct_num_new_nodes.len() != b {
        return Err(Error::ShapeMismatch {
            what: "correct_num_new_nodes",
            expected: vec![b],
            got: vec![correct_num_new_nodes.len()],
        });
    }

    let perms = permutations(k);
    let p = perms.len();
    let flat: Vec<u32> = perms.iter().flatten().map(|&i| i as u32).collect();
    let index = Tensor::from_vec(flat, p * k, new_strengths.device())?;

    let permuted_strengths = correct_strengths.index_select(&index, 1)?.reshape((b, p, k))?;
    let permuted_ids = correct_ids.index_select(&index, 1)?.reshape((b, p, k, num_ids))?;

    let strength_ll = bernoulli_log_likelihood(&permuted_strengths, &new_strengths.unsqueeze(1)?)?.sum(2)?;
    let ids_ll = categorical_log_likelihood(&permuted_ids, &new_ids.unsqueeze(1)?)?.sum(3)?.sum(2)?;
    let perm_ll = (strength_ll + ids_ll)?;

    let loss = if best_only {
        perm_ll.max(1)?.neg()?
    } else {
        let repetition: Vec<f32> = correct_num_new_nodes
            .iter()
            .map(|&c| ln_factorial(k.saturating_sub(c as usize)) as f32)
            .collect();
        let repetition = Tensor::from_vec(repetition, b, new_strengths.device())?;
        (log_sum_exp_dim(&perm_ll, 1)? - repetition)?.neg()?
    };
    Ok(NodeMatch { loss, perm_ll, permuted_strengths, permuted_ids })
}

/// Whether the snapped proposal equals the ground truth under some assignment.
///
/// A slot snapped to "absent" carries no identity. Every assignment is tried,
/// not only the most likely one: an empty ground-truth slot has zero identity
/// likelihood, so likelihood order alone can prefer a mismatched assignment.
pub fn node_accuracy(matched: &NodeMatch, new_strengths: &Tensor, new_ids: &Tensor) -> Result<Vec<bool>> {
    let (b, p, _) = matched.permuted_strengths.dims3()?;
    let snapped_strengths = independent_best(new_strengths)?;
    let snapped_ids = categorical_best(new_ids)?.broadcast_mul(&snapped_strengths.unsqueeze(2)?)?;
    let snapped_strengths = snapped_strengths.to_vec2::<f32>()?;
    let snapped_ids = snapped_ids.flatten_from(1)?.to_vec2::<f32>()?;
    let target_strengths = matched.permuted_strengths.to_vec3::<f32>()?;
    let target_ids = matched.permuted_ids.flatten_from(2)?.to_vec3::<f32>()?;
    let same = |t: &[f32], s: &[f32]| t.iter().zip(s).all(|(a, b)| is_close(*a, *b));
    Ok((0..b)
        .map(|i| {
            (0..p).any(|perm| {
                same(&target_strengths[i][perm], &snapped_strengths[i])
                    && same(&target_ids[i][perm], &snapped_ids[i])
            })
        })
        .collect())
}

/// The leading `n × n` block of padded ground-truth edges `(b, pad, pad, types)`.
pub fn crop_edges(correct_edges: &Tensor, n: usize) -> Result<Tensor> {
    let pad = correct_edges.dim(1)?;
    if n > pad {
        return Err(Error::ShapeMismatch {
            what: "graph_edges",
            expected: vec![n],
            got: vec![pad],
        });
    }
    Ok(correct_edges.narrow(1, 0, n)?.narrow(2, 0, n)?)
}

/// `s_i * s_j` for every ordered pair, shaped `(b, n, n, 1)`.
fn pair_mask(node_strengths: &Tensor) -> Result<Tensor> {
    let src = node_strengths.unsqueeze(2)?.unsqueeze(3)?;
    let dst = node_strengths.unsqueeze(1)?.unsqueeze(3)?;
    Ok(src.broadcast_mul(&dst)?)
}

/// Per-example edge loss `(b)`: Bernoulli NLL masked by endpoint existence,
/// summed over pairs and edge types.
pub fn edge_loss(edge_strengths: &Tensor, correct_edges: &Tensor, node_strengths: &Tensor) -> Result<Tensor> {
    let (b, n) = node_strengths.dims2()?;
    if n == 0 {
        return Ok(Tensor::zeros(b, DType::F32, node_strengths.device())?);
    }
    let ll = bernoulli_log_likelihood(correct_edges, edge_strengths)?;
    let masked = ll.broadcast_mul(&pair_mask(node_strengths)?)?;
    Ok(masked.sum(3)?.sum(2)?.sum(1)?.neg()?)
}

/// Whether snapped edges match ground truth wherever both endpoints exist.
pub fn edge_accuracy(edge_strengths: &Tensor, correct_edges: &Tensor, node_strengths: &Tensor) -> Result<Vec<bool>> {
    let (b, n) = node_strengths.dims2()?;
    if n == 0 {
        return Ok(vec![true; b]);
    }
    let types = edge_strengths.dim(3)?;
    let snapped = independent_best(edge_strengths)?.reshape((b, n * n * types))?.to_vec2::<f32>()?;
    let correct = correct_edges.reshape((b, n * n * types))?.to_vec2::<f32>()?;
    let mask = pair_mask(node_strengths)?
        .broadcast_as((b, n, n, types))?
        .contiguous()?
        .reshape((b, n * n * types))?
        .to_vec2::<f32>()?;
    Ok((0..b)
        .map(|i| {
            snapped[i]
                .iter()
                .zip(&correct[i])
                .zip(&mask[i])
                .all(|((s, c), m)| *m == 0.0 || is_close(*c, *s))
        })
        .collect())
}

/// Answer loss summed over timesteps and divided by the batch size.
///
/// `output` and `correct` are `(b, len, num_output_words)`.
pub fn query_loss(output: &Tensor, correct: &Tensor, format: OutputFormat) -> Result<Tensor> {
    if output.dims() != correct.dims() {
        return Err(Error::ShapeMismatch {
            what: "correct_output",
            expected: output.dims().to_vec(),
            got: correct.dims().to_vec(),
        });
    }
    let b = output.dim(0)?;
    let ll = match format {
        OutputFormat::Subset => bernoulli_log_likelihood(correct, output)?,
        OutputFormat::Category | OutputFormat::Sequence => categorical_log_likelihood(correct, output)?,
    };
    Ok(ll.sum_all()?.neg()?.affine(1.0 / b as f64, 0.0)?)
}
