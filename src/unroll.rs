//! The recurrence over sentences.
//!
//! The loop-carried value is a [`FlatGraphState`] of fixed node capacity: each
//! step unflattens it, runs the assembled [`Stage`]s, and flattens the result
//! back. Under teacher forcing the ground-truth nodes and edges replace the
//! predicted ones after they are scored, so one bad step does not derail the
//! rest of the sequence.

use candle_core::{DType, Tensor};

use crate::config::CheckMode;
use crate::dropout::StageMasks;
use crate::error::{Error, Result};
use crate::graph_state::{FlatGraphState, GraphState};
use crate::matching::{crop_edges, edge_accuracy, edge_loss, node_accuracy, node_matching_loss};
use crate::model::GraphTargets;
use crate::numeric::{categorical_best, check_finite, independent_best};
use crate::pipeline::{Stage, StepPipeline};

/// How predictions feed the next step.
#[derive(Debug, Clone, Copy)]
pub enum Drive<'a> {
    /// Score against ground truth, then continue from the ground truth.
    Teacher {
        /// Ground-truth graph for every sentence.
        targets: &'a GraphTargets,
        /// Also compute per-example accuracy.
        evaluate_accuracy: bool,
    },
    /// Continue from the model's own predictions, optionally snapped to hard values.
    Free {
        /// Snap strengths, identities and edges before continuing.
        snap: bool,
    },
}

/// Result of unrolling a batch of sentence sequences.
#[derive(Debug, Clone)]
pub struct Unrolled {
    /// State after every sentence, padded to the common capacity.
    pub steps: Vec<FlatGraphState>,
    /// Node-matching loss summed over sentences, `(b)`; teacher forcing with dynamic nodes only.
    pub node_loss: Option<Tensor>,
    /// Edge loss summed over sentences, `(b)`; teacher forcing only.
    pub edge_loss: Option<Tensor>,
    /// Whether every step of each example was reproduced exactly.
    pub accuracy: Option<Vec<bool>>,
}

struct StepTargets {
    num_new_nodes: Vec<u32>,
    new_strengths: Tensor,
    new_ids: Tensor,
    edges: Tensor,
}

struct StepOutcome {
    state: GraphState,
    node_loss: Option<Tensor>,
    edge_loss: Option<Tensor>,
    accuracy: Option<Vec<bool>>,
}

fn and_all(acc: Option<Vec<bool>>, other: Vec<bool>) -> Vec<bool> {
    match acc {
        Some(a) => a.iter().zip(&other).map(|(x, y)| *x && *y).collect(),
        None => other,
    }
}

fn sum_steps(losses: Vec<Tensor>) -> Result<Option<Tensor>> {
    if losses.is_empty() {
        return Ok(None);
    }
    Ok(Some(Tensor::stack(&losses, 0)?.sum(0)?))
}

/// Drives a [`StepPipeline`] across sentences.
pub struct Recurrence<'a> {
    pipeline: &'a StepPipeline,
    best_node_match_only: bool,
    check: CheckMode,
}

impl<'a> Recurrence<'a> {
    /// Drive `pipeline`; `best_node_match_only` selects the node loss.
    pub fn new(pipeline: &'a StepPipeline, best_node_match_only: bool, check: CheckMode) -> Self {
        Self { pipeline, best_node_match_only, check }
    }

    /// Unroll over `inputs` `(b, S, repr)` with reference matrices `refs` `(b, S, ids, repr)`.
    ///
    /// `masks` is aligned with the pipeline stages; an empty slice means no dropout.
    pub fn run(
        &self,
        initial: &GraphState,
        pad_size: usize,
        inputs: &Tensor,
        refs: &Tensor,
        drive: Drive<'_>,
        masks: &[StageMasks],
    ) -> Result<Unrolled> {
        let (b, n_sentences, _) = inputs.dims3()?;
        let num_new_nodes = match drive {
            Drive::Teacher { targets, .. } => Some(targets.num_new_nodes.to_vec2::<u32>()?),
            Drive::Free { .. } => None,
        };

        let mut flat = initial.flatten_to_const_size(pad_size)?;
        let mut steps = Vec::with_capacity(n_sentences);
        let mut node_losses = Vec::new();
        let mut edge_losses = Vec::new();
        let mut accuracy: Option<Vec<bool>> = None;
        for t in 0..n_sentences {
            let gstate = GraphState::unflatten_from_const_size(&flat)?;
            let input = inputs.narrow(1, t, 1)?.squeeze(1)?;
            let step_refs = refs.narrow(1, t, 1)?.squeeze(1)?;
            let (targets, evaluate_accuracy, snap) = match (drive, &num_new_nodes) {
                (Drive::Teacher { targets, evaluate_accuracy }, Some(counts)) => {
                    let step = StepTargets {
                        num_new_nodes: counts.iter().map(|row| row[t]).collect(),
                        new_strengths: targets.new_node_strengths.narrow(1, t, 1)?.squeeze(1)?,
                        new_ids: targets.new_node_ids.narrow(1, t, 1)?.squeeze(1)?,
                        edges: targets.edges.narrow(1, t, 1)?.squeeze(1)?,
                    };
                    (Some(step), evaluate_accuracy, false)
                }
                (Drive::Free { snap }, _) => (None, false, snap),
                (Drive::Teacher { .. }, None) => return Err(Error::MissingGraphTargets),
            };

            let outcome = self.step(gstate, &input, &step_refs, targets.as_ref(), evaluate_accuracy, snap, masks)?;
            log::trace!("sentence {t}: {} nodes", outcome.state.n_nodes());
            node_losses.extend(outcome.node_loss);
            edge_losses.extend(outcome.edge_loss);
            if let Some(a) = outcome.accuracy {
                accuracy = Some(and_all(accuracy, a));
            }
            flat = outcome.state.flatten_to_const_size(pad_size)?;
            steps.push(flat.clone());
        }

        let accuracy = match drive {
            Drive::Teacher { evaluate_accuracy: true, .. } => Some(accuracy.unwrap_or_else(|| vec![true; b])),
            _ => None,
        };
        Ok(Unrolled {
            steps,
            node_loss: sum_steps(node_losses)?,
            edge_loss: sum_steps(edge_losses)?,
            accuracy,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn step(
        &self,
        mut gstate: GraphState,
        input: &Tensor,
        refs: &Tensor,
        targets: Option<&StepTargets>,
        evaluate_accuracy: bool,
        snap: bool,
        masks: &[StageMasks],
    ) -> Result<StepOutcome> {
        let no_masks = StageMasks::default();
        let mut node_loss = None;
        let mut edge_loss_value = None;
        let mut accuracy: Option<Vec<bool>> = None;

        for (i, stage) in self.pipeline.stages().iter().enumerate() {
            let m = masks.get(i).unwrap_or(&no_masks);
            match stage {
                Stage::UpdateNodes(update) => {
                    gstate = update.process(&gstate, input, m)?;
                    check_finite(gstate.node_states(), "update_nodes", self.check)?;
                }
                Stage::DirectReference(update) => {
                    gstate = update.process(&gstate, refs, m)?;
                    check_finite(gstate.node_states(), "direct_reference", self.check)?;
                }
                Stage::Propagate { transform, iterations } => {
                    gstate = transform.process_multiple(&gstate, *iterations, m)?;
                    check_finite(gstate.node_states(), "propagate", self.check)?;
                }
                Stage::ProposeNodes(proposer) => {
                    let (strengths, ids) = proposer.get_candidates(&gstate, input, m)?;
                    check_finite(&strengths, "propose_nodes", self.check)?;
                    check_finite(&ids, "propose_nodes", self.check)?;
                    gstate = match targets {
                        Some(truth) => {
                            let matched = node_matching_loss(
                                &strengths,
                                &ids,
                                &truth.new_strengths,
                                &truth.new_ids,
                                &truth.num_new_nodes,
                                self.best_node_match_only,
                            )?;
                            check_finite(&matched.loss, "node_loss", self.check)?;
                            if evaluate_accuracy {
                                accuracy = Some(node_accuracy(&matched, &strengths, &ids)?);
                            }
                            node_loss = Some(matched.loss);
                            gstate.with_additional_nodes(&truth.new_strengths, &truth.new_ids)?
                        }
                        None if snap => {
                            let s = independent_best(&strengths)?;
                            let ids = categorical_best(&ids)?.broadcast_mul(&s.unsqueeze(2)?)?;
                            gstate.with_additional_nodes(&s, &ids)?
                        }
                        None => gstate.with_additional_nodes(&strengths, &ids)?,
                    };
                }
                Stage::UpdateEdges(update) => {
                    gstate = update.process(&gstate, input, m)?;
                    check_finite(gstate.edge_strengths(), "update_edges", self.check)?;
                    match targets {
                        Some(truth) if gstate.n_nodes() > 0 => {
                            let correct = crop_edges(&truth.edges, gstate.n_nodes())?;
                            let loss = edge_loss(gstate.edge_strengths(), &correct, gstate.node_strengths())?;
                            check_finite(&loss, "edge_loss", self.check)?;
                            if evaluate_accuracy {
                                let edges_ok = edge_accuracy(gstate.edge_strengths(), &correct, gstate.node_strengths())?;
                                accuracy = Some(and_all(accuracy, edges_ok));
                            }
                            edge_loss_value = Some(loss);
                            gstate = gstate.with_edge_strengths(correct)?;
                        }
                        Some(_) => {
                            edge_loss_value = Some(Tensor::zeros(gstate.n_batch(), DType::F32, gstate.device())?);
                        }
                        None if snap => {
                            let snapped = independent_best(gstate.edge_strengths())?;
                            gstate = gstate.with_edge_strengths(snapped)?;
                        }
                        None => {}
                    }
                }
            }
        }
        Ok(StepOutcome { state: gstate, node_loss, edge_loss: edge_loss_value, accuracy })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::graph_state::GraphStateSpec;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    fn setup(config: &ModelConfig) -> (StepPipeline, GraphStateSpec, VarMap) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let spec = GraphStateSpec::new(config.num_node_ids, config.node_state_size, config.num_edge_types);
        (StepPipeline::build(config, spec, vb).unwrap(), spec, varmap)
    }

    #[test]
    fn free_run_grows_by_k_per_sentence() {
        let config = ModelConfig::default().with_graph_spec(4, 5, 2).with_new_nodes_per_iter(2).with_repr_size(6);
        let (pipeline, spec, _vm) = setup(&config);
        let dev = Device::Cpu;
        let (b, s) = (2, 3);
        let inputs = Tensor::randn(0f32, 1f32, (b, s, 6), &dev).unwrap();
        let refs = Tensor::zeros((b, s, 4, 6), DType::F32, &dev).unwrap();
        let initial = GraphState::create_empty(b, &spec, &dev).unwrap();
        let pad = config.pad_graph_size(s);
        for snap in [false, true] {
            let out = Recurrence::new(&pipeline, true, CheckMode::Nan)
                .run(&initial, pad, &inputs, &refs, Drive::Free { snap }, &[])
                .unwrap();
            assert_eq!(out.steps.len(), s);
            for (t, step) in out.steps.iter().enumerate() {
                assert_eq!(step.n_nodes, 2 * (t + 1));
                assert_eq!(step.pad_size(), pad);
            }
            assert!(out.node_loss.is_none() && out.edge_loss.is_none() && out.accuracy.is_none());
            if snap {
                let last = GraphState::unflatten_from_const_size(&out.steps[s - 1]).unwrap();
                for v in last.edge_strengths().flatten_all().unwrap().to_vec1::<f32>().unwrap() {
                    assert!(v == 0.0 || v == 1.0);
                }
            }
        }
    }

    #[test]
    fn teacher_forcing_substitutes_ground_truth() {
        let config = ModelConfig::default().with_graph_spec(3, 4, 1).with_new_nodes_per_iter(1).with_repr_size(5);
        let (pipeline, spec, _vm) = setup(&config);
        let dev = Device::Cpu;
        let s = 2;
        let pad = config.pad_graph_size(s);
        let inputs = Tensor::randn(0f32, 1f32, (1, s, 5), &dev).unwrap();
        let refs = Tensor::zeros((1, s, 3, 5), DType::F32, &dev).unwrap();
        let mut edges = vec![0f32; s * pad * pad];
        // second sentence: edge 0 -> 1
        edges[pad * pad + 1] = 1.0;
        let targets = GraphTargets {
            num_new_nodes: Tensor::new(&[[1u32, 1]], &dev).unwrap(),
            new_node_strengths: Tensor::new(&[[[1.0f32], [1.0]]], &dev).unwrap(),
            new_node_ids: Tensor::new(&[[[[1.0f32, 0.0, 0.0]], [[0.0, 0.0, 1.0]]]], &dev).unwrap(),
            edges: Tensor::from_vec(edges, (1, s, pad, pad, 1), &dev).unwrap(),
        };
        let initial = GraphState::create_empty(1, &spec, &dev).unwrap();
        let out = Recurrence::new(&pipeline, true, CheckMode::Nan)
            .run(&initial, pad, &inputs, &refs, Drive::Teacher { targets: &targets, evaluate_accuracy: true }, &[])
            .unwrap();
        let last = GraphState::unflatten_from_const_size(&out.steps[1]).unwrap();
        assert_eq!(last.node_ids().to_vec3::<f32>().unwrap(), vec![vec![vec![1.0, 0.0, 0.0], vec![0.0, 0.0, 1.0]]]);
        assert_eq!(
            last.edge_strengths().flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![0.0, 1.0, 0.0, 0.0]
        );
        assert_eq!(out.node_loss.unwrap().dims(), &[1]);
        assert!(out.edge_loss.unwrap().to_vec1::<f32>().unwrap()[0] > 0.0);
        assert_eq!(out.accuracy.map(|a| a.len()), Some(1));
    }
}
