//! The assembled graph model.
//!
//! A [`Model`] owns its parameters (one [`VarMap`]), the sentence encoder, the
//! per-sentence [`StepPipeline`] and, when the query is trained, a
//! [`QueryPipeline`]. Every entry point is a single call to [`Model::forward`]
//! with a different [`Mode`]:
//!
//! - [`Model::eval`]: teacher-forced losses and, optionally, accuracy;
//! - [`Model::infer`]: free-running output, soft or snapped;
//! - [`Model::debug_graphs`]: the teacher-forced graph after every sentence.
//!
//! The total loss is
//! \[
//! \frac{1}{S}\Big(\frac{1}{b}\sum \text{node} + \frac{1}{b}\sum \text{edge}\Big)
//! + \frac{1}{b}\sum \text{query},
//! \]
//! with either part absent when its training flag is off.

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::{ModelConfig, OutputFormat};
use crate::dropout::DropoutSampler;
use crate::encoder::{DirectInputEncoder, InputEncoder};
use crate::error::{Error, Result};
use crate::graph_state::{FlatGraphState, GraphState, GraphStateSpec};
use crate::matching::query_loss;
use crate::numeric::check_finite;
use crate::pipeline::{DropoutMasks, QueryPipeline, StepPipeline};
use crate::unroll::{Drive, Recurrence};

/// Named scalar diagnostics (`node_loss`, `edge_loss`, `query_loss`, `graph_accuracy`).
pub type Info = BTreeMap<String, f32>;

/// Ground-truth graph construction for a batch.
///
/// `pad` is [`ModelConfig::pad_graph_size`] for the batch's sentence count.
#[derive(Debug, Clone)]
pub struct GraphTargets {
    /// Real new nodes per sentence, U32 `(b, S)`.
    pub num_new_nodes: Tensor,
    /// New-node strengths, `(b, S, k)`.
    pub new_node_strengths: Tensor,
    /// New-node identities, `(b, S, k, num_node_ids)`.
    pub new_node_ids: Tensor,
    /// Edges after each sentence, `(b, S, pad, pad, num_edge_types)`.
    pub edges: Tensor,
}

/// One batch of stories, queries and (optionally) supervision.
#[derive(Debug, Clone)]
pub struct Batch {
    /// U32 `(b, S, sentence_len)`; word 0 is padding.
    pub input_words: Tensor,
    /// U32 `(b, query_len)`.
    pub query_words: Tensor,
    /// `(b, out_len, num_output_words)`; `out_len` is 1 unless the output is a sequence.
    pub correct_output: Option<Tensor>,
    /// Ground-truth graphs.
    pub graph: Option<GraphTargets>,
}

impl Batch {
    /// A batch with no supervision.
    pub fn new(input_words: Tensor, query_words: Tensor) -> Self {
        Self { input_words, query_words, correct_output: None, graph: None }
    }

    /// Attach the expected answers.
    pub fn with_output(mut self, correct_output: Tensor) -> Self {
        self.correct_output = Some(correct_output);
        self
    }

    /// Attach the ground-truth graphs.
    pub fn with_graph(mut self, graph: GraphTargets) -> Self {
        self.graph = Some(graph);
        self
    }
}

/// How a forward pass treats the graph it builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Teacher forcing with ground-truth graphs (when the graph is trained) and scored output.
    Supervised {
        /// Also report per-example graph accuracy.
        evaluate_accuracy: bool,
    },
    /// The model continues from its own predictions.
    Free {
        /// Snap nodes, edges and the answer to hard values.
        snap: bool,
        /// Decode length for sequence answers.
        out_len: usize,
    },
}

/// Graph states over one forward pass.
///
/// With a sequence representation, `query` and `propagated` hold `b * S`
/// graphs ordered batch-major, one per sentence prefix.
#[derive(Debug, Clone)]
pub struct GraphTimeline {
    /// State after every sentence.
    pub steps: Vec<GraphState>,
    /// State after the query update.
    pub query: Option<GraphState>,
    /// State after final propagation.
    pub propagated: Option<GraphState>,
}

/// Everything one forward pass produced.
#[derive(Debug, Clone)]
pub struct Forward {
    /// Scalar loss; zero when nothing was scored.
    pub loss: Tensor,
    /// Answer `(b, out_len, num_output_words)` when the query is trained.
    pub output: Option<Tensor>,
    /// Graph states.
    pub timeline: GraphTimeline,
    /// Per-example graph accuracy, when requested.
    pub accuracy: Option<Vec<bool>>,
    /// Diagnostics.
    pub info: Info,
}

/// Result of [`Model::eval`].
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// Total loss.
    pub loss: f32,
    /// One flag per example, when requested.
    pub accuracy: Option<Vec<bool>>,
/// Named diagnostics.
    pub info: Info,
}

/// Result of [`Model::infer`].
#[derive(Debug, Clone)]
pub struct Inference {
/// Answer distribution, or hard answer when snapped; `None` without a query head.
    pub output: Option<Tensor>,
/// Graph after every sentence and the query states.
    pub timeline: GraphTimeline,
}

fn expect_dims(what: &'static str, t: &Tensor, expected: &[usize]) -> Result<()> {
    if t.dims() != expected {
        return Err(Error::ShapeMismatch { what, expected: expected.to_vec(), got: t.dims().to_vec() });
    }
    Ok(())
}

/// Repeat each example `times` times along the batch axis, keeping repeats adjacent.
fn repeat_per_timestep(x: &Tensor, times: usize) -> Result<Tensor> {
    let dims = x.dims().to_vec();
    let mut expanded = dims.clone();
    expanded.insert(1, times);
    let mut merged = dims;
    merged[0] *= times;
    Ok(x.unsqueeze(1)?.broadcast_as(expanded)?.contiguous()?.reshape(merged)?)
}

/// Gated graph transformer over sentence sequences.
pub struct Model {
    config: ModelConfig,
    spec: GraphStateSpec,
    device: Device,
    varmap: VarMap,
    encoder: Box<dyn InputEncoder>,
    steps: StepPipeline,
    query: Option<QueryPipeline>,
    rng: StdRng,
}

impl Model {
    /// Validate `config` and create freshly initialized parameters on `device`.
    pub fn new(config: ModelConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let spec = GraphStateSpec::new(config.num_node_ids, config.node_state_size, config.num_edge_types);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let encoder = DirectInputEncoder::new(
            config.num_input_words,
            config.num_node_ids,
            &config.word_node_mapping,
            config.input_repr_size,
            vb.pp("encoder"),
        )?;
        let steps = StepPipeline::build(&config, spec, vb.pp("step"))?;
        let query = if config.train_with_query {
            Some(QueryPipeline::build(&config, spec, vb.pp("query"))?)
        } else {
            None
        };
        log::debug!("model built with {} parameter tensors", varmap.all_vars().len());
        Ok(Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            spec,
            device: device.clone(),
            varmap,
            encoder: Box::new(encoder),
            steps,
            query,
        })
    }

    /// Configuration the model was built from.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Graph sizes.
    pub fn spec(&self) -> GraphStateSpec {
        self.spec
    }

    /// Device holding every parameter.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// All learnable parameters.
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Draw the dropout masks for one training pass.
    ///
    /// One node-state mask is shared by every stage that reads node states.
    pub fn sample_masks(&mut self) -> Result<DropoutMasks> {
        let mut sampler = DropoutSampler::new(self.config.dropout_keep, &mut self.rng, &self.device);
        let states = sampler.mask(self.config.node_state_size)?;
        let steps = self.steps.dropout_masks(&mut sampler, states.as_ref())?;
        let query = match &self.query {
            Some(q) => q.dropout_masks(&mut sampler, states.as_ref())?,
            None => Default::default(),
        };
        Ok(DropoutMasks { steps, query })
    }

    fn check_words(&self, input_words: &Tensor, query_words: &Tensor) -> Result<(usize, usize)> {
        let (b, s, len) = input_words.dims3()?;
        if s == 0 {
            return Err(Error::ShapeMismatch { what: "input_words", expected: vec![b, 1, len], got: vec![b, 0, len] });
        }
        let (qb, qlen) = query_words.dims2()?;
        if qb != b {
            return Err(Error::ShapeMismatch { what: "query_words", expected: vec![b, qlen], got: vec![qb, qlen] });
        }
        Ok((b, s))
    }

    fn check_graph_targets(&self, targets: &GraphTargets, b: usize, s: usize) -> Result<()> {
        let k = self.config.new_nodes_per_iter;
        let pad = self.config.pad_graph_size(s);
        if self.config.dynamic_nodes {
            expect_dims("graph_num_new_nodes", &targets.num_new_nodes, &[b, s])?;
            expect_dims("graph_new_node_strengths", &targets.new_node_strengths, &[b, s, k])?;
            expect_dims("graph_new_node_ids", &targets.new_node_ids, &[b, s, k, self.spec.num_node_ids])?;
        }
        expect_dims("graph_edges", &targets.edges, &[b, s, pad, pad, self.spec.num_edge_types])
    }

    fn check_output(&self, correct: &Tensor, b: usize) -> Result<()> {
        let len = match self.config.output_format {
            OutputFormat::Sequence => correct.dim(1)?,
            OutputFormat::Category | OutputFormat::Subset => 1,
        };
        expect_dims("correct_output", correct, &[b, len, self.config.num_output_words])
    }

    /// Encode every sentence: `(b, S, repr)` and `(b, S, ids, repr)`.
    fn encode_sentences(&self, input_words: &Tensor) -> Result<(Tensor, Tensor)> {
        let (b, s, len) = input_words.dims3()?;
        let flat = input_words.reshape((b * s, len))?;
        let (repr, refs) = self.encoder.process(&flat)?;
        let width = self.encoder.repr_size();
        Ok((
            repr.reshape((b, s, width))?,
            refs.reshape((b, s, self.spec.num_node_ids, width))?,
        ))
    }

    /// Run the whole model once.
    ///
    /// `masks` enables dropout; pass `None` for evaluation and inference.
    pub fn forward(&self, batch: &Batch, mode: Mode, masks: Option<&DropoutMasks>) -> Result<Forward> {
        let check = self.config.check_mode;
        let (b, s) = self.check_words(&batch.input_words, &batch.query_words)?;
        let (reprs, refs) = self.encode_sentences(&batch.input_words)?;
        check_finite(&reprs, "encoder", check)?;
        let no_masks = DropoutMasks::default();
        let masks = masks.unwrap_or(&no_masks);

        let drive = match mode {
            Mode::Supervised { evaluate_accuracy } if self.config.train_with_graph => {
                let targets = batch.graph.as_ref().ok_or(Error::MissingGraphTargets)?;
                self.check_graph_targets(targets, b, s)?;
                Drive::Teacher { targets, evaluate_accuracy }
            }
            Mode::Supervised { .. } => Drive::Free { snap: false },
            Mode::Free { snap, .. } => Drive::Free { snap },
        };
        let initial = if self.config.dynamic_nodes {
            GraphState::create_empty(b, &self.spec, &self.device)?
        } else {
            GraphState::create_full_unique(b, &self.spec, &self.device)?
        };
        let pad = self.config.pad_graph_size(s);
        let unrolled = Recurrence::new(&self.steps, self.config.best_node_match_only, check)
            .run(&initial, pad, &reprs, &refs, drive, &masks.steps)?;

        let mut info = Info::new();
        let mut loss = Tensor::zeros((), DType::F32, &self.device)?;
        let per_example = 1.0 / b as f64;
        let mut graph_loss: Option<Tensor> = None;
        for (name, part) in [("node_loss", &unrolled.node_loss), ("edge_loss", &unrolled.edge_loss)] {
            if let Some(part) = part {
                let reduced = part.sum_all()?.affine(per_example, 0.0)?;
                info.insert(name.to_string(), reduced.to_scalar::<f32>()?);
                graph_loss = Some(match graph_loss {
                    Some(g) => (g + reduced)?,
                    None => reduced,
                });
            }
        }
        if let Some(g) = graph_loss {
            loss = (loss + g.affine(1.0 / s as f64, 0.0)?)?;
        }
        if let Some(accuracy) = &unrolled.accuracy {
            let hits = accuracy.iter().filter(|&&a| a).count();
            info.insert("graph_accuracy".to_string(), hits as f32 / b as f32);
        }

        let steps = unrolled
            .steps
            .iter()
            .map(GraphState::unflatten_from_const_size)
            .collect::<Result<Vec<_>>>()?;
        let mut timeline = GraphTimeline { steps, query: None, propagated: None };

        let output = match &self.query {
            None => None,
            Some(query) => {
                let (query_repr, query_refs) = self.encoder.process(&batch.query_words)?;
                let (final_state, query_repr, query_refs, timesteps) = if self.config.sequence_representation {
                    let merged = FlatGraphState::concat_timesteps(&unrolled.steps)?;
                    (
                        GraphState::unflatten_from_const_size(&merged)?,
                        repeat_per_timestep(&query_repr, s)?,
                        repeat_per_timestep(&query_refs, s)?,
                        s,
                    )
                } else {
                    let last = timeline.steps.last().cloned().ok_or(Error::ShapeMismatch {
                        what: "input_words",
                        expected: vec![b, 1],
                        got: vec![b, 0],
                    })?;
                    (last, query_repr, query_refs, 1)
                };
                let out_len = match (mode, &batch.correct_output) {
                    (Mode::Free { out_len, .. }, _) => out_len,
                    (Mode::Supervised { .. }, Some(correct)) => correct.dim(1)?,
                    (Mode::Supervised { .. }, None) => return Err(Error::MissingQueryTargets),
                };
                let outcome = query.process(&final_state, &query_repr, &query_refs, timesteps, out_len, &masks.query, check)?;
                let output = match mode {
                    Mode::Free { snap: true, .. } => query.head().snap_to_best(&outcome.output)?,
                    _ => outcome.output,
                };
                if let Some(correct) = &batch.correct_output {
                    self.check_output(correct, b)?;
                    let q = query_loss(&output, correct, self.config.output_format)?;
                    info.insert("query_loss".to_string(), q.to_scalar::<f32>()?);
                    loss = (loss + q)?;
                }
                timeline.query = Some(outcome.query);
                timeline.propagated = Some(outcome.propagated);
                Some(output)
            }
        };
        check_finite(&loss, "loss", check)?;
        log::trace!("forward ({mode:?}): {info:?}");
        Ok(Forward { loss, output, timeline, accuracy: unrolled.accuracy, info })
    }

    /// Teacher-forced loss without dropout, optionally with per-example graph accuracy.
    pub fn eval(&self, batch: &Batch, with_accuracy: bool) -> Result<Evaluation> {
        let fwd = self.forward(batch, Mode::Supervised { evaluate_accuracy: with_accuracy }, None)?;
        Ok(Evaluation {
            loss: fwd.loss.to_scalar::<f32>()?,
            accuracy: if with_accuracy { fwd.accuracy } else { None },
            info: fwd.info,
        })
    }

    /// Free-running answer and graph timeline. `out_len` only matters for sequence answers.
    pub fn infer(&self, input_words: &Tensor, query_words: &Tensor, out_len: usize, snap: bool) -> Result<Inference> {
        let batch = Batch::new(input_words.clone(), query_words.clone());
        let fwd = self.forward(&batch, Mode::Free { snap, out_len }, None)?;
        Ok(Inference { output: fwd.output, timeline: fwd.timeline })
    }

    /// The teacher-forced graph after every sentence (and the query states).
    pub fn debug_graphs(&self, batch: &Batch) -> Result<GraphTimeline> {
        Ok(self.forward(batch, Mode::Supervised { evaluate_accuracy: false }, None)?.timeline)
    }
}
