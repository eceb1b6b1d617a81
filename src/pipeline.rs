//! Static assembly of the enabled transformations.
//!
//! Which sub-transformations exist is decided once, from the
//! [`ModelConfig`], when the model is built. The recurrence then walks a fixed
//! list of [`Stage`]s per sentence and the query phase runs a fixed
//! [`QueryPipeline`]; nothing re-reads the configuration flags at run time.

use candle_core::{Tensor, D};
use candle_nn::VarBuilder;

use crate::config::{CheckMode, ModelConfig};
use crate::dropout::{DropoutSampler, StageMasks};
use crate::error::Result;
use crate::graph_state::{GraphState, GraphStateSpec};
use crate::numeric::check_finite;
use crate::transform::aggregate::{AggregateActivation, AggregateRepresentation};
use crate::transform::direct_reference::DirectReferenceUpdate;
use crate::transform::edge_update::EdgeStateUpdate;
use crate::transform::new_nodes::NewNodesInform;
use crate::transform::node_update::NodeStateUpdate;
use crate::transform::output::OutputHead;
use crate::transform::propagation::PropagationTransformation;
use crate::transform::summary::SequenceAggregateSummary;

/// One per-sentence stage.
#[derive(Debug, Clone)]
pub enum Stage {
    /// Node states read the sentence representation.
    UpdateNodes(NodeStateUpdate),
    /// Node states read the words that name them directly.
    DirectReference(DirectReferenceUpdate),
    /// Message passing along the current edges.
    Propagate {
        /// The propagation parameters.
        transform: PropagationTransformation,
        /// Rounds per sentence.
        iterations: usize,
    },
    /// Candidate new nodes.
    ProposeNodes(NewNodesInform),
    /// Edge add/clear gates.
    UpdateEdges(EdgeStateUpdate),
}

impl Stage {
    /// Short name used in logs and numerical check failures.
    pub fn name(&self) -> &'static str {
        match self {
            Self::UpdateNodes(_) => "update_nodes",
            Self::DirectReference(_) => "direct_reference",
            Self::Propagate { .. } => "propagate",
            Self::ProposeNodes(_) => "propose_nodes",
            Self::UpdateEdges(_) => "update_edges",
        }
    }

    fn dropout_masks(&self, sampler: &mut DropoutSampler, states: Option<&Tensor>) -> Result<StageMasks> {
        match self {
            Self::UpdateNodes(t) => t.dropout_masks(sampler, states),
            Self::DirectReference(t) => t.dropout_masks(sampler, states),
            Self::Propagate { transform, .. } => transform.dropout_masks(sampler, states),
            Self::ProposeNodes(t) => t.dropout_masks(sampler),
            Self::UpdateEdges(t) => t.dropout_masks(sampler),
        }
    }
}

fn aggregate_activation(config: &ModelConfig) -> AggregateActivation {
    if config.use_old_aggregate {
        AggregateActivation::Softmax
    } else {
        AggregateActivation::Tanh
    }
}

/// The per-sentence stages, in execution order.
#[derive(Debug, Clone)]
pub struct StepPipeline {
    stages: Vec<Stage>,
}

impl StepPipeline {
    /// Assemble the stages enabled by `config`.
    pub fn build(config: &ModelConfig, spec: GraphStateSpec, vb: VarBuilder) -> Result<Self> {
        let mut stages = Vec::new();
        if config.nodes_mutable {
            stages.push(Stage::UpdateNodes(NodeStateUpdate::new(
                config.input_repr_size,
                spec,
                vb.pp("node_state_update"),
            )?));
        }
        if config.has_direct_references() {
            stages.push(Stage::DirectReference(DirectReferenceUpdate::new(
                config.input_repr_size,
                spec,
                vb.pp("direct_reference_update"),
            )?));
        }
        if config.intermediate_propagate > 0 {
            stages.push(Stage::Propagate {
                transform: PropagationTransformation::new(config.propagate_repr_size, spec, vb.pp("intermediate_propagate"))?,
                iterations: config.intermediate_propagate,
            });
        }
        if config.dynamic_nodes {
            stages.push(Stage::ProposeNodes(NewNodesInform::new(
                config.input_repr_size,
                config.propose_repr_size,
                config.new_nodes_per_iter,
                spec,
                aggregate_activation(config),
                vb.pp("new_nodes"),
            )?));
        }
        stages.push(Stage::UpdateEdges(EdgeStateUpdate::new(config.input_repr_size, spec, vb.pp("edge_update"))?));

        let names: Vec<&str> = stages.iter().map(Stage::name).collect();
        log::debug!("step pipeline: {}", names.join(" -> "));
        Ok(Self { stages })
    }

    /// Stages in execution order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// One mask set per stage, in stage order.
    pub fn dropout_masks(&self, sampler: &mut DropoutSampler, states: Option<&Tensor>) -> Result<Vec<StageMasks>> {
        self.stages.iter().map(|s| s.dropout_masks(sampler, states)).collect()
    }
}

/// Masks for the query phase.
#[derive(Debug, Clone, Default)]
pub struct QueryMasks {
    /// Query node-state update.
    pub update: StageMasks,
    /// Query direct-reference update.
    pub reference: StageMasks,
    /// Final propagation.
    pub propagate: StageMasks,
    /// Graph readout.
    pub aggregate: StageMasks,
    /// Timestep summary.
    pub summary: StageMasks,
}

/// Every dropout mask used by one forward pass.
#[derive(Debug, Clone, Default)]
pub struct DropoutMasks {
    /// Per-sentence stage masks, aligned with [`StepPipeline::stages`]; empty means none.
    pub steps: Vec<StageMasks>,
    /// Query-phase masks.
    pub query: QueryMasks,
}

/// What the query phase produced.
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    /// State after the query update (and query direct references).
    pub query: GraphState,
    /// State after final propagation.
    pub propagated: GraphState,
    /// Answer distribution `(b, len, num_output_words)`.
    pub output: Tensor,
}

/// Query update, final propagation, readout and answer head.
#[derive(Debug, Clone)]
pub struct QueryPipeline {
    wipe_node_state: bool,
    update: NodeStateUpdate,
    reference: Option<DirectReferenceUpdate>,
    propagate: PropagationTransformation,
    iterations: usize,
    aggregate: AggregateRepresentation,
    summary: Option<SequenceAggregateSummary>,
    head: OutputHead,
}

impl QueryPipeline {
    /// Query-phase parameters under `vb`.
    pub fn build(config: &ModelConfig, spec: GraphStateSpec, vb: VarBuilder) -> Result<Self> {
        let reference = if config.has_direct_references() {
            Some(DirectReferenceUpdate::new(config.input_repr_size, spec, vb.pp("query_direct_reference_update"))?)
        } else {
            None
        };
        let summary = if config.sequence_representation {
            Some(SequenceAggregateSummary::new(
                config.output_repr_size,
                config.output_repr_size,
                vb.pp("aggregate_summary"),
            )?)
        } else {
            None
        };
        let pipeline = Self {
            wipe_node_state: config.wipe_node_state,
            update: NodeStateUpdate::new(config.input_repr_size, spec, vb.pp("query_node_state_update"))?,
            reference,
            propagate: PropagationTransformation::new(config.propagate_repr_size, spec, vb.pp("final_propagate"))?,
            iterations: config.final_propagate,
            aggregate: AggregateRepresentation::new(
                config.output_repr_size,
                spec,
                aggregate_activation(config),
                vb.pp("aggregate"),
            )?,
            summary,
            head: OutputHead::new(config.output_format, config.output_repr_size, config.num_output_words, vb.pp("output"))?,
        };
        log::debug!(
            "query pipeline: wipe={} reference={} propagate={} summary={} output={:?}",
            pipeline.wipe_node_state,
            pipeline.reference.is_some(),
            pipeline.iterations,
            pipeline.summary.is_some(),
            pipeline.head.format(),
        );
        Ok(pipeline)
    }

    /// The answer head.
    pub fn head(&self) -> &OutputHead {
        &self.head
    }

    /// Masks for every query stage, reusing the shared `states` mask.
    pub fn dropout_masks(&self, sampler: &mut DropoutSampler, states: Option<&Tensor>) -> Result<QueryMasks> {
        Ok(QueryMasks {
            update: self.update.dropout_masks(sampler, states)?,
            reference: match &self.reference {
                Some(r) => r.dropout_masks(sampler, states)?,
                None => StageMasks::default(),
            },
            propagate: self.propagate.dropout_masks(sampler, states)?,
            aggregate: self.aggregate.dropout_masks(sampler)?,
            summary: match &self.summary {
                Some(s) => s.dropout_masks(sampler)?,
                None => StageMasks::default(),
            },
        })
    }

    /// Answer a query against `gstate`.
    ///
    /// With a timestep summary, `gstate` holds `b * timesteps` graphs ordered
    /// batch-major and `query_repr` / `query_refs` are already repeated to match.
    #[allow(clippy::too_many_arguments)]
    pub fn process(
        &self,
        gstate: &GraphState,
        query_repr: &Tensor,
        query_refs: &Tensor,
        timesteps: usize,
        out_len: usize,
        masks: &QueryMasks,
        check: CheckMode,
    ) -> Result<QueryOutcome> {
        let mut g = gstate.clone();
        if self.wipe_node_state {
            g = g.with_node_states(g.node_states().zeros_like()?)?;
        }
        g = self.update.process(&g, query_repr, &masks.update)?;
        if let Some(reference) = &self.reference {
            g = reference.process(&g, query_refs, &masks.reference)?;
        }
        check_finite(g.node_states(), "query_update", check)?;
        let query = g.clone();

        let propagated = self.propagate.process_multiple(&g, self.iterations, &masks.propagate)?;
        check_finite(propagated.node_states(), "final_propagate", check)?;

        let mut repr = self.aggregate.process(&propagated, &masks.aggregate)?;
        if let Some(summary) = &self.summary {
            let width = repr.dim(D::Minus1)?;
            let b = repr.dim(0)? / timesteps.max(1);
            let sequence = repr.reshape((b, timesteps.max(1), width))?;
            repr = summary.process(&sequence, &masks.summary)?;
        }
        check_finite(&repr, "aggregate", check)?;

        let output = self.head.process(&repr, out_len)?;
        check_finite(&output, "output", check)?;
        Ok(QueryOutcome { query, propagated, output })
    }
}
