//! Model configuration.
//!
//! Every boolean and count here selects which stages exist in the assembled
//! model; none of them is consulted as a runtime flag after construction.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Largest supported `new_nodes_per_iter`: node matching enumerates all `k!` orderings.
pub const MAX_NEW_NODES_PER_ITER: usize = 6;

/// Shape of the query answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// One distribution over the output vocabulary.
    Category,
    /// Independent per-word membership probabilities.
    Subset,
    /// A decoded sequence of distributions of caller-specified length.
    Sequence,
}

/// Strict numerical checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckMode {
    /// No checking.
    #[default]
    Off,
    /// Abort on the first NaN or infinity, naming the stage that produced it.
    Nan,
}

/// Construction-time configuration of a [`crate::model::Model`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Input vocabulary size (word 0 is padding).
    pub num_input_words: usize,
    /// Output vocabulary size.
    pub num_output_words: usize,
    /// Number of distinct node identities.
    pub num_node_ids: usize,
    /// Width of the continuous per-node state.
    pub node_state_size: usize,
    /// Number of edge types.
    pub num_edge_types: usize,
    /// Width of the encoded sentence representation.
    pub input_repr_size: usize,
    /// Width of the aggregated graph representation fed to the output head.
    pub output_repr_size: usize,
    /// Width of the new-node proposal representation.
    pub propose_repr_size: usize,
    /// Width of propagation messages.
    pub propagate_repr_size: usize,
    /// Candidate node slots proposed per sentence.
    pub new_nodes_per_iter: usize,
    /// Shape of the query answer.
    pub output_format: OutputFormat,
    /// Propagation iterations at query time.
    pub final_propagate: usize,
    /// Propagation iterations after every sentence (0 disables the stage).
    pub intermediate_propagate: usize,
    /// Words that directly name a node id.
    pub word_node_mapping: BTreeMap<u32, u32>,
    /// Create nodes while reading; otherwise every id exists from the start.
    pub dynamic_nodes: bool,
    /// Update node states from each sentence.
    pub nodes_mutable: bool,
    /// Zero node states before the query is applied.
    pub wipe_node_state: bool,
    /// Train node matching on the best ordering only.
    pub best_node_match_only: bool,
    /// Answer from every intermediate graph instead of the last one.
    pub sequence_representation: bool,
    /// Dropout keep probability; 1 disables dropout.
    pub dropout_keep: f64,
    /// Use the softmax-activation aggregator.
    pub use_old_aggregate: bool,
    /// Include the graph-construction loss.
    pub train_with_graph: bool,
    /// Include the query-answer loss.
    pub train_with_query: bool,
    /// Strict numerical checking.
    pub check_mode: CheckMode,
    /// Initial learning rate for the optimizer.
    pub learning_rate: f64,
    /// Seed of the dropout mask generator.
    ///
    /// Parameter initialization draws from the device generator and is not
    /// covered: two models built from one config share masks, not weights.
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            num_input_words: 32,
            num_output_words: 8,
            num_node_ids: 8,
            node_state_size: 16,
            num_edge_types: 2,
            input_repr_size: 32,
            output_repr_size: 32,
            propose_repr_size: 32,
            propagate_repr_size: 32,
            new_nodes_per_iter: 3,
            output_format: OutputFormat::Category,
            final_propagate: 1,
            intermediate_propagate: 0,
            word_node_mapping: BTreeMap::new(),
            dynamic_nodes: true,
            nodes_mutable: true,
            wipe_node_state: true,
            best_node_match_only: true,
            sequence_representation: false,
            dropout_keep: 1.0,
            use_old_aggregate: false,
            train_with_graph: true,
            train_with_query: true,
            check_mode: CheckMode::Off,
            learning_rate: 0.0002,
            seed: 42,
        }
    }
}

impl ModelConfig {
    /// Input and output vocabulary sizes.
    pub fn with_vocab(mut self, num_input_words: usize, num_output_words: usize) -> Self {
        self.num_input_words = num_input_words;
        self.num_output_words = num_output_words;
        self
    }

    /// Node identity count, node state width and edge type count.
    pub fn with_graph_spec(mut self, num_node_ids: usize, node_state_size: usize, num_edge_types: usize) -> Self {
        self.num_node_ids = num_node_ids;
        self.node_state_size = node_state_size;
        self.num_edge_types = num_edge_types;
        self
    }

    /// Set every intermediate representation width at once.
    pub fn with_repr_size(mut self, width: usize) -> Self {
        self.input_repr_size = width;
        self.output_repr_size = width;
        self.propose_repr_size = width;
        self.propagate_repr_size = width;
        self
    }

    /// Candidate node slots proposed per sentence.
    pub fn with_new_nodes_per_iter(mut self, k: usize) -> Self {
        self.new_nodes_per_iter = k;
        self
    }

    /// Answer shape.
    pub fn with_output_format(mut self, format: OutputFormat) -> Self {
        self.output_format = format;
        self
    }

    /// Propagation rounds after every sentence and after the query.
    pub fn with_propagation(mut self, intermediate: usize, final_iterations: usize) -> Self {
        self.intermediate_propagate = intermediate;
        self.final_propagate = final_iterations;
        self
    }

    /// Words that name a node id directly.
    pub fn with_word_node_mapping(mut self, mapping: BTreeMap<u32, u32>) -> Self {
        self.word_node_mapping = mapping;
        self
    }

    /// Grow the graph from empty instead of one fixed node per id.
    pub fn with_dynamic_nodes(mut self, dynamic: bool) -> Self {
        self.dynamic_nodes = dynamic;
        self
    }

    /// Score only the most likely node assignment instead of all of them.
    pub fn with_best_node_match_only(mut self, best_only: bool) -> Self {
        self.best_node_match_only = best_only;
        self
    }

    /// Answer from every sentence prefix, summarized over time.
    pub fn with_sequence_representation(mut self, enabled: bool) -> Self {
        self.sequence_representation = enabled;
        self
    }

    /// Keep probability; `1.0` disables dropout.
    pub fn with_dropout_keep(mut self, keep: f64) -> Self {
        self.dropout_keep = keep;
        self
    }

    /// Softmax readout candidates instead of tanh.
    pub fn with_old_aggregate(mut self, old: bool) -> Self {
        self.use_old_aggregate = old;
        self
    }

    /// Which loss terms are trained: graph construction, query answer.
    pub fn with_training(mut self, with_graph: bool, with_query: bool) -> Self {
        self.train_with_graph = with_graph;
        self.train_with_query = with_query;
        self
    }

    /// Strict numerical checking.
    pub fn with_check_mode(mut self, mode: CheckMode) -> Self {
        self.check_mode = mode;
        self
    }

    /// Initial optimizer learning rate.
    pub fn with_learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    /// Seed of the dropout mask generator.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Whether any word names a node directly (enables the direct-reference stages).
    pub fn has_direct_references(&self) -> bool {
        !self.word_node_mapping.is_empty()
    }

    /// Fixed node capacity of the loop-carried graph for `n_sentences` sentences.
    ///
    /// Dynamic graphs reserve one extra always-empty slot.
    pub fn pad_graph_size(&self, n_sentences: usize) -> usize {
        if self.dynamic_nodes {
            n_sentences * self.new_nodes_per_iter + 1
        } else {
            self.num_node_ids
        }
    }

    /// Reject inconsistent configurations before anything is built.
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("num_input_words", self.num_input_words),
            ("num_output_words", self.num_output_words),
            ("num_node_ids", self.num_node_ids),
            ("node_state_size", self.node_state_size),
            ("num_edge_types", self.num_edge_types),
            ("input_repr_size", self.input_repr_size),
            ("output_repr_size", self.output_repr_size),
            ("propose_repr_size", self.propose_repr_size),
            ("propagate_repr_size", self.propagate_repr_size),
        ];
        for (name, v) in sizes {
            if v == 0 {
                return Err(Error::InvalidConfig(format!("{name} must be positive")));
            }
        }
        if self.dynamic_nodes
            && (self.new_nodes_per_iter == 0 || self.new_nodes_per_iter > MAX_NEW_NODES_PER_ITER)
        {
            return Err(Error::InvalidConfig(format!(
                "new_nodes_per_iter must be in 1..={MAX_NEW_NODES_PER_ITER}, got {}",
                self.new_nodes_per_iter
            )));
        }
        if !(self.dropout_keep > 0.0 && self.dropout_keep <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "dropout_keep must be in (0, 1], got {}",
                self.dropout_keep
            )));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(Error::InvalidConfig(format!(
                "learning_rate must be positive and finite, got {}",
                self.learning_rate
            )));
        }
        for (&word, &node) in &self.word_node_mapping {
            if word as usize >= self.num_input_words || node as usize >= self.num_node_ids {
                return Err(Error::InvalidConfig(format!(
                    "word_node_mapping entry {word} -> {node} is out of range"
                )));
            }
        }
        if !self.train_with_graph && !self.train_with_query {
            return Err(Error::InvalidConfig(
                "at least one of train_with_graph and train_with_query must be set".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        ModelConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_too_many_new_nodes() {
        let c = ModelConfig::default().with_new_nodes_per_iter(MAX_NEW_NODES_PER_ITER + 1);
        assert!(matches!(c.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn rejects_out_of_range_word_mapping() {
        let c = ModelConfig::default()
            .with_graph_spec(4, 8, 1)
            .with_word_node_mapping(BTreeMap::from([(3, 4)]));
        assert!(matches!(c.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn rejects_bad_dropout_and_empty_objective() {
        assert!(ModelConfig::default().with_dropout_keep(0.0).validate().is_err());
        assert!(ModelConfig::default().with_dropout_keep(1.5).validate().is_err());
        assert!(ModelConfig::default().with_training(false, false).validate().is_err());
    }

    #[test]
    fn pad_size_reserves_an_extra_slot_for_dynamic_graphs() {
        let c = ModelConfig::default().with_new_nodes_per_iter(2);
        assert_eq!(c.pad_graph_size(5), 11);
        let c = c.with_dynamic_nodes(false).with_graph_spec(7, 4, 1);
        assert_eq!(c.pad_graph_size(5), 7);
    }

    #[test]
    fn json_fills_missing_fields_from_defaults() {
        let c: ModelConfig =
            serde_json::from_str(r#"{"num_node_ids": 5, "output_format": "subset", "check_mode": "nan"}"#)
                .unwrap();
        assert_eq!(c.num_node_ids, 5);
        assert_eq!(c.output_format, OutputFormat::Subset);
        assert_eq!(c.check_mode, CheckMode::Nan);
        assert_eq!(c.new_nodes_per_iter, ModelConfig::default().new_nodes_per_iter);
    }

    #[test]
    fn unknown_output_format_fails_to_load() {
        let r: std::result::Result<ModelConfig, _> = serde_json::from_str(r#"{"output_format": "tree"}"#);
        assert!(r.is_err());
    }
}
