//! Gated graph transformer networks.
//!
//! A model reads a story one sentence at a time and maintains a soft graph:
//! nodes with existence strengths in \([0,1]\), soft identities, continuous
//! states, and typed directed edges with strengths in \([0,1]\). Each sentence
//! updates node states, may propose new nodes and rewrites edges; a query is
//! then answered from an attention readout of the final graph.
//!
//! Training supervises graph construction directly: proposed nodes are matched
//! to ground truth with a permutation-invariant likelihood ([`matching`]) and
//! the ground truth is substituted before the next sentence.
//!
//! Public invariants (must not change):
//! - Graph states are values; every transformation returns a new state.
//! - Absent nodes (strength 0) contribute exactly 0 to every loss term.
//! - Dropout masks are drawn once per forward pass from a seeded generator.
//! - Configuration is validated before any parameter is created.

pub mod config;
pub mod dropout;
pub mod encoder;
pub mod error;
pub mod graph_state;
pub mod matching;
pub mod model;
pub mod numeric;
pub mod pipeline;
pub mod train;
pub mod transform;
pub mod unroll;

pub use config::{CheckMode, ModelConfig, OutputFormat, MAX_NEW_NODES_PER_ITER};
pub use error::{Error, Result};
pub use graph_state::{FlatGraphState, GraphState, GraphStateSpec, GraphUpdate};
pub use model::{Batch, Evaluation, Forward, GraphTargets, GraphTimeline, Inference, Info, Mode, Model};
pub use pipeline::DropoutMasks;
pub use train::Trainer;
