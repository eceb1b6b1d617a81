//! Error types for graph construction, scoring and training.

/// Errors raised by the model and its transformations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Tensor operation failed (shape/contract violation or backend failure).
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Configuration rejected before any parameter was created.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// An input tensor does not agree with the configuration or with the other inputs.
    #[error("shape mismatch for {what}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        /// Which input or intermediate value disagreed.
        what: &'static str,
        /// Expected dimensions.
        expected: Vec<usize>,
        /// Dimensions actually received.
        got: Vec<usize>,
    },

    /// A word id is outside the input vocabulary.
    #[error("word id {word} is outside the vocabulary of {vocab} words")]
    WordOutOfRange {
        /// The offending word id.
        word: u32,
        /// Vocabulary size.
        vocab: usize,
    },

    /// A supervised call was made without ground-truth graph data.
    #[error("graph targets are required when training with the graph")]
    MissingGraphTargets,

    /// A query loss was requested but no output targets were given.
    #[error("output targets are required when training with the query")]
    MissingQueryTargets,

    /// Strict numerical checking found a NaN or infinity.
    #[error("non-finite value produced by {op}")]
    NonFinite {
        /// Name of the stage whose output was not finite.
        op: &'static str,
    },
}

/// Convenience result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
