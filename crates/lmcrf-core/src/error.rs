use thiserror::Error;

/// Errors that can occur while batching, scoring or pruning.
///
/// All of these are local to a single batch or step. The training loop
/// decides whether to abort the run or skip the batch.
#[derive(Debug, Error)]
pub enum LmCrfError {
    /// Declared lengths of an instance or tensor disagree with the data.
    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Which array or tensor was being checked.
        context: &'static str,
        /// The length or dimension the invariant requires.
        expected: usize,
        /// The length or dimension actually found.
        actual: usize,
    },

    /// A computed gather index would read outside its source tensor.
    #[error("{context} index {index} out of range for {bound} rows")]
    IndexOutOfRange {
        /// Which index array overflowed.
        context: &'static str,
        /// The offending flattened index.
        index: usize,
        /// Number of addressable rows.
        bound: usize,
    },

    /// A log-space computation produced a non-finite value.
    #[error("numerical instability in {0}: non-finite value")]
    NumericalInstability(&'static str),

    /// A batch with no instances reached an operation that needs at least one.
    #[error("empty batch")]
    EmptyBatch,

    /// An instance without words reached batch assembly.
    #[error("instance {0} has no words")]
    EmptySequence(usize),

    /// Configuration values are inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Candle tensor error.
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, LmCrfError>;
