//! Error types for the Kolosal progressive architecture search

use thiserror::Error;

/// Result type alias for search operations
pub type Result<T> = std::result::Result<T, KolosalError>;

/// Main error type for the search engine
#[derive(Error, Debug)]
pub enum KolosalError {
    #[error("Invalid token {token} at position {position}: expected a value below {cardinality}")]
    InvalidToken {
        position: usize,
        token: usize,
        cardinality: usize,
    },

    #[error("Invalid sequence length {length}: must be a multiple of {tokens_per_block} covering at most {max_blocks} blocks")]
    InvalidSequenceLength {
        length: usize,
        tokens_per_block: usize,
        max_blocks: usize,
    },

    #[error("Candidate training failed: {0}")]
    CandidateTraining(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Controller state error: {0}")]
    ControllerState(String),

    #[error("Data error: {0}")]
    DataError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid shape: expected {expected}, got {actual}")]
    ShapeError { expected: String, actual: String },
}

impl KolosalError {
    /// Whether the error may be absorbed by the candidate that caused it.
    ///
    /// Everything else indicates a broken invariant or a bad setup and must
    /// abort the run.
    pub fn is_candidate_local(&self) -> bool {
        matches!(self, KolosalError::CandidateTraining(_) | KolosalError::ShapeError { .. })
    }
}

impl From<serde_json::Error> for KolosalError {
    fn from(err: serde_json::Error) -> Self {
        KolosalError::SerializationError(err.to_string())
    }
}

impl From<ndarray::ShapeError> for KolosalError {
    fn from(err: ndarray::ShapeError) -> Self {
        KolosalError::ShapeError {
            expected: "valid shape".to_string(),
            actual: err.to_string(),
        }
    }
}
