//! Error types for update processing.

use signals_encoding::EncodingError;
use signals_state::StateError;
use thiserror::Error;

pub type UpdateResult<T> = Result<T, UpdateError>;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("couldn't unpack signal updates JSON: {0}")]
    Syntax(String),

    #[error("unknown update operation '{0}'")]
    UnknownOperation(String),

    #[error("collision: multiple operations target the same key in one update (key {key})")]
    Collision { key: String },

    #[error("too many signals: {count} values for key {key} exceed max_signals {max}")]
    TooManySignals { key: String, count: usize, max: usize },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

/// How an update document fared, for accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonProcessingStatus {
    Success,
    /// The document could not be parsed into operations.
    SyntacticError,
    /// Well-formed but invalid (collision, too many values).
    SemanticError,
    OtherError,
}

impl UpdateError {
    pub fn processing_status(&self) -> JsonProcessingStatus {
        match self {
            UpdateError::Syntax(_) | UpdateError::UnknownOperation(_) => {
                JsonProcessingStatus::SyntacticError
            }
            UpdateError::Collision { .. } | UpdateError::TooManySignals { .. } => {
                JsonProcessingStatus::SemanticError
            }
            UpdateError::State(_) | UpdateError::Encoding(_) => JsonProcessingStatus::OtherError,
        }
    }

    /// Whether the caller sent a bad document (as opposed to an internal failure).
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self.processing_status(),
            JsonProcessingStatus::SyntacticError | JsonProcessingStatus::SemanticError
        )
    }
}
