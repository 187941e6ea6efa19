//! Error types for the script engine.

use thiserror::Error;

pub type ScriptResult<T> = Result<T, ScriptError>;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error(
        "the encoding script either doesn't contain the required function or the function returned null"
    )]
    EmptyResult,

    #[error("exception processing result from encoding: {0}")]
    MalformedOutput(String),

    #[error("encoding script failed with status '{status}' or returned unexpected result '{results}'")]
    NonZeroStatus { status: i64, results: String },

    #[error("encoding script returned a malformed hex payload: {0}")]
    InvalidPayload(String),

    #[error("sandbox failure: {0}")]
    Sandbox(String),

    #[error("failed to marshal signals: {0}")]
    Marshal(String),
}

/// Coarse classification used for failure accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptFailureClass {
    /// Nothing usable came back.
    Syntax,
    /// The script reported failure through its status.
    Semantic,
    /// Success status but the payload could not be decoded.
    InvalidPayload,
    /// The sandbox itself failed (crash, spawn failure, marshaling).
    Sandbox,
}

impl ScriptError {
    pub fn failure_class(&self) -> ScriptFailureClass {
        match self {
            ScriptError::EmptyResult | ScriptError::MalformedOutput(_) => ScriptFailureClass::Syntax,
            ScriptError::NonZeroStatus { .. } => ScriptFailureClass::Semantic,
            ScriptError::InvalidPayload(_) => ScriptFailureClass::InvalidPayload,
            ScriptError::Sandbox(_) | ScriptError::Marshal(_) => ScriptFailureClass::Sandbox,
        }
    }
}
