//! Error types for the encoding pipeline.

use std::time::Duration;

use signals_script::ScriptError;
use signals_state::StateError;
use thiserror::Error;

pub type EncodingResult<T> = Result<T, EncodingError>;

#[derive(Debug, Error)]
pub enum EncodingError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error("encoding timed out after {0:?}")]
    Timeout(Duration),

    #[error("encoded payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("no encoder program stored for {0}")]
    MissingProgram(String),

    #[error("encoding run failed: {0}")]
    RunFailed(String),
}
