//! Signals script engine.
//!
//! Marshals signals into the driver's argument format, runs the composed
//! program in the sandbox, and turns the `{status, results}` envelope into
//! payload bytes. Payload size is not checked here; callers enforce their
//! own limit.

use std::sync::Arc;

use signals_core::KeyFormat;
use signals_state::Signal;
use tracing::debug;

use crate::argument::{SignalsArgument, render_signals};
use crate::driver::{ENTRY_POINT, MAX_SIZE_ARG, SIGNALS_ARG, compose_program};
use crate::error::{ScriptError, ScriptResult};
use crate::hex_codec::hex_to_binary;
use crate::sandbox::{IsolateSettings, NamedArgument, ScriptSandbox};

/// Status an encoder returns on success.
pub const STATUS_SUCCESS: i64 = 0;

#[derive(Clone)]
pub struct SignalsScriptEngine {
    sandbox: Arc<dyn ScriptSandbox>,
    settings: IsolateSettings,
    format: KeyFormat,
}

impl SignalsScriptEngine {
    pub fn new(sandbox: Arc<dyn ScriptSandbox>, settings: IsolateSettings, format: KeyFormat) -> Self {
        Self {
            sandbox,
            settings,
            format,
        }
    }

    pub fn format(&self) -> KeyFormat {
        self.format
    }

    /// Encode `signals` with `encoder_program`, passing it a size limit
    /// of `max_size` bytes.
    pub async fn encode_signals(
        &self,
        encoder_program: &str,
        signals: &[Signal],
        max_size: usize,
    ) -> ScriptResult<Vec<u8>> {
        let argument = render_signals(signals, self.format);
        self.encode_argument(encoder_program, &argument, max_size).await
    }

    /// Same as [`encode_signals`](Self::encode_signals) for an already rendered argument.
    pub async fn encode_argument(
        &self,
        encoder_program: &str,
        argument: &SignalsArgument,
        max_size: usize,
    ) -> ScriptResult<Vec<u8>> {
        let program = compose_program(encoder_program, self.format);
        let args = [
            NamedArgument::new(SIGNALS_ARG, argument.to_json()?),
            NamedArgument::new(MAX_SIZE_ARG, max_size.to_string()),
        ];

        let output = self
            .sandbox
            .evaluate(&program, &args, ENTRY_POINT, &self.settings)
            .await
            .map_err(|e| ScriptError::Sandbox(format!("{e:#}")))?;

        let payload = handle_encoding_output(&output)?;
        debug!(keys = argument.len(), size = payload.len(), "signals encoded");
        Ok(payload)
    }
}

/// Validate the sandbox's `{status, results}` envelope and decode the payload.
pub fn handle_encoding_output(output: &str) -> ScriptResult<Vec<u8>> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Err(ScriptError::EmptyResult);
    }

    let value: serde_json::Value =
        serde_json::from_str(trimmed).map_err(|e| ScriptError::MalformedOutput(e.to_string()))?;
    let envelope = match value {
        serde_json::Value::Null => return Err(ScriptError::EmptyResult),
        serde_json::Value::Object(map) => map,
        other => {
            return Err(ScriptError::MalformedOutput(format!(
                "expected an object, got {other}"
            )));
        }
    };

    let status = envelope
        .get("status")
        .and_then(serde_json::Value::as_i64)
        .ok_or_else(|| ScriptError::MalformedOutput("missing numeric 'status'".to_string()))?;
    let results = envelope
        .get("results")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| ScriptError::MalformedOutput("missing string 'results'".to_string()))?;

    if status != STATUS_SUCCESS {
        return Err(ScriptError::NonZeroStatus {
            status,
            results: results.to_string(),
        });
    }

    hex_to_binary(results).map_err(|e| ScriptError::InvalidPayload(e.to_string()))
}
