//! `update_encoder`: register (or re-register) the buyer's encoder endpoint.
//!
//! ```text
//! {"update_encoder": {"action": "REGISTER", "endpoint": "https://..."}}
//! {"update_encoder": {}}
//! ```

use serde_json::Value;

use super::{UpdateOperation, expect_object};
use crate::error::{UpdateError, UpdateResult};
use crate::output::{EncoderEvent, UpdateOutput};

pub(super) fn process(value: &Value) -> UpdateResult<UpdateOutput> {
    let fields = expect_object(value, UpdateOperation::UpdateEncoder)?;
    let mut output = UpdateOutput::default();
    if fields.is_empty() {
        return Ok(output);
    }

    let action = fields
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| UpdateError::Syntax("update_encoder needs an 'action'".to_string()))?;
    if !action.eq_ignore_ascii_case("register") {
        return Err(UpdateError::Syntax(format!(
            "unsupported update_encoder action '{action}'"
        )));
    }

    let endpoint = fields
        .get("endpoint")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|endpoint| !endpoint.is_empty())
        .ok_or_else(|| UpdateError::Syntax("update_encoder needs an 'endpoint'".to_string()))?;

    output.encoder_event = Some(EncoderEvent::Register {
        endpoint: endpoint.to_string(),
    });
    Ok(output)
}
