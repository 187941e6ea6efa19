//! `append`: add values under a key, keeping at most `max_signals` of them.
//!
//! ```text
//! {"append": {"<b64 key>": {"values": ["<b64 value>", ...], "max_signals": 3}}}
//! ```
//!
//! When existing plus new values exceed `max_signals`, the oldest existing
//! values go. Appending more values than `max_signals` in one go is rejected.

use serde_json::Value;
use signals_state::PendingSignal;

use super::{UpdateOperation, decode_base64, expect_base64_string, expect_object};
use crate::error::{UpdateError, UpdateResult};
use crate::output::{CurrentSignals, UpdateOutput};

pub(super) fn process(value: &Value, current: &CurrentSignals) -> UpdateResult<UpdateOutput> {
    let mut output = UpdateOutput::default();
    for (encoded_key, entry) in expect_object(value, UpdateOperation::Append)? {
        let key = decode_base64(encoded_key, "append key")?;
        let entry = entry
            .as_object()
            .ok_or_else(|| UpdateError::Syntax("append entry must be an object".to_string()))?;

        let max_signals = entry
            .get("max_signals")
            .and_then(Value::as_u64)
            .filter(|&max| max > 0)
            .ok_or_else(|| {
                UpdateError::Syntax("append entry needs a positive 'max_signals'".to_string())
            })? as usize;
        let values = entry
            .get("values")
            .and_then(Value::as_array)
            .ok_or_else(|| UpdateError::Syntax("append entry needs a 'values' array".to_string()))?
            .iter()
            .map(|value| expect_base64_string(value, "append value"))
            .collect::<UpdateResult<Vec<_>>>()?;

        if values.len() > max_signals {
            return Err(UpdateError::TooManySignals {
                key: hex::encode_upper(&key),
                count: values.len(),
                max: max_signals,
            });
        }

        let mut existing = current.get(&key);
        existing.sort_by_key(|signal| (signal.creation_time, signal.id));
        let overflow = (existing.len() + values.len()).saturating_sub(max_signals);
        for oldest in existing.into_iter().take(overflow) {
            output.remove(oldest.clone());
        }

        for value in values {
            output.to_add.push(PendingSignal::new(key.clone(), value));
        }
        output.keys_touched.insert(key);
    }
    Ok(output)
}
