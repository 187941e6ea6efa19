//! `put`: replace every signal under a key.
//!
//! ```text
//! {"put": {"<b64 key>": "<b64 value>"}}
//! {"put": {"<b64 key>": [{"val": "<b64 value>"}, ...]}}
//! ```

use serde_json::Value;
use signals_state::PendingSignal;

use super::{UpdateOperation, decode_base64, expect_base64_string, expect_object};
use crate::error::{UpdateError, UpdateResult};
use crate::output::{CurrentSignals, UpdateOutput};

pub(super) fn process(value: &Value, current: &CurrentSignals) -> UpdateResult<UpdateOutput> {
    let mut output = UpdateOutput::default();
    for (encoded_key, values) in expect_object(value, UpdateOperation::Put)? {
        let key = decode_base64(encoded_key, "put key")?;
        for value in put_values(values)? {
            output.to_add.push(PendingSignal::new(key.clone(), value));
        }
        for existing in current.get(&key) {
            output.remove(existing.clone());
        }
        output.keys_touched.insert(key);
    }
    Ok(output)
}

fn put_values(values: &Value) -> UpdateResult<Vec<Vec<u8>>> {
    match values {
        Value::String(_) => Ok(vec![expect_base64_string(values, "put value")?]),
        Value::Array(records) => records
            .iter()
            .map(|record| match record {
                Value::Object(fields) => fields
                    .get("val")
                    .ok_or_else(|| UpdateError::Syntax("put record is missing 'val'".to_string()))
                    .and_then(|val| expect_base64_string(val, "put value")),
                other => expect_base64_string(other, "put value"),
            })
            .collect(),
        _ => Err(UpdateError::Syntax(
            "put value must be a base64 string or an array of records".to_string(),
        )),
    }
}
