//! `remove`: delete every signal under the listed keys.
//!
//! ```text
//! {"remove": ["<b64 key>", ...]}
//! {"remove": {"<b64 key>": <ignored>, ...}}
//! ```

use serde_json::Value;

use super::decode_base64;
use crate::error::{UpdateError, UpdateResult};
use crate::output::{CurrentSignals, UpdateOutput};

pub(super) fn process(value: &Value, current: &CurrentSignals) -> UpdateResult<UpdateOutput> {
    let encoded_keys: Vec<&str> = match value {
        Value::Array(keys) => keys
            .iter()
            .map(|key| {
                key.as_str()
                    .ok_or_else(|| UpdateError::Syntax("remove keys must be strings".to_string()))
            })
            .collect::<UpdateResult<_>>()?,
        Value::Object(keys) => keys.keys().map(String::as_str).collect(),
        _ => {
            return Err(UpdateError::Syntax(
                "'remove' expects an array of keys".to_string(),
            ));
        }
    };

    let mut output = UpdateOutput::default();
    for encoded_key in encoded_keys {
        let key = decode_base64(encoded_key, "remove key")?;
        for existing in current.get(&key) {
            output.remove(existing.clone());
        }
        output.keys_touched.insert(key);
    }
    Ok(output)
}
