//! `put_if_not_present`: add a value only when the key has none.
//!
//! ```text
//! {"put_if_not_present": {"<b64 key>": "<b64 value>"}}
//! ```

use serde_json::Value;
use signals_state::PendingSignal;

use super::{UpdateOperation, decode_base64, expect_base64_string, expect_object};
use crate::error::UpdateResult;
use crate::output::{CurrentSignals, UpdateOutput};

pub(super) fn process(value: &Value, current: &CurrentSignals) -> UpdateResult<UpdateOutput> {
    let mut output = UpdateOutput::default();
    for (encoded_key, value) in expect_object(value, UpdateOperation::PutIfNotPresent)? {
        let key = decode_base64(encoded_key, "put_if_not_present key")?;
        let value = expect_base64_string(value, "put_if_not_present value")?;
        if !current.contains_key(&key) {
            output.to_add.push(PendingSignal::new(key.clone(), value));
        }
        output.keys_touched.insert(key);
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::test_util::*;
    use serde_json::json;

    #[test]
    fn adds_when_absent() {
        let output = process(&json!({"AQ==": "Ag=="}), &empty()).unwrap();
        assert_eq!(output.to_add, vec![PendingSignal::new(vec![1], vec![2])]);
    }

    #[test]
    fn existing_key_is_touched_but_unchanged() {
        let current = CurrentSignals::new(vec![stored(1, &[1], &[7], 1)]);
        let output = process(&json!({"AQ==": "Ag=="}), &current).unwrap();
        assert!(output.is_noop());
        assert!(output.keys_touched.contains(&vec![1]));
    }
}
