//! Rendering stored signals into the script's `signals` argument.
//!
//! The argument is a JSON object keyed by the encoded signal key, each entry
//! listing the signals sharing that key:
//!
//! ```text
//! { "<key>": [ { "val": "<value>", "time": <epoch secs>, "app": "<package>" } ] }
//! ```
//!
//! Keys and values are hex or base64 text depending on [`KeyFormat`]; the
//! matching driver decodes them back to bytes inside the sandbox.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use signals_core::KeyFormat;
use signals_state::Signal;

use crate::error::{ScriptError, ScriptResult};
use crate::hex_codec::binary_to_hex;

/// One signal as the script sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptSignal {
    pub val: String,
    /// Creation time in epoch seconds.
    pub time: u64,
    pub app: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct SignalsArgument {
    entries: BTreeMap<String, Vec<ScriptSignal>>,
}

impl SignalsArgument {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, encoded_key: &str) -> Option<&[ScriptSignal]> {
        self.entries.get(encoded_key).map(Vec::as_slice)
    }

    /// JSON literal text, ready to be passed as a named argument.
    pub fn to_json(&self) -> ScriptResult<String> {
        serde_json::to_string(self).map_err(|e| ScriptError::Marshal(e.to_string()))
    }
}

pub fn encode_bytes(bytes: &[u8], format: KeyFormat) -> String {
    match format {
        KeyFormat::Hex => binary_to_hex(bytes),
        KeyFormat::Base64 => STANDARD.encode(bytes),
    }
}

/// Group `signals` by key and encode them for the script.
pub fn render_signals(signals: &[Signal], format: KeyFormat) -> SignalsArgument {
    let mut entries: BTreeMap<String, Vec<ScriptSignal>> = BTreeMap::new();
    for signal in signals {
        entries
            .entry(encode_bytes(&signal.key, format))
            .or_default()
            .push(ScriptSignal {
                val: encode_bytes(&signal.value, format),
                time: signal.creation_time / 1_000,
                app: signal.package_name.clone(),
            });
    }
    SignalsArgument { entries }
}
