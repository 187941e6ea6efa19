//! Update operations, one per top-level key of an update document.
//!
//! Operation names map to [`UpdateOperation`] variants; dispatch is an
//! exhaustive match, so adding an operation means adding a variant.

mod append;
mod put;
mod put_if_not_present;
mod remove;
mod update_encoder;

use base64::Engine as _;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use serde_json::Value;

use crate::error::{UpdateError, UpdateResult};
use crate::output::{CurrentSignals, UpdateOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateOperation {
    Put,
    PutIfNotPresent,
    Append,
    Remove,
    UpdateEncoder,
}

impl UpdateOperation {
    pub const ALL: [UpdateOperation; 5] = [
        UpdateOperation::Put,
        UpdateOperation::PutIfNotPresent,
        UpdateOperation::Append,
        UpdateOperation::Remove,
        UpdateOperation::UpdateEncoder,
    ];

    /// Document key for this operation.
    pub fn name(self) -> &'static str {
        match self {
            UpdateOperation::Put => "put",
            UpdateOperation::PutIfNotPresent => "put_if_not_present",
            UpdateOperation::Append => "append",
            UpdateOperation::Remove => "remove",
            UpdateOperation::UpdateEncoder => "update_encoder",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.name() == name)
    }

    /// Turn this operation's JSON value into a partial output against the
    /// buyer's current signals.
    pub fn process(self, value: &Value, current: &CurrentSignals) -> UpdateResult<UpdateOutput> {
        match self {
            UpdateOperation::Put => put::process(value, current),
            UpdateOperation::PutIfNotPresent => put_if_not_present::process(value, current),
            UpdateOperation::Append => append::process(value, current),
            UpdateOperation::Remove => remove::process(value, current),
            UpdateOperation::UpdateEncoder => update_encoder::process(value),
        }
    }
}

/// Standard alphabet, padding optional, non-zero trailing bits tolerated.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_allow_trailing_bits(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

pub(crate) fn decode_base64(text: &str, what: &str) -> UpdateResult<Vec<u8>> {
    LENIENT_BASE64
        .decode(text)
        .map_err(|e| UpdateError::Syntax(format!("{what} '{text}' is not valid base64: {e}")))
}

pub(crate) fn expect_object<'a>(
    value: &'a Value,
    op: UpdateOperation,
) -> UpdateResult<&'a serde_json::Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| UpdateError::Syntax(format!("'{}' expects a JSON object", op.name())))
}

pub(crate) fn expect_base64_string(value: &Value, what: &str) -> UpdateResult<Vec<u8>> {
    let text = value
        .as_str()
        .ok_or_else(|| UpdateError::Syntax(format!("{what} must be a base64 string")))?;
    decode_base64(text, what)
}
