//! Identifiers and small value types shared across the signals crates.

use serde::{Deserialize, Serialize};

/// Stable identifier of an advertiser (buyer), e.g. its ad-tech domain.
pub type BuyerId = String;

/// Epoch milliseconds.
pub type Timestamp = u64;

/// How binary signal keys and values are rendered when handed to an encoder script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyFormat {
    #[default]
    Hex,
    Base64,
}

/// Development options attached to an incoming update.
///
/// Only affects how collaborators reach the network (e.g. plain-http encoder
/// endpoints are allowed while developing).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DevContext {
    pub dev_options_enabled: bool,
}

impl DevContext {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn enabled() -> Self {
        Self {
            dev_options_enabled: true,
        }
    }
}
