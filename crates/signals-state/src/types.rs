//! Record types for the signals store.
//!
//! All types are serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use signals_core::{BuyerId, Timestamp};

// ── Signals ────────────────────────────────────────────────────────

/// A persisted signal. Keys are not unique per buyer: several signals may
/// share a key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Signal {
    /// Store-assigned, unique across buyers.
    pub id: u64,
    pub buyer: BuyerId,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub creation_time: Timestamp,
    /// App that wrote the signal.
    pub package_name: String,
}

impl Signal {
    pub fn table_key(&self) -> String {
        signal_table_key(&self.buyer, self.id)
    }

    /// Bytes counted against the buyer's quota.
    pub fn size_bytes(&self) -> usize {
        self.key.len() + self.value.len()
    }
}

/// A signal produced by an update that has not been written yet. The store
/// stamps it with id, buyer, package and update time on insert.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingSignal {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl PendingSignal {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn size_bytes(&self) -> usize {
        self.key.len() + self.value.len()
    }
}

pub fn signal_table_key(buyer: &str, id: u64) -> String {
    format!("{buyer}/{id:020}")
}

/// Buyer part of a signal table key.
pub fn signal_key_owner(table_key: &str) -> Option<&str> {
    table_key.rsplit_once('/').map(|(buyer, _)| buyer)
}

/// Half-open key range covering every `{buyer}/...` signal key.
pub fn signal_key_range(buyer: &str) -> (String, String) {
    // '0' is the byte right after '/'.
    (format!("{buyer}/"), format!("{buyer}0"))
}

/// When a buyer's signal set last changed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignalsUpdateMetadata {
    pub buyer: BuyerId,
    pub last_signals_updated_time: Timestamp,
}

// ── Encoders ───────────────────────────────────────────────────────

/// Bookkeeping for a buyer's registered encoder program.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncoderLogicMetadata {
    pub buyer: BuyerId,
    pub version: u64,
    pub creation_time: Timestamp,
    /// Consecutive failed encodes; reset to zero by a successful one.
    pub failed_encoding_count: u32,
}

/// Registered download location of a buyer's encoder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncoderEndpoint {
    pub buyer: BuyerId,
    pub download_uri: String,
    pub creation_time: Timestamp,
}

/// Output of a buyer's encoder; overwritten wholesale on every successful encode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncodedPayload {
    pub buyer: BuyerId,
    /// Version of the encoder that produced it.
    pub version: u64,
    pub creation_time: Timestamp,
    pub payload: Vec<u8>,
}
