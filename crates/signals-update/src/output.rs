//! Partial and merged results of update operations.

use std::collections::{BTreeSet, HashMap};

use signals_state::{PendingSignal, Signal};

use crate::error::{UpdateError, UpdateResult};

/// Request to change a buyer's encoder, carried by an update document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderEvent {
    Register { endpoint: String },
}

/// What one operation (or a whole document, once merged) wants to change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOutput {
    pub to_add: Vec<PendingSignal>,
    /// Stored signals to delete; no id appears twice.
    pub to_remove: Vec<Signal>,
    pub keys_touched: BTreeSet<Vec<u8>>,
    pub encoder_event: Option<EncoderEvent>,
}

impl UpdateOutput {
    pub fn remove(&mut self, signal: Signal) {
        if !self.to_remove.iter().any(|s| s.id == signal.id) {
            self.to_remove.push(signal);
        }
    }

    pub fn is_noop(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty() && self.encoder_event.is_none()
    }

    /// Fold another operation's output into this one.
    ///
    /// Fails if the two touched any key in common. A later encoder event
    /// replaces an earlier one.
    pub fn merge(&mut self, other: UpdateOutput) -> UpdateResult<()> {
        if let Some(key) = other
            .keys_touched
            .iter()
            .find(|key| self.keys_touched.contains(*key))
        {
            return Err(UpdateError::Collision {
                key: hex::encode_upper(key),
            });
        }

        self.to_add.extend(other.to_add);
        for signal in other.to_remove {
            self.remove(signal);
        }
        self.keys_touched.extend(other.keys_touched);
        if other.encoder_event.is_some() {
            self.encoder_event = other.encoder_event;
        }
        Ok(())
    }
}

/// A buyer's stored signals indexed by key. Built fresh for every update.
#[derive(Debug, Clone, Default)]
pub struct CurrentSignals {
    signals: Vec<Signal>,
    by_key: HashMap<Vec<u8>, Vec<usize>>,
}

impl CurrentSignals {
    pub fn new(signals: Vec<Signal>) -> Self {
        let mut by_key: HashMap<Vec<u8>, Vec<usize>> = HashMap::new();
        for (index, signal) in signals.iter().enumerate() {
            by_key.entry(signal.key.clone()).or_default().push(index);
        }
        Self { signals, by_key }
    }

    /// Signals stored under `key`, in store order.
    pub fn get(&self, key: &[u8]) -> Vec<&Signal> {
        self.by_key
            .get(key)
            .map(|indexes| indexes.iter().map(|&i| &self.signals[i]).collect())
            .unwrap_or_default()
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn all(&self) -> &[Signal] {
        &self.signals
    }

    pub fn into_signals(self) -> Vec<Signal> {
        self.signals
    }
}
