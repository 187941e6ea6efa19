//! StateStore: redb-backed persistence for protected signals.
//!
//! Provides buyer-scoped operations over signals, signals-update metadata,
//! encoder programs and metadata, encoder endpoints, and encoded payloads.
//! The store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use signals_core::Timestamp;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "signals store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory signals store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(SIGNALS).map_err(map_err!(Table))?;
        txn.open_table(SIGNALS_UPDATE_METADATA).map_err(map_err!(Table))?;
        txn.open_table(ENCODER_METADATA).map_err(map_err!(Table))?;
        txn.open_table(ENCODER_PROGRAMS).map_err(map_err!(Table))?;
        txn.open_table(ENCODER_ENDPOINTS).map_err(map_err!(Table))?;
        txn.open_table(ENCODED_PAYLOADS).map_err(map_err!(Table))?;
        txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic JSON records ───────────────────────────────────────

    fn put_json<T: Serialize>(&self, table: JsonTable, key: &str, record: &T) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn list_json<T: DeserializeOwned>(&self, table: JsonTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: T =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    fn delete_json(&self, table: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Signals ────────────────────────────────────────────────────

    /// All signals of a buyer, oldest insert first.
    pub fn get_signals_by_buyer(&self, buyer: &str) -> StateResult<Vec<Signal>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SIGNALS).map_err(map_err!(Table))?;
        let (start, end) = signal_key_range(buyer);
        let mut results = Vec::new();
        for entry in table.range(start.as_str()..end.as_str()).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            // Buyers nested under this one share the prefix.
            if signal_key_owner(key.value()) == Some(buyer) {
                let signal: Signal =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(signal);
            }
        }
        Ok(results)
    }

    pub fn has_signals_from_buyer(&self, buyer: &str) -> StateResult<bool> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SIGNALS).map_err(map_err!(Table))?;
        let (start, end) = signal_key_range(buyer);
        for entry in table.range(start.as_str()..end.as_str()).map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            if signal_key_owner(key.value()) == Some(buyer) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Atomically delete `to_remove` and insert `to_add` for one buyer.
    ///
    /// New signals are stamped with `package_name` and `timestamp` and get
    /// fresh ids. When anything changed, the buyer's signals-update metadata
    /// moves to `timestamp` in the same transaction. Returns the inserted
    /// signals.
    pub fn insert_and_delete(
        &self,
        buyer: &str,
        package_name: &str,
        timestamp: Timestamp,
        to_add: &[PendingSignal],
        to_remove: &[Signal],
    ) -> StateResult<Vec<Signal>> {
        if let Some(foreign) = to_remove.iter().find(|s| s.buyer != buyer) {
            return Err(StateError::ForeignSignal {
                id: foreign.id,
                owner: foreign.buyer.clone(),
                buyer: buyer.to_string(),
            });
        }

        let metadata = SignalsUpdateMetadata {
            buyer: buyer.to_string(),
            last_signals_updated_time: timestamp,
        };
        let metadata_value = serde_json::to_vec(&metadata).map_err(map_err!(Serialize))?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut inserted = Vec::with_capacity(to_add.len());
        let mut removed = 0usize;
        {
            let mut signals = txn.open_table(SIGNALS).map_err(map_err!(Table))?;
            for signal in to_remove {
                if signals
                    .remove(signal.table_key().as_str())
                    .map_err(map_err!(Write))?
                    .is_some()
                {
                    removed += 1;
                }
            }

            let mut counters = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
            let mut next_id = counters
                .get(NEXT_SIGNAL_ID)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(1);

            for pending in to_add {
                let signal = Signal {
                    id: next_id,
                    buyer: buyer.to_string(),
                    key: pending.key.clone(),
                    value: pending.value.clone(),
                    creation_time: timestamp,
                    package_name: package_name.to_string(),
                };
                let value = serde_json::to_vec(&signal).map_err(map_err!(Serialize))?;
                signals
                    .insert(signal.table_key().as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
                inserted.push(signal);
                next_id += 1;
            }
            counters
                .insert(NEXT_SIGNAL_ID, next_id)
                .map_err(map_err!(Write))?;

            if removed > 0 || !inserted.is_empty() {
                let mut meta = txn
                    .open_table(SIGNALS_UPDATE_METADATA)
                    .map_err(map_err!(Table))?;
                meta.insert(buyer, metadata_value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%buyer, added = inserted.len(), removed, "signals updated");
        Ok(inserted)
    }

    /// Delete every signal of a buyer. Returns the number deleted.
    pub fn delete_signals_for_buyer(&self, buyer: &str) -> StateResult<u32> {
        // Collect keys in a read transaction first.
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(SIGNALS).map_err(map_err!(Table))?;
            let (start, end) = signal_key_range(buyer);
            let mut keys = Vec::new();
            for entry in table.range(start.as_str()..end.as_str()).map_err(map_err!(Read))? {
                let (key, _) = entry.map_err(map_err!(Read))?;
                if signal_key_owner(key.value()) == Some(buyer) {
                    keys.push(key.value().to_string());
                }
            }
            keys
        };
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count = keys.len() as u32;
        {
            let mut table = txn.open_table(SIGNALS).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%buyer, count, "signals deleted");
        Ok(count)
    }

    // ── Signals update metadata ────────────────────────────────────

    pub fn get_signals_update_metadata(
        &self,
        buyer: &str,
    ) -> StateResult<Option<SignalsUpdateMetadata>> {
        self.get_json(SIGNALS_UPDATE_METADATA, buyer)
    }

    pub fn put_signals_update_metadata(&self, metadata: &SignalsUpdateMetadata) -> StateResult<()> {
        self.put_json(SIGNALS_UPDATE_METADATA, &metadata.buyer, metadata)
    }

    pub fn delete_signals_update_metadata(&self, buyer: &str) -> StateResult<bool> {
        self.delete_json(SIGNALS_UPDATE_METADATA, buyer)
    }

    // ── Encoders ───────────────────────────────────────────────────

    pub fn get_encoder_metadata(&self, buyer: &str) -> StateResult<Option<EncoderLogicMetadata>> {
        self.get_json(ENCODER_METADATA, buyer)
    }

    pub fn put_encoder_metadata(&self, metadata: &EncoderLogicMetadata) -> StateResult<()> {
        self.put_json(ENCODER_METADATA, &metadata.buyer, metadata)
    }

    pub fn get_encoder_program(&self, buyer: &str) -> StateResult<Option<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ENCODER_PROGRAMS).map_err(map_err!(Table))?;
        let program = table
            .get(buyer)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_string());
        Ok(program)
    }

    /// Store an encoder program together with its metadata.
    pub fn put_encoder(&self, metadata: &EncoderLogicMetadata, program: &str) -> StateResult<()> {
        let value = serde_json::to_vec(metadata).map_err(map_err!(Serialize))?;
        let buyer = metadata.buyer.as_str();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut programs = txn.open_table(ENCODER_PROGRAMS).map_err(map_err!(Table))?;
            programs.insert(buyer, program).map_err(map_err!(Write))?;
            let mut meta = txn.open_table(ENCODER_METADATA).map_err(map_err!(Table))?;
            meta.insert(buyer, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%buyer, version = metadata.version, "encoder stored");
        Ok(())
    }

    /// Overwrite a buyer's consecutive failure count. Returns false when the
    /// buyer has no encoder.
    pub fn update_failed_count(&self, buyer: &str, count: u32) -> StateResult<bool> {
        Ok(self.modify_failed_count(buyer, |_| count)?.is_some())
    }

    /// Add one to a buyer's failure count inside a single write transaction.
    /// Returns the new count, or `None` when the buyer has no encoder.
    pub fn increment_failed_count(&self, buyer: &str) -> StateResult<Option<u32>> {
        self.modify_failed_count(buyer, |count| count.saturating_add(1))
    }

    fn modify_failed_count(
        &self,
        buyer: &str,
        next: impl FnOnce(u32) -> u32,
    ) -> StateResult<Option<u32>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated;
        {
            let mut table = txn.open_table(ENCODER_METADATA).map_err(map_err!(Table))?;
            let current: Option<EncoderLogicMetadata> = match table.get(buyer).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            updated = match current {
                Some(mut metadata) => {
                    metadata.failed_encoding_count = next(metadata.failed_encoding_count);
                    let value = serde_json::to_vec(&metadata).map_err(map_err!(Serialize))?;
                    table
                        .insert(buyer, value.as_slice())
                        .map_err(map_err!(Write))?;
                    Some(metadata.failed_encoding_count)
                }
                None => None,
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(updated)
    }

    /// Buyers that have an encoder registered.
    pub fn buyers_with_encoders(&self) -> StateResult<Vec<String>> {
        let metadata: Vec<EncoderLogicMetadata> = self.list_json(ENCODER_METADATA)?;
        Ok(metadata.into_iter().map(|m| m.buyer).collect())
    }

    /// Buyers whose encoder was stored strictly before `time`.
    pub fn buyers_with_encoders_before(&self, time: Timestamp) -> StateResult<Vec<String>> {
        let metadata: Vec<EncoderLogicMetadata> = self.list_json(ENCODER_METADATA)?;
        Ok(metadata
            .into_iter()
            .filter(|m| m.creation_time < time)
            .map(|m| m.buyer)
            .collect())
    }

    /// Remove a buyer's encoder registration: metadata, program, endpoint,
    /// and signals-update metadata. Returns true if the encoder existed.
    pub fn delete_encoder(&self, buyer: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut meta = txn.open_table(ENCODER_METADATA).map_err(map_err!(Table))?;
            existed = meta.remove(buyer).map_err(map_err!(Write))?.is_some();
            let mut programs = txn.open_table(ENCODER_PROGRAMS).map_err(map_err!(Table))?;
            programs.remove(buyer).map_err(map_err!(Write))?;
            let mut endpoints = txn.open_table(ENCODER_ENDPOINTS).map_err(map_err!(Table))?;
            endpoints.remove(buyer).map_err(map_err!(Write))?;
            let mut updates = txn
                .open_table(SIGNALS_UPDATE_METADATA)
                .map_err(map_err!(Table))?;
            updates.remove(buyer).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%buyer, existed, "encoder deleted");
        Ok(existed)
    }

    // ── Encoder endpoints ──────────────────────────────────────────

    pub fn get_encoder_endpoint(&self, buyer: &str) -> StateResult<Option<EncoderEndpoint>> {
        self.get_json(ENCODER_ENDPOINTS, buyer)
    }

    pub fn put_encoder_endpoint(&self, endpoint: &EncoderEndpoint) -> StateResult<()> {
        self.put_json(ENCODER_ENDPOINTS, &endpoint.buyer, endpoint)?;
        debug!(buyer = %endpoint.buyer, uri = %endpoint.download_uri, "encoder endpoint registered");
        Ok(())
    }

    pub fn delete_encoder_endpoint(&self, buyer: &str) -> StateResult<bool> {
        self.delete_json(ENCODER_ENDPOINTS, buyer)
    }

    // ── Encoded payloads ───────────────────────────────────────────

    pub fn get_encoded_payload(&self, buyer: &str) -> StateResult<Option<EncodedPayload>> {
        self.get_json(ENCODED_PAYLOADS, buyer)
    }

    pub fn put_encoded_payload(&self, payload: &EncodedPayload) -> StateResult<()> {
        self.put_json(ENCODED_PAYLOADS, &payload.buyer, payload)?;
        debug!(
            buyer = %payload.buyer,
            version = payload.version,
            size = payload.payload.len(),
            "encoded payload stored"
        );
        Ok(())
    }

    pub fn delete_encoded_payload(&self, buyer: &str) -> StateResult<bool> {
        self.delete_json(ENCODED_PAYLOADS, buyer)
    }

    pub fn list_encoded_payloads(&self) -> StateResult<Vec<EncodedPayload>> {
        self.list_json(ENCODED_PAYLOADS)
    }
}
