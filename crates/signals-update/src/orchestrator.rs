//! Update processing orchestrator.
//!
//! One call applies one update document for one buyer:
//!
//! 1. read the buyer's signals and index them by key
//! 2. run every operation named in the document (lexical key order) and
//!    merge the partial outputs, failing on any key touched twice
//! 3. let the eviction controller trim the resulting set to quota
//! 4. write removals and insertions in one transaction
//! 5. handle the encoder event if there is one, otherwise try forced
//!    encoding
//!
//! Steps 1 to 4 are all-or-nothing. Step 5 runs after the commit; its
//! failures are logged and reported, never rolled back.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde_json::Value;
use signals_core::{DevContext, Timestamp};
use signals_encoding::ForcedEncoder;
use signals_state::StateStore;
use tracing::{debug, info, warn};

use crate::encoder_event::{EncoderEventOutcome, UpdateEncoderEventHandler};
use crate::error::{UpdateError, UpdateResult};
use crate::eviction::{SignalEvictionController, UpdatedSignal};
use crate::output::{CurrentSignals, UpdateOutput};
use crate::processors::UpdateOperation;

/// What an applied update changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdateReport {
    pub added: usize,
    pub removed: usize,
    /// Signals dropped by eviction (already counted in `removed` when they
    /// were stored).
    pub evicted: usize,
    /// Set when the document carried an encoder event.
    pub encoder_event: Option<EncoderEventOutcome>,
    /// Forced encoding ran and stored a payload.
    pub forced_encoding: bool,
    /// Failure after the commit; the signal changes above still stand.
    pub post_commit_error: Option<String>,
}

pub struct UpdateProcessingOrchestrator {
    store: StateStore,
    eviction: SignalEvictionController,
    encoder_events: UpdateEncoderEventHandler,
    forced_encoder: Arc<dyn ForcedEncoder>,
    buyer_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl UpdateProcessingOrchestrator {
    pub fn new(
        store: StateStore,
        eviction: SignalEvictionController,
        encoder_events: UpdateEncoderEventHandler,
        forced_encoder: Arc<dyn ForcedEncoder>,
    ) -> Self {
        Self {
            store,
            eviction,
            encoder_events,
            forced_encoder,
            buyer_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Parse `document` as JSON and apply it.
    pub async fn process_update_str(
        &self,
        buyer: &str,
        package_name: &str,
        timestamp: Timestamp,
        document: &str,
        dev: DevContext,
    ) -> UpdateResult<UpdateReport> {
        let value: Value =
            serde_json::from_str(document).map_err(|e| UpdateError::Syntax(e.to_string()))?;
        self.process_updates(buyer, package_name, timestamp, &value, dev)
            .await
    }

    pub async fn process_updates(
        &self,
        buyer: &str,
        package_name: &str,
        timestamp: Timestamp,
        document: &Value,
        dev: DevContext,
    ) -> UpdateResult<UpdateReport> {
        let operations = document
            .as_object()
            .ok_or_else(|| UpdateError::Syntax("update document must be a JSON object".to_string()))?;

        let lock = self.buyer_lock(buyer);
        let result = {
            let _guard = lock.lock().await;
            self.apply(buyer, package_name, timestamp, operations, dev)
                .await
        };
        drop(lock);
        self.release_buyer_lock(buyer);
        result
    }

    async fn apply(
        &self,
        buyer: &str,
        package_name: &str,
        timestamp: Timestamp,
        operations: &serde_json::Map<String, Value>,
        dev: DevContext,
    ) -> UpdateResult<UpdateReport> {
        let current = CurrentSignals::new(self.store.get_signals_by_buyer(buyer)?);

        let mut entries: Vec<(&String, &Value)> = operations.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        let mut combined = UpdateOutput::default();
        for (name, value) in entries {
            let operation = UpdateOperation::from_name(name)
                .ok_or_else(|| UpdateError::UnknownOperation(name.clone()))?;
            let partial = operation.process(value, &current)?;
            combined.merge(partial)?;
        }

        let removed_ids: HashSet<u64> = combined.to_remove.iter().map(|s| s.id).collect();
        let mut updated: Vec<UpdatedSignal> = current
            .into_signals()
            .into_iter()
            .filter(|signal| !removed_ids.contains(&signal.id))
            .map(UpdatedSignal::Stored)
            .chain(combined.to_add.iter().cloned().map(|signal| UpdatedSignal::Pending {
                signal,
                creation_time: timestamp,
            }))
            .collect();
        let evicted = self.eviction.evict(buyer, &mut updated, &mut combined);

        let mut report = UpdateReport {
            removed: combined.to_remove.len(),
            evicted,
            ..UpdateReport::default()
        };
        if !combined.to_add.is_empty() || !combined.to_remove.is_empty() {
            let inserted = self.store.insert_and_delete(
                buyer,
                package_name,
                timestamp,
                &combined.to_add,
                &combined.to_remove,
            )?;
            report.added = inserted.len();
        }
        info!(
            %buyer,
            package = %package_name,
            added = report.added,
            removed = report.removed,
            evicted,
            "signal update applied"
        );

        match &combined.encoder_event {
            Some(event) => match self.encoder_events.handle(buyer, event, dev).await {
                Ok(outcome) => report.encoder_event = Some(outcome),
                Err(e) => {
                    warn!(%buyer, error = %e, "encoder event failed after update");
                    report.encoder_event = Some(EncoderEventOutcome::default());
                    report.post_commit_error = Some(e.to_string());
                }
            },
            None => match self.forced_encoder.force_encoding_if_eligible(buyer).await {
                Ok(forced) => report.forced_encoding = forced,
                Err(e) => {
                    warn!(%buyer, error = %e, "forced encoding failed after update");
                    report.post_commit_error = Some(e.to_string());
                }
            },
        }
        Ok(report)
    }

    fn buyer_lock(&self, buyer: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.buyer_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(buyer.to_string())
            .or_default()
            .clone()
    }

    /// Drop the buyer's lock entry once nobody else holds or waits on it.
    fn release_buyer_lock(&self, buyer: &str) {
        let mut locks = self
            .buyer_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(buyer)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(buyer);
            debug!(%buyer, "buyer update lock released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;
    use signals_core::config::{EvictionConfig, ForcedEncodingConfig};
    use signals_core::{Clock, KeyFormat, ManualClock};
    use signals_encoding::{
        BuyerEncoder, EncodeLimits, EncoderFetcher, EncoderLogicHandler, FetchedEncoder,
        SignalsProvider, forced_encoder_from_config,
    };
    use signals_script::{IsolateSettings, NamedArgument, ScriptSandbox, SignalsScriptEngine};
    use signals_state::{EncoderLogicMetadata, PendingSignal};

    use crate::error::JsonProcessingStatus;

    const BUYER: &str = "buyer.example";
    const PACKAGE: &str = "com.x";
    const T0: u64 = 1_700_000_000_000;
    const ENDPOINT: &str = "https://buyer.example/encoder.js";
    const PROGRAM: &str = "function encodeSignals(signals, maxSize) { return {status: 0, results: new Uint8Array([0xAA])}; }";

    struct CountingSandbox {
        output: String,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ScriptSandbox for CountingSandbox {
        async fn evaluate(
            &self,
            _program: &str,
            _args: &[NamedArgument],
            _entry_point: &str,
            _settings: &IsolateSettings,
        ) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.output.clone())
        }
    }

    struct SingleEndpointFetcher;

    #[async_trait]
    impl EncoderFetcher for SingleEndpointFetcher {
        async fn fetch(&self, uri: &str, _dev: DevContext) -> anyhow::Result<FetchedEncoder> {
            anyhow::ensure!(uri == ENDPOINT, "no route to {uri}");
            Ok(FetchedEncoder {
                body: PROGRAM.to_string(),
                headers: HashMap::from([("x_encoder_version".to_string(), "5".to_string())]),
            })
        }
    }

    struct Harness {
        store: StateStore,
        sandbox: Arc<CountingSandbox>,
        orchestrator: UpdateProcessingOrchestrator,
    }

    fn harness(eviction: &EvictionConfig) -> Harness {
        let store = StateStore::open_in_memory().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(T0));
        let sandbox = Arc::new(CountingSandbox {
            output: r#"{"status":0,"results":"AA"}"#.to_string(),
            calls: AtomicUsize::new(0),
        });
        let logic = Arc::new(EncoderLogicHandler::new(
            store.clone(),
            Arc::new(SingleEndpointFetcher),
            clock.clone(),
            "x_encoder_version",
            0,
        ));
        let encoder = Arc::new(BuyerEncoder::new(
            store.clone(),
            SignalsScriptEngine::new(sandbox.clone(), IsolateSettings::default(), KeyFormat::Hex),
            SignalsProvider::new(store.clone(), KeyFormat::Hex),
            logic.clone(),
            clock.clone(),
            EncodeLimits {
                script_timeout: std::time::Duration::from_secs(1),
                max_payload_size: 16,
                max_failed_encodings: 3,
            },
        ));
        let forced = forced_encoder_from_config(
            &ForcedEncodingConfig::default(),
            store.clone(),
            encoder,
            clock.clone(),
        );
        let orchestrator = UpdateProcessingOrchestrator::new(
            store.clone(),
            SignalEvictionController::from_config(eviction),
            UpdateEncoderEventHandler::new(store.clone(), logic, forced.clone(), clock),
            forced,
        );
        Harness {
            store,
            sandbox,
            orchestrator,
        }
    }

    fn default_harness() -> Harness {
        harness(&EvictionConfig::default())
    }

    impl Harness {
        fn seed(&self, key: &[u8], value: &[u8], at: u64) {
            self.store
                .insert_and_delete(BUYER, PACKAGE, at, &[PendingSignal::new(key.to_vec(), value.to_vec())], &[])
                .unwrap();
        }

        async fn apply(&self, document: Value) -> UpdateResult<UpdateReport> {
            self.orchestrator
                .process_updates(BUYER, PACKAGE, T0, &document, DevContext::disabled())
                .await
        }
    }

    #[tokio::test]
    async fn put_on_empty_store_adds_one_signal() {
        let h = default_harness();
        let report = h
            .apply(json!({"put": {"AAA=": [{"val": "BBB=", "time": 1, "app": "com.x"}]}}))
            .await
            .unwrap();

        assert_eq!(report.added, 1);
        assert_eq!(report.removed, 0);
        let signals = h.store.get_signals_by_buyer(BUYER).unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].key, vec![0, 0]);
        assert_eq!(signals[0].value, vec![0x04, 0x10]);
        assert_eq!(signals[0].package_name, PACKAGE);
        assert_eq!(signals[0].creation_time, T0);
    }

    #[tokio::test]
    async fn collision_rejects_whole_document() {
        let h = default_harness();
        h.seed(&[0, 0], &[1], T0 - 10);
        let before = h.store.get_signals_by_buyer(BUYER).unwrap();

        let err = h
            .apply(json!({"put": {"AAA=": "AQ=="}, "remove": ["AAA="]}))
            .await
            .unwrap_err();

        assert!(matches!(err, UpdateError::Collision { ref key } if key == "0000"));
        assert_eq!(err.processing_status(), JsonProcessingStatus::SemanticError);
        assert_eq!(h.store.get_signals_by_buyer(BUYER).unwrap(), before);
    }

    #[tokio::test]
    async fn put_replaces_stored_values() {
        let h = default_harness();
        h.seed(&[0, 0], &[1], T0 - 10);

        let report = h.apply(json!({"put": {"AAA=": "Ag=="}})).await.unwrap();
        assert_eq!((report.added, report.removed), (1, 1));
        let signals = h.store.get_signals_by_buyer(BUYER).unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].value, vec![2]);
    }

    #[tokio::test]
    async fn empty_document_changes_nothing() {
        let h = default_harness();
        let report = h.apply(json!({})).await.unwrap();
        assert_eq!(report, UpdateReport::default());
        assert!(h.store.get_signals_update_metadata(BUYER).unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_documents_are_syntax_errors() {
        let h = default_harness();

        let err = h.apply(json!({"delete": ["AAA="]})).await.unwrap_err();
        assert!(matches!(err, UpdateError::UnknownOperation(ref name) if name == "delete"));
        assert!(err.is_invalid_argument());

        let err = h.apply(json!(["put"])).await.unwrap_err();
        assert_eq!(err.processing_status(), JsonProcessingStatus::SyntacticError);

        let err = h
            .orchestrator
            .process_update_str(BUYER, PACKAGE, T0, "{\"put\":", DevContext::disabled())
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::Syntax(_)));
        assert!(h.store.get_signals_by_buyer(BUYER).unwrap().is_empty());
    }

    #[tokio::test]
    async fn evicted_signals_are_never_persisted() {
        let h = harness(&EvictionConfig {
            max_size_per_buyer_bytes: 4,
            max_oversubscription_per_buyer_bytes: 4,
        });
        h.seed(&[1], &[1, 1, 1], T0 - 10);

        // Keys [2] and [3], three-byte values: two new 4-byte signals.
        let report = h
            .apply(json!({"put": {"Ag==": "AgIC", "Aw==": "AwMD"}}))
            .await
            .unwrap();

        assert_eq!(report.evicted, 2);
        assert_eq!(report.added, 1);
        assert_eq!(report.removed, 1);
        let signals = h.store.get_signals_by_buyer(BUYER).unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].key, vec![3]);
    }

    #[tokio::test]
    async fn encoder_event_registers_downloads_and_encodes() {
        let h = default_harness();
        let report = h
            .apply(json!({
                "put": {"AAA=": "AQ=="},
                "update_encoder": {"action": "REGISTER", "endpoint": ENDPOINT},
            }))
            .await
            .unwrap();

        assert_eq!(
            report.encoder_event,
            Some(EncoderEventOutcome {
                downloaded: true,
                forced: true,
            })
        );
        assert!(!report.forced_encoding);
        assert_eq!(h.store.get_encoder_endpoint(BUYER).unwrap().unwrap().download_uri, ENDPOINT);
        assert_eq!(h.store.get_encoder_metadata(BUYER).unwrap().unwrap().version, 5);
        assert_eq!(h.store.get_encoded_payload(BUYER).unwrap().unwrap().payload, vec![0xAA]);
        assert_eq!(h.sandbox.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_download_keeps_committed_signals() {
        let h = default_harness();
        let report = h
            .apply(json!({
                "put": {"AAA=": "AQ=="},
                "update_encoder": {"action": "register", "endpoint": "https://elsewhere.example/e.js"},
            }))
            .await
            .unwrap();

        assert_eq!(report.encoder_event, Some(EncoderEventOutcome::default()));
        assert_eq!(report.added, 1);
        assert_eq!(h.store.get_signals_by_buyer(BUYER).unwrap().len(), 1);
        assert!(h.store.get_encoder_metadata(BUYER).unwrap().is_none());
        assert_eq!(h.sandbox.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn without_event_forced_encoding_runs() {
        let h = default_harness();
        h.store
            .put_encoder(
                &EncoderLogicMetadata {
                    buyer: BUYER.to_string(),
                    version: 2,
                    creation_time: T0 - 100,
                    failed_encoding_count: 0,
                },
                PROGRAM,
            )
            .unwrap();

        let report = h.apply(json!({"append": {"AAA=": {"values": ["AQ=="], "max_signals": 2}}})).await.unwrap();
        assert!(report.forced_encoding);
        assert!(report.encoder_event.is_none());
        let payload = h.store.get_encoded_payload(BUYER).unwrap().unwrap();
        assert_eq!((payload.version, payload.creation_time), (2, T0));

        // A second update within the cooldown does not re-encode.
        let report = h.apply(json!({"put": {"AQ==": "AQ=="}})).await.unwrap();
        assert!(!report.forced_encoding);
        assert_eq!(h.sandbox.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_updates_for_one_buyer_serialise() {
        let h = Arc::new(default_harness());
        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let h = h.clone();
            tasks.push(tokio::spawn(async move {
                let mut put = serde_json::Map::new();
                put.insert(base64_of(&[i]), json!("AQ=="));
                h.apply(json!({"put": put})).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(h.store.get_signals_by_buyer(BUYER).unwrap().len(), 8);
        assert!(h.orchestrator.buyer_locks.lock().unwrap().is_empty());
    }

    fn base64_of(bytes: &[u8]) -> String {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }
}
