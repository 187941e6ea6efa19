//! Fakes shared by the unit tests of this crate.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use signals_core::{DevContext, KeyFormat, ManualClock};
use signals_script::{IsolateSettings, NamedArgument, ScriptSandbox, SignalsScriptEngine};
use signals_state::{EncoderLogicMetadata, PendingSignal, StateStore};

use crate::encoder::{BuyerEncoder, EncodeLimits};
use crate::logic::{EncoderFetcher, EncoderLogicHandler, FetchedEncoder};
use crate::provider::SignalsProvider;

pub const BUYER: &str = "buyer.example";
pub const T0: u64 = 1_700_000_000_000;

/// Sandbox answering every call with the same output after an optional delay.
pub struct ScriptedSandbox {
    output: String,
    delay: Option<Duration>,
    gate: Option<Gate>,
    panics: bool,
    calls: AtomicUsize,
}

/// Parks every call until the test releases it.
#[derive(Default)]
struct Gate {
    entered: Notify,
    release: Notify,
}

impl ScriptedSandbox {
    fn build(output: &str, delay: Option<Duration>, gate: Option<Gate>, panics: bool) -> Arc<Self> {
        Arc::new(Self {
            output: output.to_string(),
            delay,
            gate,
            panics,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn returning(output: &str) -> Arc<Self> {
        Self::build(output, None, None, false)
    }

    pub fn slow(output: &str, delay: Duration) -> Arc<Self> {
        Self::build(output, Some(delay), None, false)
    }

    pub fn gated(output: &str) -> Arc<Self> {
        Self::build(output, None, Some(Gate::default()), false)
    }

    pub fn panicking() -> Arc<Self> {
        Self::build("", None, None, true)
    }

    /// Wait until a call is parked on the gate.
    pub async fn entered(&self) {
        if let Some(gate) = &self.gate {
            gate.entered.notified().await;
        }
    }

    /// Let one parked (or the next) call continue.
    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.release.notify_one();
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScriptSandbox for ScriptedSandbox {
    async fn evaluate(
        &self,
        _program: &str,
        _args: &[NamedArgument],
        _entry_point: &str,
        _settings: &IsolateSettings,
    ) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panics {
            panic!("interpreter crashed");
        }
        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.output.clone())
    }
}

/// Fetcher serving fixed responses per URI; unknown URIs fail.
#[derive(Default)]
pub struct StaticFetcher {
    responses: HashMap<String, FetchedEncoder>,
    calls: AtomicUsize,
}

impl StaticFetcher {
    pub fn with(mut self, uri: &str, body: &str, version: Option<&str>) -> Self {
        let mut headers = HashMap::new();
        if let Some(version) = version {
            headers.insert("x_encoder_version".to_string(), version.to_string());
        }
        self.responses.insert(
            uri.to_string(),
            FetchedEncoder {
                body: body.to_string(),
                headers,
            },
        );
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EncoderFetcher for StaticFetcher {
    async fn fetch(&self, uri: &str, _dev: DevContext) -> anyhow::Result<FetchedEncoder> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .get(uri)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no route to {uri}"))
    }
}

pub struct Fixture {
    pub store: StateStore,
    pub clock: Arc<ManualClock>,
    pub sandbox: Arc<ScriptedSandbox>,
    pub fetcher: Arc<StaticFetcher>,
    pub logic: Arc<EncoderLogicHandler>,
    pub encoder: Arc<BuyerEncoder>,
}

impl Fixture {
    pub fn new(sandbox: Arc<ScriptedSandbox>) -> Self {
        Self::with_fetcher(sandbox, StaticFetcher::default())
    }

    pub fn with_fetcher(sandbox: Arc<ScriptedSandbox>, fetcher: StaticFetcher) -> Self {
        let store = StateStore::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::new(T0));
        let fetcher = Arc::new(fetcher);
        let logic = Arc::new(EncoderLogicHandler::new(
            store.clone(),
            fetcher.clone(),
            clock.clone(),
            "x_encoder_version",
            0,
        ));
        let engine = SignalsScriptEngine::new(
            sandbox.clone(),
            IsolateSettings::default(),
            KeyFormat::Hex,
        );
        let encoder = Arc::new(BuyerEncoder::new(
            store.clone(),
            engine,
            SignalsProvider::new(store.clone(), KeyFormat::Hex),
            logic.clone(),
            clock.clone(),
            EncodeLimits {
                script_timeout: Duration::from_millis(200),
                max_payload_size: 4,
                max_failed_encodings: 3,
            },
        ));
        Self {
            store,
            clock,
            sandbox,
            fetcher,
            logic,
            encoder,
        }
    }

    pub fn register_encoder(&self, buyer: &str, creation_time: u64, failed: u32) {
        self.store
            .put_encoder(
                &EncoderLogicMetadata {
                    buyer: buyer.to_string(),
                    version: 7,
                    creation_time,
                    failed_encoding_count: failed,
                },
                "function encodeSignals(signals, maxSize) { return {status: 0, results: new Uint8Array([1])}; }",
            )
            .unwrap();
    }

    pub fn add_signal(&self, buyer: &str, at: u64) {
        self.store
            .insert_and_delete(buyer, "com.app", at, &[PendingSignal::new(vec![1], vec![2])], &[])
            .unwrap();
    }
}
