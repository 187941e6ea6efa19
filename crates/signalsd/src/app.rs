//! Component assembly shared by every subcommand.

use std::sync::Arc;

use anyhow::Context;
use signals_core::{Clock, SignalsConfig, SystemClock};
use signals_encoding::{
    BuyerEncoder, EncodeLimits, EncoderFetcher, EncoderLogicHandler, ForcedEncoder,
    PeriodicEncodingJobWorker, SignalsProvider, forced_encoder_from_config,
};
use signals_script::{CommandSandbox, IsolateSettings, ScriptSandbox, SignalsScriptEngine};
use signals_state::StateStore;
use signals_update::{SignalEvictionController, UpdateEncoderEventHandler, UpdateProcessingOrchestrator};
use tracing::info;

use crate::fetch::HttpEncoderFetcher;

/// Every long-lived service, wired to one store.
pub struct Signals {
    pub config: SignalsConfig,
    pub store: StateStore,
    pub clock: Arc<dyn Clock>,
    pub logic: Arc<EncoderLogicHandler>,
    pub encoder: Arc<BuyerEncoder>,
    pub forced: Arc<dyn ForcedEncoder>,
    pub orchestrator: Arc<UpdateProcessingOrchestrator>,
    pub worker: PeriodicEncodingJobWorker,
}

impl Signals {
    /// Open the on-disk store and use the process sandbox, HTTP fetcher,
    /// and wall clock.
    pub fn open(config: SignalsConfig) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.storage.data_dir).with_context(|| {
            format!("creating data dir {}", config.storage.data_dir.display())
        })?;
        let db_path = config.storage.db_path();
        let store = StateStore::open(&db_path)
            .with_context(|| format!("opening store {}", db_path.display()))?;
        info!(path = ?db_path, "state store opened");

        let sandbox = Arc::new(CommandSandbox::from_config(&config.sandbox));
        let fetcher = Arc::new(HttpEncoderFetcher::from_config(&config.fetch)?);
        Ok(Self::build(config, store, sandbox, fetcher, Arc::new(SystemClock)))
    }

    pub fn build(
        config: SignalsConfig,
        store: StateStore,
        sandbox: Arc<dyn ScriptSandbox>,
        fetcher: Arc<dyn EncoderFetcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let format = config.encoding.argument_format;

        let logic = Arc::new(EncoderLogicHandler::new(
            store.clone(),
            fetcher,
            clock.clone(),
            config.fetch.version_header.clone(),
            config.fetch.fallback_version,
        ));

        let engine = SignalsScriptEngine::new(sandbox, IsolateSettings::from(&config.sandbox), format);
        let encoder = Arc::new(BuyerEncoder::new(
            store.clone(),
            engine,
            SignalsProvider::new(store.clone(), format),
            logic.clone(),
            clock.clone(),
            EncodeLimits {
                script_timeout: config.encoding.script_timeout(),
                max_payload_size: config.encoding.max_payload_size_bytes,
                max_failed_encodings: config.encoding.max_failed_encodings,
            },
        ));

        let forced = forced_encoder_from_config(
            &config.forced_encoding,
            store.clone(),
            encoder.clone(),
            clock.clone(),
        );

        let orchestrator = Arc::new(UpdateProcessingOrchestrator::new(
            store.clone(),
            SignalEvictionController::from_config(&config.eviction),
            UpdateEncoderEventHandler::new(store.clone(), logic.clone(), forced.clone(), clock.clone()),
            forced.clone(),
        ));

        let worker = PeriodicEncodingJobWorker::new(
            encoder.clone(),
            logic.clone(),
            clock.clone(),
            config.encoding.encoder_refresh_window(),
        );

        Self {
            config,
            store,
            clock,
            logic,
            encoder,
            forced,
            orchestrator,
            worker,
        }
    }
}
