//! Encode-one-buyer logic shared by the periodic job and forced encoding.
//!
//! Decision order for a buyer with a registered encoder:
//!
//! 1. no raw signals: the encoder registration is deleted, nothing runs
//! 2. signals and encoder both older than the stored payload: skip
//! 3. consecutive failures at the configured maximum: skip
//! 4. otherwise run the script under a timeout, check the payload size,
//!    and store it
//!
//! A failure in step 4 bumps the buyer's failure count and stores nothing;
//! a success resets the count.

use std::sync::Arc;
use std::time::Duration;

use signals_core::Clock;
use signals_script::SignalsScriptEngine;
use signals_state::{EncodedPayload, EncoderLogicMetadata, StateStore};
use tracing::{debug, warn};

use crate::error::{EncodingError, EncodingResult};
use crate::logic::EncoderLogicHandler;
use crate::provider::SignalsProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The buyer has no signals; its encoder was removed.
    NoSignals,
    /// Neither signals nor encoder changed since the stored payload.
    UpToDate,
    /// Too many consecutive failures.
    CircuitOpen,
    NoEncoder,
}

#[derive(Debug)]
pub enum EncodeOutcome {
    Encoded { version: u64, size: usize },
    Skipped(SkipReason),
    /// The encode ran and failed; the failure count was incremented.
    Failed(EncodingError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeLimits {
    pub script_timeout: Duration,
    pub max_payload_size: usize,
    pub max_failed_encodings: u32,
}

pub struct BuyerEncoder {
    store: StateStore,
    engine: SignalsScriptEngine,
    provider: SignalsProvider,
    logic: Arc<EncoderLogicHandler>,
    clock: Arc<dyn Clock>,
    limits: EncodeLimits,
}

impl BuyerEncoder {
    pub fn new(
        store: StateStore,
        engine: SignalsScriptEngine,
        provider: SignalsProvider,
        logic: Arc<EncoderLogicHandler>,
        clock: Arc<dyn Clock>,
        limits: EncodeLimits,
    ) -> Self {
        Self {
            store,
            engine,
            provider,
            logic,
            clock,
            limits,
        }
    }

    /// Errors are storage failures while deciding; failures of the encode
    /// itself come back as [`EncodeOutcome::Failed`].
    pub async fn encode_buyer(&self, buyer: &str) -> EncodingResult<EncodeOutcome> {
        let Some(metadata) = self.store.get_encoder_metadata(buyer)? else {
            return Ok(EncodeOutcome::Skipped(SkipReason::NoEncoder));
        };

        if !self.store.has_signals_from_buyer(buyer)? {
            self.logic.delete_encoder_for_buyer(buyer)?;
            debug!(%buyer, "no signals left, encoder removed");
            return Ok(EncodeOutcome::Skipped(SkipReason::NoSignals));
        }

        let update_metadata = self.store.get_signals_update_metadata(buyer)?;
        let payload = self.store.get_encoded_payload(buyer)?;
        if let (Some(update), Some(payload)) = (&update_metadata, &payload)
            && update.last_signals_updated_time < payload.creation_time
            && metadata.creation_time < payload.creation_time
        {
            debug!(%buyer, "payload up to date");
            return Ok(EncodeOutcome::Skipped(SkipReason::UpToDate));
        }

        if metadata.failed_encoding_count >= self.limits.max_failed_encodings {
            debug!(
                %buyer,
                failures = metadata.failed_encoding_count,
                max = self.limits.max_failed_encodings,
                "encoder disabled after repeated failures"
            );
            return Ok(EncodeOutcome::Skipped(SkipReason::CircuitOpen));
        }

        match self.run_encode(buyer, &metadata).await {
            Ok(size) => {
                if metadata.failed_encoding_count > 0 {
                    self.store.update_failed_count(buyer, 0)?;
                }
                debug!(%buyer, version = metadata.version, size, "buyer encoded");
                Ok(EncodeOutcome::Encoded {
                    version: metadata.version,
                    size,
                })
            }
            Err(e) => {
                let failures = self.store.increment_failed_count(buyer)?;
                warn!(%buyer, ?failures, error = %e, "encoding failed");
                Ok(EncodeOutcome::Failed(e))
            }
        }
    }

    async fn run_encode(&self, buyer: &str, metadata: &EncoderLogicMetadata) -> EncodingResult<usize> {
        let program = self
            .store
            .get_encoder_program(buyer)?
            .ok_or_else(|| EncodingError::MissingProgram(buyer.to_string()))?;
        let argument = self.provider.get_signals(buyer)?;

        let payload = tokio::time::timeout(
            self.limits.script_timeout,
            self.engine
                .encode_argument(&program, &argument, self.limits.max_payload_size),
        )
        .await
        .map_err(|_| EncodingError::Timeout(self.limits.script_timeout))??;

        if payload.len() > self.limits.max_payload_size {
            return Err(EncodingError::PayloadTooLarge {
                size: payload.len(),
                max: self.limits.max_payload_size,
            });
        }

        let size = payload.len();
        self.store.put_encoded_payload(&EncodedPayload {
            buyer: buyer.to_string(),
            version: metadata.version,
            creation_time: self.clock.now_millis(),
            payload,
        })?;
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use signals_script::ScriptError;

    const OK_OUTPUT: &str = r#"{"status":0,"results":"0A1B"}"#;

    #[tokio::test]
    async fn encodes_and_stores_payload() {
        let fixture = Fixture::new(ScriptedSandbox::returning(OK_OUTPUT));
        fixture.register_encoder(BUYER, T0 - 100, 0);
        fixture.add_signal(BUYER, T0 - 50);

        let outcome = fixture.encoder.encode_buyer(BUYER).await.unwrap();
        assert!(matches!(outcome, EncodeOutcome::Encoded { version: 7, size: 2 }));

        let payload = fixture.store.get_encoded_payload(BUYER).unwrap().unwrap();
        assert_eq!(payload.payload, vec![0x0A, 0x1B]);
        assert_eq!(payload.version, 7);
        assert_eq!(payload.creation_time, T0);
    }

    #[tokio::test]
    async fn no_signals_removes_encoder_without_running_script() {
        let fixture = Fixture::new(ScriptedSandbox::returning(OK_OUTPUT));
        fixture.register_encoder(BUYER, T0 - 100, 0);

        let outcome = fixture.encoder.encode_buyer(BUYER).await.unwrap();
        assert!(matches!(outcome, EncodeOutcome::Skipped(SkipReason::NoSignals)));
        assert_eq!(fixture.sandbox.calls(), 0);
        assert!(fixture.store.get_encoder_metadata(BUYER).unwrap().is_none());
        assert!(fixture.store.get_encoder_program(BUYER).unwrap().is_none());
    }

    #[tokio::test]
    async fn unchanged_inputs_are_not_re_encoded() {
        let fixture = Fixture::new(ScriptedSandbox::returning(OK_OUTPUT));
        fixture.register_encoder(BUYER, T0 - 100, 0);
        fixture.add_signal(BUYER, T0 - 50);

        fixture.encoder.encode_buyer(BUYER).await.unwrap();
        let first = fixture.store.get_encoded_payload(BUYER).unwrap().unwrap();

        fixture.clock.advance(Duration::from_secs(60));
        let outcome = fixture.encoder.encode_buyer(BUYER).await.unwrap();
        assert!(matches!(outcome, EncodeOutcome::Skipped(SkipReason::UpToDate)));
        assert_eq!(fixture.sandbox.calls(), 1);
        assert_eq!(fixture.store.get_encoded_payload(BUYER).unwrap().unwrap(), first);
    }

    #[tokio::test]
    async fn newer_signals_trigger_re_encode() {
        let fixture = Fixture::new(ScriptedSandbox::returning(OK_OUTPUT));
        fixture.register_encoder(BUYER, T0 - 100, 0);
        fixture.add_signal(BUYER, T0 - 50);
        fixture.encoder.encode_buyer(BUYER).await.unwrap();

        fixture.add_signal(BUYER, T0 + 10);
        fixture.clock.advance(Duration::from_secs(60));
        let outcome = fixture.encoder.encode_buyer(BUYER).await.unwrap();
        assert!(matches!(outcome, EncodeOutcome::Encoded { .. }));
        assert_eq!(fixture.sandbox.calls(), 2);
    }

    #[tokio::test]
    async fn newer_encoder_triggers_re_encode() {
        let fixture = Fixture::new(ScriptedSandbox::returning(OK_OUTPUT));
        fixture.register_encoder(BUYER, T0 - 100, 0);
        fixture.add_signal(BUYER, T0 - 50);
        fixture.encoder.encode_buyer(BUYER).await.unwrap();

        fixture.register_encoder(BUYER, T0 + 10, 0);
        fixture.clock.advance(Duration::from_secs(60));
        let outcome = fixture.encoder.encode_buyer(BUYER).await.unwrap();
        assert!(matches!(outcome, EncodeOutcome::Encoded { .. }));
    }

    #[tokio::test]
    async fn circuit_open_skips_script_and_keeps_count() {
        let fixture = Fixture::new(ScriptedSandbox::returning(OK_OUTPUT));
        fixture.register_encoder(BUYER, T0 - 100, 3);
        fixture.add_signal(BUYER, T0 - 50);

        let outcome = fixture.encoder.encode_buyer(BUYER).await.unwrap();
        assert!(matches!(outcome, EncodeOutcome::Skipped(SkipReason::CircuitOpen)));
        assert_eq!(fixture.sandbox.calls(), 0);
        assert_eq!(
            fixture.store.get_encoder_metadata(BUYER).unwrap().unwrap().failed_encoding_count,
            3
        );
    }

    #[tokio::test]
    async fn failure_increments_count_and_stores_nothing() {
        let fixture = Fixture::new(ScriptedSandbox::returning(r#"{"status":1,"results":""}"#));
        fixture.register_encoder(BUYER, T0 - 100, 1);
        fixture.add_signal(BUYER, T0 - 50);

        let outcome = fixture.encoder.encode_buyer(BUYER).await.unwrap();
        assert!(matches!(
            outcome,
            EncodeOutcome::Failed(EncodingError::Script(ScriptError::NonZeroStatus { .. }))
        ));
        assert!(fixture.store.get_encoded_payload(BUYER).unwrap().is_none());
        assert_eq!(
            fixture.store.get_encoder_metadata(BUYER).unwrap().unwrap().failed_encoding_count,
            2
        );
    }

    #[tokio::test]
    async fn overlapping_failures_are_all_counted() {
        let fixture = Fixture::new(ScriptedSandbox::gated(r#"{"status":1,"results":""}"#));
        fixture.register_encoder(BUYER, T0 - 100, 0);
        fixture.add_signal(BUYER, T0 - 50);

        // Both encodes read the metadata before either records its failure.
        let release = async {
            while fixture.sandbox.calls() < 2 {
                tokio::task::yield_now().await;
            }
            fixture.sandbox.release();
            fixture.sandbox.release();
        };
        let (a, b, ()) = tokio::join!(
            fixture.encoder.encode_buyer(BUYER),
            fixture.encoder.encode_buyer(BUYER),
            release
        );

        assert!(matches!(a.unwrap(), EncodeOutcome::Failed(_)));
        assert!(matches!(b.unwrap(), EncodeOutcome::Failed(_)));
        assert_eq!(
            fixture.store.get_encoder_metadata(BUYER).unwrap().unwrap().failed_encoding_count,
            2
        );
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let fixture = Fixture::new(ScriptedSandbox::returning(OK_OUTPUT));
        fixture.register_encoder(BUYER, T0 - 100, 2);
        fixture.add_signal(BUYER, T0 - 50);

        fixture.encoder.encode_buyer(BUYER).await.unwrap();
        assert_eq!(
            fixture.store.get_encoder_metadata(BUYER).unwrap().unwrap().failed_encoding_count,
            0
        );
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected() {
        // Fixture limit is 4 bytes.
        let fixture = Fixture::new(ScriptedSandbox::returning(r#"{"status":0,"results":"0102030405"}"#));
        fixture.register_encoder(BUYER, T0 - 100, 0);
        fixture.add_signal(BUYER, T0 - 50);

        let outcome = fixture.encoder.encode_buyer(BUYER).await.unwrap();
        assert!(matches!(
            outcome,
            EncodeOutcome::Failed(EncodingError::PayloadTooLarge { size: 5, max: 4 })
        ));
        assert!(fixture.store.get_encoded_payload(BUYER).unwrap().is_none());
    }

    #[tokio::test]
    async fn slow_script_times_out() {
        let fixture = Fixture::new(ScriptedSandbox::slow(OK_OUTPUT, Duration::from_secs(5)));
        fixture.register_encoder(BUYER, T0 - 100, 0);
        fixture.add_signal(BUYER, T0 - 50);

        let outcome = fixture.encoder.encode_buyer(BUYER).await.unwrap();
        assert!(matches!(outcome, EncodeOutcome::Failed(EncodingError::Timeout(_))));
        assert_eq!(
            fixture.store.get_encoder_metadata(BUYER).unwrap().unwrap().failed_encoding_count,
            1
        );
    }

    #[tokio::test]
    async fn unknown_buyer_is_skipped() {
        let fixture = Fixture::new(ScriptedSandbox::returning(OK_OUTPUT));
        let outcome = fixture.encoder.encode_buyer("nobody.example").await.unwrap();
        assert!(matches!(outcome, EncodeOutcome::Skipped(SkipReason::NoEncoder)));
    }
}
