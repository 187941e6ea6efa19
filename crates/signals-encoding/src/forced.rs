//! Forced encoding: re-encode a buyer right after its signals changed.
//!
//! Gated by a cooldown so a burst of updates does not re-run the encoder
//! every time. Which implementation runs is decided once at construction.

use std::sync::Arc;

use async_trait::async_trait;
use signals_core::config::ForcedEncodingConfig;
use signals_core::time::millis_before;
use signals_core::Clock;
use signals_state::StateStore;
use tracing::debug;

use crate::encoder::{BuyerEncoder, EncodeOutcome};
use crate::error::EncodingResult;

#[async_trait]
pub trait ForcedEncoder: Send + Sync {
    /// Encode `buyer` now if eligible. Returns true when a payload was stored.
    async fn force_encoding_if_eligible(&self, buyer: &str) -> EncodingResult<bool>;
}

pub struct ForcedEncoderImpl {
    store: StateStore,
    encoder: Arc<BuyerEncoder>,
    clock: Arc<dyn Clock>,
    cooldown: std::time::Duration,
}

impl ForcedEncoderImpl {
    pub fn new(
        store: StateStore,
        encoder: Arc<BuyerEncoder>,
        clock: Arc<dyn Clock>,
        cooldown: std::time::Duration,
    ) -> Self {
        Self {
            store,
            encoder,
            clock,
            cooldown,
        }
    }

    fn is_eligible(&self, buyer: &str) -> EncodingResult<bool> {
        if self.store.get_encoder_metadata(buyer)?.is_none() {
            return Ok(false);
        }
        match self.store.get_encoded_payload(buyer)? {
            None => Ok(self.store.has_signals_from_buyer(buyer)?),
            Some(payload) => {
                let cutoff = millis_before(self.clock.now_millis(), self.cooldown);
                Ok(payload.creation_time <= cutoff)
            }
        }
    }
}

#[async_trait]
impl ForcedEncoder for ForcedEncoderImpl {
    async fn force_encoding_if_eligible(&self, buyer: &str) -> EncodingResult<bool> {
        if !self.is_eligible(buyer)? {
            debug!(%buyer, "forced encoding not eligible");
            return Ok(false);
        }
        let outcome = self.encoder.encode_buyer(buyer).await?;
        debug!(%buyer, ?outcome, "forced encoding finished");
        Ok(matches!(outcome, EncodeOutcome::Encoded { .. }))
    }
}

/// Used when forced encoding is switched off.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpForcedEncoder;

#[async_trait]
impl ForcedEncoder for NoOpForcedEncoder {
    async fn force_encoding_if_eligible(&self, _buyer: &str) -> EncodingResult<bool> {
        Ok(false)
    }
}

pub fn forced_encoder_from_config(
    config: &ForcedEncodingConfig,
    store: StateStore,
    encoder: Arc<BuyerEncoder>,
    clock: Arc<dyn Clock>,
) -> Arc<dyn ForcedEncoder> {
    if config.enabled {
        Arc::new(ForcedEncoderImpl::new(store, encoder, clock, config.cooldown()))
    } else {
        Arc::new(NoOpForcedEncoder)
    }
}
