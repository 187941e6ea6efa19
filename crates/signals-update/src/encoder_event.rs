//! Encoder events raised by update documents.

use std::sync::Arc;

use serde::Serialize;
use signals_core::{Clock, DevContext};
use signals_encoding::{EncoderLogicHandler, ForcedEncoder};
use signals_state::{EncoderEndpoint, StateStore};
use tracing::{debug, info};

use crate::error::UpdateResult;
use crate::output::EncoderEvent;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EncoderEventOutcome {
    /// A new encoder program was downloaded and stored.
    pub downloaded: bool,
    /// Forced encoding ran with the new program and stored a payload.
    pub forced: bool,
}

pub struct UpdateEncoderEventHandler {
    store: StateStore,
    logic: Arc<EncoderLogicHandler>,
    forced: Arc<dyn ForcedEncoder>,
    clock: Arc<dyn Clock>,
}

impl UpdateEncoderEventHandler {
    pub fn new(
        store: StateStore,
        logic: Arc<EncoderLogicHandler>,
        forced: Arc<dyn ForcedEncoder>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            logic,
            forced,
            clock,
        }
    }

    /// Register the endpoint, download the program behind it, and encode
    /// with it if the download stored anything.
    pub async fn handle(
        &self,
        buyer: &str,
        event: &EncoderEvent,
        dev: DevContext,
    ) -> UpdateResult<EncoderEventOutcome> {
        let EncoderEvent::Register { endpoint } = event;

        self.store.put_encoder_endpoint(&EncoderEndpoint {
            buyer: buyer.to_string(),
            download_uri: endpoint.clone(),
            creation_time: self.clock.now_millis(),
        })?;
        info!(%buyer, %endpoint, "encoder endpoint registered");

        let downloaded = self.logic.download_and_update(buyer, dev).await?;
        if !downloaded {
            debug!(%buyer, "no encoder stored for registered endpoint");
            return Ok(EncoderEventOutcome::default());
        }

        let forced = self.forced.force_encoding_if_eligible(buyer).await?;
        Ok(EncoderEventOutcome { downloaded, forced })
    }
}
