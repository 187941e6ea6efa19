//! Encoder logic handler: downloading and storing buyer encoder programs.
//!
//! A buyer registers an endpoint; the handler fetches the program from it,
//! reads the version from a response header, and stores program and
//! metadata together. Refreshes for one buyer never overlap: a second
//! caller finds the buyer locked and returns without fetching.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use signals_core::{Clock, DevContext, Timestamp};
use signals_state::{EncoderLogicMetadata, StateStore};
use tracing::{debug, info, warn};

use crate::error::EncodingResult;

/// A downloaded encoder program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedEncoder {
    pub body: String,
    /// Response headers, names lower-cased.
    pub headers: HashMap<String, String>,
}

#[async_trait]
pub trait EncoderFetcher: Send + Sync {
    async fn fetch(&self, uri: &str, dev: DevContext) -> anyhow::Result<FetchedEncoder>;
}

pub struct EncoderLogicHandler {
    store: StateStore,
    fetcher: Arc<dyn EncoderFetcher>,
    clock: Arc<dyn Clock>,
    version_header: String,
    fallback_version: u64,
    in_flight: Mutex<HashSet<String>>,
}

/// Holds a buyer's refresh slot until dropped.
struct BuyerLock<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    buyer: String,
}

impl Drop for BuyerLock<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.buyer);
    }
}

impl EncoderLogicHandler {
    pub fn new(
        store: StateStore,
        fetcher: Arc<dyn EncoderFetcher>,
        clock: Arc<dyn Clock>,
        version_header: impl Into<String>,
        fallback_version: u64,
    ) -> Self {
        Self {
            store,
            fetcher,
            clock,
            version_header: version_header.into().to_ascii_lowercase(),
            fallback_version,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn try_lock(&self, buyer: &str) -> Option<BuyerLock<'_>> {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        in_flight.insert(buyer.to_string()).then(|| BuyerLock {
            in_flight: &self.in_flight,
            buyer: buyer.to_string(),
        })
    }

    /// Fetch the buyer's encoder from its registered endpoint and store it.
    ///
    /// Returns false when there is no endpoint, a refresh for the buyer is
    /// already running, or the download fails or comes back empty.
    pub async fn download_and_update(&self, buyer: &str, dev: DevContext) -> EncodingResult<bool> {
        let Some(_lock) = self.try_lock(buyer) else {
            debug!(%buyer, "encoder refresh already in flight");
            return Ok(false);
        };

        let Some(endpoint) = self.store.get_encoder_endpoint(buyer)? else {
            debug!(%buyer, "no encoder endpoint registered");
            return Ok(false);
        };

        let fetched = match self.fetcher.fetch(&endpoint.download_uri, dev).await {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!(%buyer, uri = %endpoint.download_uri, error = %e, "encoder download failed");
                return Ok(false);
            }
        };

        self.extract_and_persist(buyer, &fetched)
    }

    /// Store a fetched program. An empty body stores nothing.
    pub fn extract_and_persist(&self, buyer: &str, fetched: &FetchedEncoder) -> EncodingResult<bool> {
        if fetched.body.trim().is_empty() {
            warn!(%buyer, "downloaded encoder is empty");
            return Ok(false);
        }

        let version = self.version_from(&fetched.headers);
        let metadata = EncoderLogicMetadata {
            buyer: buyer.to_string(),
            version,
            creation_time: self.clock.now_millis(),
            failed_encoding_count: 0,
        };
        self.store.put_encoder(&metadata, &fetched.body)?;
        info!(%buyer, version, "encoder updated");
        Ok(true)
    }

    fn version_from(&self, headers: &HashMap<String, String>) -> u64 {
        headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(&self.version_header))
            .and_then(|(_, value)| value.trim().parse::<u64>().ok())
            .unwrap_or(self.fallback_version)
    }

    pub fn delete_encoder_for_buyer(&self, buyer: &str) -> EncodingResult<bool> {
        Ok(self.store.delete_encoder(buyer)?)
    }

    pub fn buyers_with_encoders(&self) -> EncodingResult<Vec<String>> {
        Ok(self.store.buyers_with_encoders()?)
    }

    /// Buyers whose encoder was stored before `time`.
    pub fn buyers_with_stale_encoders(&self, time: Timestamp) -> EncodingResult<Vec<String>> {
        Ok(self.store.buyers_with_encoders_before(time)?)
    }
}
