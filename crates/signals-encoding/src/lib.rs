//! signals-encoding — turning stored signals into encoded payloads.
//!
//! - [`provider`] reads a buyer's signals and renders the script argument
//! - [`logic`] downloads, stores, and deletes buyer encoder programs
//! - [`encoder`] decides whether one buyer needs encoding and runs it
//! - [`forced`] cooldown-gated encoding right after a signals update
//! - [`worker`] the singleton periodic job over every buyer with an encoder

pub mod encoder;
pub mod error;
pub mod forced;
pub mod logic;
pub mod provider;
pub mod stats;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use encoder::{BuyerEncoder, EncodeLimits, EncodeOutcome, SkipReason};
pub use error::{EncodingError, EncodingResult};
pub use forced::{ForcedEncoder, ForcedEncoderImpl, NoOpForcedEncoder, forced_encoder_from_config};
pub use logic::{EncoderFetcher, EncoderLogicHandler, FetchedEncoder};
pub use provider::SignalsProvider;
pub use stats::{EncodingRunStats, RunSource};
pub use worker::{PeriodicEncodingJobWorker, RunHandle};
