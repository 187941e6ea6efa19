//! signals-update — applying signal update documents to the store.
//!
//! An update document is a JSON object whose top-level keys name operations
//! (`put`, `append`, `remove`, ...). Each operation turns its value into a
//! partial [`UpdateOutput`]; the [`orchestrator`] merges them, rejects the
//! whole document if two operations touch the same signal key, trims the
//! result to the buyer's quota, and writes it in one transaction. Afterwards
//! it either handles an encoder registration or tries forced encoding.

pub mod encoder_event;
pub mod error;
pub mod eviction;
pub mod orchestrator;
pub mod output;
pub mod processors;

pub use encoder_event::{EncoderEventOutcome, UpdateEncoderEventHandler};
pub use error::{JsonProcessingStatus, UpdateError, UpdateResult};
pub use eviction::{FifoSignalEvictor, SignalEvictionController, SignalEvictor, UpdatedSignal};
pub use orchestrator::{UpdateProcessingOrchestrator, UpdateReport};
pub use output::{CurrentSignals, EncoderEvent, UpdateOutput};
pub use processors::UpdateOperation;
