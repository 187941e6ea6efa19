//! signals-state — embedded store for protected signals.
//!
//! Backed by [redb](https://docs.rs/redb), holds per-buyer signals, encoder
//! programs and their metadata, encoder endpoints, and encoded payloads.
//!
//! # Architecture
//!
//! Record types are JSON-serialized into redb's `&[u8]` value columns and
//! keyed by buyer. Signals use composite keys (`{buyer}/{id:020}`) so a
//! buyer's signals come back in insertion order.
//!
//! Every public operation is a single redb transaction, so a multi-record
//! change like [`StateStore::insert_and_delete`] is all-or-nothing.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
