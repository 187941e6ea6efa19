//! signalsd — protected signals daemon.
//!
//! [`app::Signals`] wires the store, script engine, encoder handling,
//! forced encoding, update orchestrator and periodic job together;
//! [`fetch::HttpEncoderFetcher`] downloads encoder programs over HTTP/1 and TLS.

pub mod app;
pub mod fetch;

pub use app::Signals;
pub use fetch::HttpEncoderFetcher;
