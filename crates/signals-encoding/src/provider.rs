//! Signal provider: a buyer's stored signals in script-argument form.

use signals_core::KeyFormat;
use signals_script::{SignalsArgument, render_signals};
use signals_state::StateStore;

use crate::error::EncodingResult;

#[derive(Clone)]
pub struct SignalsProvider {
    store: StateStore,
    format: KeyFormat,
}

impl SignalsProvider {
    pub fn new(store: StateStore, format: KeyFormat) -> Self {
        Self { store, format }
    }

    /// Re-reads the store on every call.
    pub fn get_signals(&self, buyer: &str) -> EncodingResult<SignalsArgument> {
        let signals = self.store.get_signals_by_buyer(buyer)?;
        Ok(render_signals(&signals, self.format))
    }
}
