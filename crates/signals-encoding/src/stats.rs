//! Per-run counters of the encoding job.

use serde::Serialize;
use signals_core::Timestamp;

use crate::encoder::SkipReason;

/// What triggered an encoding run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunSource {
    #[default]
    Periodic,
    OnDemand,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EncodingRunStats {
    pub source: RunSource,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    pub encoded: u32,
    pub failed: u32,
    pub skipped_no_signals: u32,
    pub skipped_up_to_date: u32,
    pub skipped_circuit_open: u32,
    pub skipped_no_encoder: u32,
    pub encoders_refreshed: u32,
    pub encoders_refresh_failed: u32,
    /// The run was asked to stop before finishing its buyer list.
    pub stopped_early: bool,
}

impl EncodingRunStats {
    pub fn new(source: RunSource, started_at: Timestamp) -> Self {
        Self {
            source,
            started_at,
            ..Self::default()
        }
    }

    pub fn record_skip(&mut self, reason: SkipReason) {
        match reason {
            SkipReason::NoSignals => self.skipped_no_signals += 1,
            SkipReason::UpToDate => self.skipped_up_to_date += 1,
            SkipReason::CircuitOpen => self.skipped_circuit_open += 1,
            SkipReason::NoEncoder => self.skipped_no_encoder += 1,
        }
    }

    pub fn skipped(&self) -> u32 {
        self.skipped_no_signals
            + self.skipped_up_to_date
            + self.skipped_circuit_open
            + self.skipped_no_encoder
    }
}
