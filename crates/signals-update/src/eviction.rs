//! Per-buyer storage quota enforcement.
//!
//! Runs after the merge, before anything is written. Nothing happens until
//! a buyer's updated signal set crosses the oversubscription ceiling; then
//! evictors drop signals until the set fits the quota. Dropping a stored
//! signal adds it to `to_remove`; dropping a pending one takes it out of
//! `to_add`, so it is never written.

use signals_core::config::EvictionConfig;
use signals_core::Timestamp;
use signals_state::{PendingSignal, Signal};
use tracing::info;

use crate::output::UpdateOutput;

/// A member of the buyer's signal set as it will be after the update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdatedSignal {
    Stored(Signal),
    Pending {
        signal: PendingSignal,
        creation_time: Timestamp,
    },
}

impl UpdatedSignal {
    pub fn size_bytes(&self) -> usize {
        match self {
            UpdatedSignal::Stored(signal) => signal.size_bytes(),
            UpdatedSignal::Pending { signal, .. } => signal.size_bytes(),
        }
    }

    pub fn creation_time(&self) -> Timestamp {
        match self {
            UpdatedSignal::Stored(signal) => signal.creation_time,
            UpdatedSignal::Pending { creation_time, .. } => *creation_time,
        }
    }
}

/// Picks signals to drop.
pub trait SignalEvictor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Indexes into `updated` whose removal brings the total size to at
    /// most `target_bytes` (or as close as this strategy gets).
    fn select(&self, updated: &[UpdatedSignal], target_bytes: usize) -> Vec<usize>;
}

/// Oldest first. Ties keep list order, so stored signals go before pending
/// ones written at the same instant.
#[derive(Debug, Clone, Copy, Default)]
pub struct FifoSignalEvictor;

impl SignalEvictor for FifoSignalEvictor {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn select(&self, updated: &[UpdatedSignal], target_bytes: usize) -> Vec<usize> {
        let mut total: usize = updated.iter().map(UpdatedSignal::size_bytes).sum();
        let mut order: Vec<usize> = (0..updated.len()).collect();
        order.sort_by_key(|&index| updated[index].creation_time());

        let mut selected = Vec::new();
        for index in order {
            if total <= target_bytes {
                break;
            }
            total -= updated[index].size_bytes();
            selected.push(index);
        }
        selected
    }
}

pub struct SignalEvictionController {
    evictors: Vec<Box<dyn SignalEvictor>>,
    max_bytes: usize,
    oversubscription_bytes: usize,
}

impl SignalEvictionController {
    pub fn new(
        evictors: Vec<Box<dyn SignalEvictor>>,
        max_bytes: usize,
        oversubscription_bytes: usize,
    ) -> Self {
        Self {
            evictors,
            max_bytes,
            oversubscription_bytes,
        }
    }

    pub fn from_config(config: &EvictionConfig) -> Self {
        Self::new(
            vec![Box::new(FifoSignalEvictor)],
            config.max_size_per_buyer_bytes,
            config.max_oversubscription_per_buyer_bytes,
        )
    }

    /// Trim `updated` to quota, mirroring every drop into `output`.
    /// Returns how many signals were evicted.
    pub fn evict(&self, buyer: &str, updated: &mut Vec<UpdatedSignal>, output: &mut UpdateOutput) -> usize {
        let total = total_size(updated);
        if total <= self.oversubscription_bytes {
            return 0;
        }

        let mut evicted = 0;
        for evictor in &self.evictors {
            if total_size(updated) <= self.max_bytes {
                break;
            }
            let mut selected = evictor.select(updated, self.max_bytes);
            selected.sort_unstable();
            selected.dedup();
            for index in selected.into_iter().rev() {
                if index >= updated.len() {
                    continue;
                }
                match updated.remove(index) {
                    UpdatedSignal::Stored(signal) => output.remove(signal),
                    UpdatedSignal::Pending { signal, .. } => {
                        if let Some(position) = output.to_add.iter().position(|p| *p == signal) {
                            output.to_add.remove(position);
                        }
                    }
                }
                evicted += 1;
            }
            info!(
                %buyer,
                evictor = evictor.name(),
                evicted,
                before = total,
                after = total_size(updated),
                "signals evicted"
            );
        }
        evicted
    }
}

fn total_size(updated: &[UpdatedSignal]) -> usize {
    updated.iter().map(UpdatedSignal::size_bytes).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(id: u64, size: usize, creation_time: Timestamp) -> Signal {
        Signal {
            id,
            buyer: "buyer.example".to_string(),
            key: vec![id as u8],
            value: vec![0; size - 1],
            creation_time,
            package_name: "com.app".to_string(),
        }
    }

    fn pending(tag: u8, size: usize) -> PendingSignal {
        PendingSignal::new(vec![tag], vec![0; size - 1])
    }

    #[test]
    fn under_oversubscription_does_nothing() {
        let controller = SignalEvictionController::new(vec![Box::new(FifoSignalEvictor)], 10, 20);
        let mut updated = vec![UpdatedSignal::Stored(stored(1, 15, 1))];
        let mut output = UpdateOutput::default();
        assert_eq!(controller.evict("b", &mut updated, &mut output), 0);
        assert_eq!(updated.len(), 1);
    }

    #[test]
    fn evicts_oldest_stored_first() {
        let controller = SignalEvictionController::new(vec![Box::new(FifoSignalEvictor)], 10, 12);
        let mut updated = vec![
            UpdatedSignal::Stored(stored(2, 5, 20)),
            UpdatedSignal::Stored(stored(1, 5, 10)),
            UpdatedSignal::Pending {
                signal: pending(9, 5),
                creation_time: 30,
            },
        ];
        let mut output = UpdateOutput {
            to_add: vec![pending(9, 5)],
            ..UpdateOutput::default()
        };

        assert_eq!(controller.evict("b", &mut updated, &mut output), 1);
        let removed: Vec<u64> = output.to_remove.iter().map(|s| s.id).collect();
        assert_eq!(removed, vec![1]);
        assert_eq!(output.to_add.len(), 1);
        assert_eq!(updated.len(), 2);
    }

    #[test]
    fn evicted_pending_signal_leaves_to_add() {
        let controller = SignalEvictionController::new(vec![Box::new(FifoSignalEvictor)], 4, 4);
        let mut updated = vec![
            UpdatedSignal::Pending {
                signal: pending(1, 4),
                creation_time: 30,
            },
            UpdatedSignal::Pending {
                signal: pending(2, 4),
                creation_time: 30,
            },
        ];
        let mut output = UpdateOutput {
            to_add: vec![pending(1, 4), pending(2, 4)],
            ..UpdateOutput::default()
        };

        assert_eq!(controller.evict("b", &mut updated, &mut output), 1);
        assert_eq!(output.to_add, vec![pending(2, 4)]);
        assert!(output.to_remove.is_empty());
    }

    #[test]
    fn fifo_selects_until_target() {
        let updated = vec![
            UpdatedSignal::Stored(stored(1, 4, 30)),
            UpdatedSignal::Stored(stored(2, 4, 10)),
            UpdatedSignal::Stored(stored(3, 4, 20)),
        ];
        assert_eq!(FifoSignalEvictor.select(&updated, 4), vec![1, 2]);
        assert!(FifoSignalEvictor.select(&updated, 12).is_empty());
    }
}
