//! Periodic encoding job worker.
//!
//! Walks every buyer with a registered encoder and encodes the ones that
//! need it, then refreshes encoders older than the refresh window. One
//! buyer's failure never stops the walk.
//!
//! At most one run is in flight per worker: triggering while a run is going
//! returns a handle to that run. `stop_work` asks the in-flight run to quit
//! between buyers; an encode already started finishes (bounded by the
//! script timeout).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use signals_core::time::millis_before;
use signals_core::{Clock, DevContext};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::encoder::{BuyerEncoder, EncodeOutcome};
use crate::error::{EncodingError, EncodingResult};
use crate::logic::EncoderLogicHandler;
use crate::stats::{EncodingRunStats, RunSource};

type RunOutcome = Result<EncodingRunStats, String>;

/// Handle to an in-flight or finished run.
#[derive(Clone)]
pub struct RunHandle {
    id: u64,
    outcome: watch::Receiver<Option<RunOutcome>>,
}

impl RunHandle {
    pub fn run_id(&self) -> u64 {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Wait for the run to finish.
    pub async fn wait(mut self) -> EncodingResult<EncodingRunStats> {
        let outcome = self
            .outcome
            .wait_for(Option::is_some)
            .await
            .map_err(|_| EncodingError::RunFailed("run task ended without a result".to_string()))?
            .clone();
        match outcome {
            Some(Ok(stats)) => Ok(stats),
            Some(Err(message)) => Err(EncodingError::RunFailed(message)),
            None => Err(EncodingError::RunFailed("run task ended without a result".to_string())),
        }
    }
}

struct ActiveRun {
    id: u64,
    stop: Arc<AtomicBool>,
    outcome: watch::Receiver<Option<RunOutcome>>,
}

impl ActiveRun {
    /// No outcome yet and the publishing task is still alive.
    fn in_flight(&self) -> bool {
        self.outcome.borrow().is_none() && self.outcome.has_changed().is_ok()
    }
}

struct WorkerInner {
    encoder: Arc<BuyerEncoder>,
    logic: Arc<EncoderLogicHandler>,
    clock: Arc<dyn Clock>,
    refresh_window: Duration,
    current: Mutex<Option<ActiveRun>>,
    next_run_id: AtomicU64,
}

/// Cloning shares the run slot.
#[derive(Clone)]
pub struct PeriodicEncodingJobWorker {
    inner: Arc<WorkerInner>,
}

impl PeriodicEncodingJobWorker {
    pub fn new(
        encoder: Arc<BuyerEncoder>,
        logic: Arc<EncoderLogicHandler>,
        clock: Arc<dyn Clock>,
        refresh_window: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                encoder,
                logic,
                clock,
                refresh_window,
                current: Mutex::new(None),
                next_run_id: AtomicU64::new(1),
            }),
        }
    }

    /// Start a run, or join the one already in flight.
    ///
    /// Must be called from within a tokio runtime.
    pub fn encode_protected_signals(&self, source: RunSource) -> RunHandle {
        let mut current = self
            .inner
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(active) = current.as_ref()
            && active.in_flight()
        {
            debug!(run_id = active.id, "encoding run already in flight");
            return RunHandle {
                id: active.id,
                outcome: active.outcome.clone(),
            };
        }

        let id = self.inner.next_run_id.fetch_add(1, Ordering::SeqCst);
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = watch::channel(None);
        *current = Some(ActiveRun {
            id,
            stop: stop.clone(),
            outcome: rx.clone(),
        });
        drop(current);

        // The run executes in its own task so a panic surfaces here as a
        // `JoinError` and the slot is still released.
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let run_inner = inner.clone();
            let run = tokio::spawn(async move {
                run_inner.run(id, source, &stop).await.map_err(|e| e.to_string())
            });
            let outcome = match run.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(run_id = id, error = %e, "encoding run aborted");
                    Err(format!("run task aborted: {e}"))
                }
            };
            let _ = tx.send(Some(outcome));
            inner.release(id);
        });

        RunHandle { id, outcome: rx }
    }

    /// Ask the in-flight run, if any, to stop after the current buyer.
    pub fn stop_work(&self) -> bool {
        let current = self
            .inner
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match current.as_ref() {
            Some(active) => {
                active.stop.store(true, Ordering::SeqCst);
                info!(run_id = active.id, "encoding run stop requested");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(ActiveRun::in_flight)
    }

    /// Trigger a run every `interval` until `shutdown` flips.
    pub async fn run_periodically(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "encoding job started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let handle = self.encode_protected_signals(RunSource::Periodic);
                    tokio::select! {
                        result = handle.wait() => {
                            if let Err(e) = result {
                                tracing::error!(error = %e, "encoding run failed");
                            }
                        }
                        _ = shutdown.changed() => {
                            self.stop_work();
                            info!("encoding job shutting down");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("encoding job shutting down");
                    break;
                }
            }
        }
    }
}

impl WorkerInner {
    async fn run(&self, id: u64, source: RunSource, stop: &AtomicBool) -> EncodingResult<EncodingRunStats> {
        let started_at = self.clock.now_millis();
        let mut stats = EncodingRunStats::new(source, started_at);
        info!(run_id = id, ?source, "encoding run started");

        let buyers = self.logic.buyers_with_encoders()?;
        for buyer in &buyers {
            if stop.load(Ordering::SeqCst) {
                stats.stopped_early = true;
                break;
            }
            match self.encoder.encode_buyer(buyer).await {
                Ok(EncodeOutcome::Encoded { .. }) => stats.encoded += 1,
                Ok(EncodeOutcome::Skipped(reason)) => stats.record_skip(reason),
                Ok(EncodeOutcome::Failed(_)) => stats.failed += 1,
                Err(e) => {
                    warn!(%buyer, error = %e, "encoding decision failed");
                    stats.failed += 1;
                }
            }
        }

        if !stats.stopped_early {
            let cutoff = millis_before(self.clock.now_millis(), self.refresh_window);
            let stale = self.logic.buyers_with_stale_encoders(cutoff)?;
            for buyer in &stale {
                if stop.load(Ordering::SeqCst) {
                    stats.stopped_early = true;
                    break;
                }
                match self.logic.download_and_update(buyer, DevContext::disabled()).await {
                    Ok(true) => stats.encoders_refreshed += 1,
                    Ok(false) => stats.encoders_refresh_failed += 1,
                    Err(e) => {
                        warn!(%buyer, error = %e, "encoder refresh failed");
                        stats.encoders_refresh_failed += 1;
                    }
                }
            }
        }

        stats.finished_at = self.clock.now_millis();
        info!(
            run_id = id,
            buyers = buyers.len(),
            encoded = stats.encoded,
            failed = stats.failed,
            skipped = stats.skipped(),
            refreshed = stats.encoders_refreshed,
            stopped_early = stats.stopped_early,
            "encoding run finished"
        );
        Ok(stats)
    }

    /// Clear the slot if it still holds run `id`.
    fn release(&self, id: u64) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref().is_some_and(|active| active.id == id) {
            *current = None;
        }
    }
}
