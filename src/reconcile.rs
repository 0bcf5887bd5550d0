// =============================================================================
// Reconciler — live bar stream against authoritative history
// =============================================================================
//
// Single-writer engine: the owning task calls `ingest` sequentially and is the
// only code that mutates the buffer. When a new bar starts, the previous bar
// is finalized and one correction fetch is spawned for it. The spawned task
// never touches the buffer; it reports back over a channel and the owner
// applies the result on its next `ingest` / `apply_pending_corrections`.
//
// Readers get copies: `snapshot()` clones, `subscribe()` hands out a watch
// receiver that sees an immutable `Arc<Vec<Bar>>` after every mutation.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

use crate::error::HistoryFetchError;
use crate::history::{fetch_with_retry, HistoryFetcher, RetryPolicy};
use crate::market_data::{CandleBuffer, CorrectionMode, IngestOutcome};
use crate::types::{fmt_ms, Bar, BarUpdate, CandleKey};

/// Bars requested per correction; the target is expected to be the last one.
const CORRECTION_FETCH_COUNT: u32 = 2;

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// Running totals for one reconciler, logged on shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub updates: u64,
    pub appends: u64,
    pub stale_dropped: u64,
    pub seeds: u64,
    pub seed_failures: u64,
    pub corrections_applied: u64,
    pub corrections_unmatched: u64,
    pub correction_failures: u64,
}

/// Result of one spawned correction task.
#[derive(Debug)]
struct CorrectionReport {
    start_time: i64,
    result: Result<Option<Bar>, HistoryFetchError>,
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

pub struct Reconciler {
    key: CandleKey,
    fetcher: Arc<dyn HistoryFetcher>,
    retry: RetryPolicy,
    default_seed_count: u32,
    buffer: CandleBuffer,
    in_flight: HashSet<i64>,
    tasks: JoinSet<()>,
    task_targets: HashMap<tokio::task::Id, i64>,
    reports_tx: mpsc::UnboundedSender<CorrectionReport>,
    reports_rx: mpsc::UnboundedReceiver<CorrectionReport>,
    snapshot_tx: watch::Sender<Arc<Vec<Bar>>>,
    stats: ReconcileStats,
}

impl Reconciler {
    pub fn new(
        key: CandleKey,
        fetcher: Arc<dyn HistoryFetcher>,
        retry: RetryPolicy,
        default_seed_count: u32,
    ) -> Self {
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            key,
            fetcher,
            retry,
            default_seed_count,
            buffer: CandleBuffer::new(),
            in_flight: HashSet::new(),
            tasks: JoinSet::new(),
            task_targets: HashMap::new(),
            reports_tx,
            reports_rx,
            snapshot_tx,
            stats: ReconcileStats::default(),
        }
    }

    pub fn key(&self) -> &CandleKey {
        &self.key
    }

    /// Owned copy of the buffer, oldest first.
    pub fn snapshot(&self) -> Vec<Bar> {
        self.buffer.bars()
    }

    /// Receiver that observes a fresh snapshot after every mutation.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<Bar>>> {
        self.snapshot_tx.subscribe()
    }

    /// Number of buffered bars.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[cfg(test)]
    pub fn bar_state(&self, start_time: i64) -> Option<crate::market_data::BarState> {
        self.buffer.get(start_time).map(|e| e.state)
    }

    pub fn pending_corrections(&self) -> usize {
        self.in_flight.len()
    }

    pub fn stats(&self) -> &ReconcileStats {
        &self.stats
    }

    // -------------------------------------------------------------------------
    // Seeding
    // -------------------------------------------------------------------------

    /// Load the last `count` authoritative bars and merge them into the
    /// buffer. On failure the buffer is left as it was.
    pub async fn seed(&mut self, count: u32) -> Result<usize, HistoryFetchError> {
        if count == 0 {
            return Err(HistoryFetchError::InvalidCount);
        }

        let fetched = match fetch_with_retry(self.fetcher.as_ref(), &self.retry, &self.key, count, None).await {
            Ok(bars) => bars,
            Err(e) => {
                self.stats.seed_failures += 1;
                return Err(e);
            }
        };

        let outcome = self.buffer.merge_authoritative(fetched);
        self.stats.seeds += 1;
        self.publish();

        info!(
            key = %self.key,
            requested = count,
            merged = outcome.merged,
            buffered = self.buffer.len(),
            "candle buffer seeded"
        );

        // History moved past the live tail: that bar closed without a newer
        // stream update and still holds stream values.
        if let Some(start_time) = outcome.demoted {
            self.schedule_correction(start_time);
        }
        Ok(outcome.merged)
    }

    // -------------------------------------------------------------------------
    // Ingest
    // -------------------------------------------------------------------------

    /// Apply one stream update. Never fails; history errors are logged.
    pub async fn ingest(&mut self, update: &BarUpdate) -> IngestOutcome {
        self.apply_pending_corrections();

        if self.buffer.is_empty() {
            if let Err(e) = self.seed(self.default_seed_count).await {
                warn!(key = %self.key, error = %e, "lazy seed failed, continuing with stream data only");
            }
        }

        let outcome = self.buffer.apply(update);
        match outcome {
            IngestOutcome::Updated => {
                self.stats.updates += 1;
            }
            IngestOutcome::Appended { finalized } => {
                self.stats.appends += 1;
                debug!(key = %self.key, start = %fmt_ms(update.start_time), "new bar started");
                if let Some(start_time) = finalized {
                    self.schedule_correction(start_time);
                }
            }
            IngestOutcome::Stale => {
                self.stats.stale_dropped += 1;
                debug!(
                    key = %self.key,
                    start = %fmt_ms(update.start_time),
                    last = ?self.buffer.last().map(|e| e.bar.start_time),
                    "stale update dropped"
                );
                return outcome;
            }
        }

        self.publish();
        outcome
    }

    // -------------------------------------------------------------------------
    // Correction
    // -------------------------------------------------------------------------

    /// Fetch authoritative values for `start_time` and overwrite the buffered
    /// bar. Returns whether a bar was changed.
    pub async fn correct(&mut self, start_time: i64) -> Result<bool, HistoryFetchError> {
        let found = fetch_correction(self.fetcher.as_ref(), &self.retry, &self.key, start_time).await?;

        let Some(bar) = found else {
            self.stats.corrections_unmatched += 1;
            info!(key = %self.key, start = %fmt_ms(start_time), "no authoritative bar for correction");
            return Ok(false);
        };

        let applied = self.buffer.apply_correction(&bar, CorrectionMode::Forced);
        if applied {
            self.stats.corrections_applied += 1;
            self.publish();
        }
        Ok(applied)
    }

    /// Apply every correction result that has arrived so far.
    pub fn apply_pending_corrections(&mut self) -> usize {
        while let Some(joined) = self.tasks.try_join_next() {
            self.reap(joined);
        }

        let mut handled = 0;
        while let Ok(report) = self.reports_rx.try_recv() {
            self.handle_report(report);
            handled += 1;
        }
        if handled > 0 {
            self.publish();
        }
        handled
    }

    /// Wait for all spawned corrections to finish and apply their results.
    pub async fn wait_for_corrections(&mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            self.reap(joined);
        }
        self.apply_pending_corrections();
    }

    /// A task that finished normally has already sent its report. One that
    /// panicked or was cancelled never will, so release its target here.
    fn reap(&mut self, joined: Result<(), JoinError>) {
        let Err(e) = joined else {
            return;
        };
        match self.task_targets.remove(&e.id()) {
            Some(start_time) => {
                self.in_flight.remove(&start_time);
                self.stats.correction_failures += 1;
                warn!(key = %self.key, start = %fmt_ms(start_time), error = %e, "correction task aborted");
            }
            None => warn!(key = %self.key, error = %e, "correction task aborted"),
        }
    }

    fn schedule_correction(&mut self, start_time: i64) {
        if !self.in_flight.insert(start_time) {
            return;
        }

        let fetcher = Arc::clone(&self.fetcher);
        let retry = self.retry;
        let key = self.key.clone();
        let tx = self.reports_tx.clone();

        debug!(key = %self.key, start = %fmt_ms(start_time), "correction scheduled");
        let handle = self.tasks.spawn(async move {
            let result = fetch_correction(fetcher.as_ref(), &retry, &key, start_time).await;
            // The receiver lives as long as the reconciler.
            let _ = tx.send(CorrectionReport { start_time, result });
        });
        self.task_targets.insert(handle.id(), start_time);
    }

    fn handle_report(&mut self, report: CorrectionReport) {
        self.in_flight.remove(&report.start_time);
        self.task_targets.retain(|_, target| *target != report.start_time);
        let start = fmt_ms(report.start_time);

        match report.result {
            Ok(Some(bar)) => {
                let before = self.buffer.get(bar.start_time).map(|e| e.bar);
                if self.buffer.apply_correction(&bar, CorrectionMode::Scheduled) {
                    self.stats.corrections_applied += 1;
                    info!(
                        key = %self.key,
                        start = %start,
                        provisional_close = ?before.map(|b| b.close),
                        close = bar.close,
                        "bar corrected from history"
                    );
                } else {
                    debug!(key = %self.key, start = %start, "correction target gone or already corrected");
                }
            }
            Ok(None) => {
                self.stats.corrections_unmatched += 1;
                info!(key = %self.key, start = %start, "history has no matching bar, keeping provisional value");
            }
            Err(e) => {
                self.stats.correction_failures += 1;
                warn!(key = %self.key, start = %start, error = %e, "correction fetch failed, keeping provisional value");
            }
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(Arc::new(self.buffer.bars()));
    }
}

/// Fetch the bars ending at `start_time` and pick the one that starts there.
async fn fetch_correction(
    fetcher: &dyn HistoryFetcher,
    retry: &RetryPolicy,
    key: &CandleKey,
    start_time: i64,
) -> Result<Option<Bar>, HistoryFetchError> {
    let bars = fetch_with_retry(fetcher, retry, key, CORRECTION_FETCH_COUNT, Some(start_time)).await?;
    Ok(bars.into_iter().rev().find(|b| b.start_time == start_time))
}
