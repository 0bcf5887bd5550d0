// =============================================================================
// Worker — polls the latest-value store and drives the reconciler
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::market_data::IngestOutcome;
use crate::reconcile::Reconciler;
use crate::store::LatestValueStore;
use crate::types::{fmt_ms, BarUpdate};

/// What a single poll did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing stored under the topic yet.
    Empty,
    /// Payload failed validation and was discarded.
    Invalid,
    /// The store could not be read.
    StoreUnavailable,
    Ingested(IngestOutcome),
}

pub struct Worker {
    topic: String,
    store: Arc<dyn LatestValueStore>,
    reconciler: Reconciler,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(store: Arc<dyn LatestValueStore>, reconciler: Reconciler, poll_interval: Duration) -> Self {
        Self {
            topic: reconciler.key().topic(),
            store,
            reconciler,
            poll_interval,
        }
    }

    #[cfg(test)]
    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    #[cfg(test)]
    pub fn reconciler_mut(&mut self) -> &mut Reconciler {
        &mut self.reconciler
    }

    /// Read the topic once and feed a valid update to the reconciler.
    pub async fn poll_once(&mut self) -> PollOutcome {
        self.reconciler.apply_pending_corrections();

        let payload = match self.store.get(&self.topic).await {
            Ok(Some(p)) => p,
            Ok(None) => {
                debug!(topic = %self.topic, "no data in store yet");
                return PollOutcome::Empty;
            }
            Err(e) => {
                warn!(topic = %self.topic, error = %e, "store read failed");
                return PollOutcome::StoreUnavailable;
            }
        };

        let update = match BarUpdate::from_json(&payload) {
            Ok(u) => u,
            Err(e) => {
                warn!(topic = %self.topic, error = %e, "validation failed, skipping message");
                return PollOutcome::Invalid;
            }
        };

        let outcome = self.reconciler.ingest(&update).await;
        self.report(&update, outcome);
        PollOutcome::Ingested(outcome)
    }

    fn report(&self, update: &BarUpdate, outcome: IngestOutcome) {
        match outcome {
            IngestOutcome::Appended { .. } => info!(
                topic = %self.topic,
                start = %fmt_ms(update.start_time),
                open = update.open,
                high = update.high,
                low = update.low,
                close = update.close,
                bars = self.reconciler.len(),
                "bar opened"
            ),
            IngestOutcome::Updated => debug!(
                topic = %self.topic,
                close = update.close,
                closed = update.is_closed,
                "bar updated"
            ),
            IngestOutcome::Stale => {}
        }
    }

    /// Poll until `shutdown` flips to `true`, then wait for in-flight
    /// corrections.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Reconciler {
        info!(topic = %self.topic, poll_ms = self.poll_interval.as_millis() as u64, "worker started");
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(
            topic = %self.topic,
            pending = self.reconciler.pending_corrections(),
            "worker stopping, waiting for in-flight corrections"
        );
        self.reconciler.wait_for_corrections().await;
        info!(topic = %self.topic, stats = ?self.reconciler.stats(), "worker stopped");
        self.reconciler
    }
}
