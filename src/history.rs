// =============================================================================
// Authoritative History — fetcher seam and bounded exponential retry
// =============================================================================
//
// Every history request made by the reconciler goes through
// `fetch_with_retry`. A failed attempt `n` (0-based) is followed by a wait of
// `2^n * base_delay`, with no jitter. With the defaults (5 attempts, 1 s base)
// the worst case is 1 + 2 + 4 + 8 + 16 = 31 s before the error surfaces.
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::error::{HistoryFetchError, TransportError};
use crate::types::{Bar, CandleKey};

/// Source of authoritative closed bars.
#[async_trait]
pub trait HistoryFetcher: Send + Sync {
    /// Return up to `count` bars for `pair`/`interval`, ascending by start
    /// time. With `end_time` set, only bars starting at or before it.
    async fn fetch_historical(
        &self,
        pair: &str,
        interval: &str,
        count: u32,
        end_time: Option<i64>,
    ) -> Result<Vec<Bar>, TransportError>;
}

/// Attempt budget and backoff base for history requests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Wait that follows the failed attempt with 0-based index `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Total time spent waiting when every attempt fails.
    #[cfg(test)]
    pub fn worst_case_wait(&self) -> Duration {
        (0..self.attempts()).map(|a| self.delay_for(a)).sum()
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Run one history request under `policy`.
pub async fn fetch_with_retry(
    fetcher: &dyn HistoryFetcher,
    policy: &RetryPolicy,
    key: &CandleKey,
    count: u32,
    end_time: Option<i64>,
) -> Result<Vec<Bar>, HistoryFetchError> {
    let attempts = policy.attempts();
    let mut attempt = 0;

    loop {
        match fetcher
            .fetch_historical(&key.symbol, &key.interval, count, end_time)
            .await
        {
            Ok(bars) => {
                debug!(key = %key, count, ?end_time, received = bars.len(), attempt = attempt + 1, "history fetched");
                return Ok(bars);
            }
            Err(err) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    key = %key,
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "history fetch failed, backing off"
                );
                tokio::time::sleep(delay).await;

                attempt += 1;
                if attempt >= attempts {
                    error!(key = %key, attempts, error = %err, "history fetch retries exhausted");
                    return Err(HistoryFetchError::Exhausted {
                        attempts,
                        last_error: err,
                    });
                }
            }
        }
    }
}
