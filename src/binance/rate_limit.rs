// =============================================================================
// Rate-Limit Tracker — keeps history requests under the Binance weight budget
// =============================================================================
//
// Binance allows 1200 request weight per minute per IP; we hard-cap ourselves
// at 1000. The tracker reads `X-MBX-USED-WEIGHT-1M` after every response and
// refuses a request that would cross the cap, which the retry layer then
// treats like any other transport failure.
//
// A reported weight only covers its one-minute window. Once a full window has
// passed without a fresh header the weight counts as zero again, otherwise a
// blocked tracker would never send the request that refreshes it.
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Hard ceiling at which we refuse to send additional requests.
const WEIGHT_HARD_LIMIT: u32 = 1000;
/// Soft warning threshold.
const WEIGHT_WARN_THRESHOLD: u32 = 800;
/// Length of the window `X-MBX-USED-WEIGHT-1M` refers to.
const WEIGHT_WINDOW: Duration = Duration::from_secs(60);

/// Request weight of `GET /api/v3/klines` for a given `limit`.
pub fn klines_weight(limit: u32) -> u32 {
    match limit {
        0..=99 => 1,
        100..=499 => 2,
        500..=1000 => 5,
        _ => 10,
    }
}

/// Tracker of the last reported 1-minute weight.
pub struct RateLimitTracker {
    used_weight_1m: AtomicU32,
    reported_at: Mutex<Option<Instant>>,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            used_weight_1m: AtomicU32::new(0),
            reported_at: Mutex::new(None),
        }
    }

    /// Update from the response headers of any Binance REST call.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        let Some(w) = headers
            .get("X-MBX-USED-WEIGHT-1M")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
        else {
            return;
        };

        *self.reported_at.lock() = Some(Instant::now());
        let prev = self.used_weight_1m.swap(w, Ordering::Relaxed);
        if w >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
            warn!(
                used_weight = w,
                hard_limit = WEIGHT_HARD_LIMIT,
                "rate-limit weight crossed warning threshold"
            );
        }
        debug!(used_weight_1m = w, "rate-limit weight updated from header");
    }

    /// `true` if `weight` more can be spent without crossing the hard cap.
    pub fn can_send_request(&self, weight: u32) -> bool {
        let current = self.used_weight();
        let allowed = current.saturating_add(weight) <= WEIGHT_HARD_LIMIT;
        if !allowed {
            warn!(
                current_weight = current,
                requested_weight = weight,
                hard_limit = WEIGHT_HARD_LIMIT,
                "request blocked — would exceed rate-limit"
            );
        }
        allowed
    }

    /// Last reported weight, or 0 once its window has run out.
    pub fn used_weight(&self) -> u32 {
        let mut reported_at = self.reported_at.lock();
        if let Some(at) = *reported_at {
            if at.elapsed() >= WEIGHT_WINDOW {
                *reported_at = None;
                let prev = self.used_weight_1m.swap(0, Ordering::Relaxed);
                if prev >= WEIGHT_WARN_THRESHOLD {
                    info!(previous_weight = prev, "rate-limit window expired, weight reset");
                }
            }
        }
        self.used_weight_1m.load(Ordering::Relaxed)
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("used_weight_1m", &self.used_weight())
            .finish()
    }
}
