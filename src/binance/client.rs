// =============================================================================
// Binance REST API Client — authoritative kline history
// =============================================================================
//
// Klines are public market data and need no signature. The API key, when
// configured, is sent as `X-MBX-APIKEY` so requests are attributed to the
// account, and is never logged or serialized.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use tracing::{debug, instrument, warn};

use super::rate_limit::{klines_weight, RateLimitTracker};
use crate::error::TransportError;
use crate::history::HistoryFetcher;
use crate::types::Bar;

/// Largest `limit` accepted by `/api/v3/klines`.
const MAX_KLINES_LIMIT: u32 = 1000;

/// Binance REST client for historical klines.
pub struct BinanceClient {
    base_url: String,
    client: reqwest::Client,
    rate_limit: RateLimitTracker,
}

impl BinanceClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new `BinanceClient`.
    ///
    /// # Arguments
    /// * `api_key`  — optional Binance API key (sent as a header).
    /// * `base_url` — REST root, e.g. `https://api.binance.com`.
    pub fn new(api_key: Option<&str>, base_url: impl Into<String>) -> Result<Self> {
        let mut default_headers = HeaderMap::new();
        if let Some(key) = api_key.filter(|k| !k.is_empty()) {
            let val = HeaderValue::from_str(key).context("BINANCE_API_KEY is not a valid header value")?;
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build reqwest client")?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        debug!(base_url = %base_url, "BinanceClient initialised");

        Ok(Self {
            base_url,
            client,
            rate_limit: RateLimitTracker::new(),
        })
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /api/v3/klines (public — no signature required).
    ///
    /// With `end_time`, Binance returns the `limit` klines whose open time is
    /// at or before it. The open (unfinished) kline is included when it falls
    /// inside the window.
    #[instrument(skip(self), name = "binance::get_klines")]
    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
        end_time: Option<i64>,
    ) -> Result<Vec<Bar>, TransportError> {
        let limit = effective_limit(limit);
        if !self.rate_limit.can_send_request(klines_weight(limit)) {
            return Err(TransportError::RateLimited {
                used_weight: self.rate_limit.used_weight(),
            });
        }

        let mut query: Vec<(&str, String)> = vec![
            ("symbol", symbol.to_string()),
            ("interval", interval.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(end) = end_time {
            query.push(("endTime", end.to_string()));
        }

        let url = format!("{}/api/v3/klines", self.base_url);
        let resp = self.client.get(&url).query(&query).send().await?;

        self.rate_limit.update_from_headers(resp.headers());

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: serde_json::Value = resp.json().await?;
        let bars = parse_klines(&body)?;

        debug!(symbol, interval, count = bars.len(), "klines fetched");
        Ok(bars)
    }
}

#[async_trait]
impl HistoryFetcher for BinanceClient {
    async fn fetch_historical(
        &self,
        pair: &str,
        interval: &str,
        count: u32,
        end_time: Option<i64>,
    ) -> Result<Vec<Bar>, TransportError> {
        self.get_klines(pair, interval, count, end_time).await
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("rate_limit", &self.rate_limit)
            .finish()
    }
}

/// Clamp a requested count into what one klines call can return.
fn effective_limit(requested: u32) -> u32 {
    let limit = requested.clamp(1, MAX_KLINES_LIMIT);
    if limit != requested {
        warn!(requested, limit, "klines limit out of range, clamped");
    }
    limit
}

// -----------------------------------------------------------------------------
// Response parsing
// -----------------------------------------------------------------------------

/// Parse Binance's array-of-arrays klines response.
///
/// Array indices:
///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
///   [6] closeTime, [7] quoteAssetVolume, [8] numberOfTrades, ...
fn parse_klines(body: &serde_json::Value) -> Result<Vec<Bar>, TransportError> {
    let raw = body
        .as_array()
        .ok_or_else(|| TransportError::Decode("klines response is not an array".into()))?;

    let mut bars = Vec::with_capacity(raw.len());
    for entry in raw {
        let Some(arr) = entry.as_array().filter(|a| a.len() >= 6) else {
            warn!(entry = %entry, "skipping malformed kline entry");
            continue;
        };

        let start_time = arr[0]
            .as_i64()
            .ok_or_else(|| TransportError::Decode(format!("kline open time is not an integer: {}", arr[0])))?;

        bars.push(Bar::new(
            start_time,
            parse_str_f64(&arr[1])?,
            parse_str_f64(&arr[2])?,
            parse_str_f64(&arr[3])?,
            parse_str_f64(&arr[4])?,
            parse_str_f64(&arr[5])?,
        ));
    }

    bars.sort_by_key(|b| b.start_time);
    Ok(bars)
}

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_str_f64(val: &serde_json::Value) -> Result<f64, TransportError> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .map_err(|_| TransportError::Decode(format!("failed to parse '{s}' as f64")))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        Err(TransportError::Decode(format!("expected string or number, got: {val}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_klines_rows() {
        let body: serde_json::Value = serde_json::from_str(
            r#"[
                [1700000060000, "37010.0", "37020.0", "37000.0", "37015.5", "4.2", 1700000119999, "0", 10, "0", "0", "0"],
                [1700000000000, "37000.0", "37050.0", "36990.0", "37020.0", "12.5", 1700000059999, "0", 20, "0", "0", "0"]
            ]"#,
        )
        .unwrap();

        let bars = parse_klines(&body).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].start_time, 1_700_000_000_000);
        assert!((bars[0].high - 37050.0).abs() < f64::EPSILON);
        assert!((bars[1].close - 37015.5).abs() < f64::EPSILON);
    }

    #[test]
    fn skips_short_rows_and_rejects_bad_numbers() {
        let body: serde_json::Value =
            serde_json::from_str(r#"[[1, "1"], [0, "1", "2", "0.5", "1.5", "3"]]"#).unwrap();
        assert_eq!(parse_klines(&body).unwrap().len(), 1);

        let bad: serde_json::Value =
            serde_json::from_str(r#"[[0, "one", "2", "0.5", "1.5", "3"]]"#).unwrap();
        assert!(matches!(parse_klines(&bad), Err(TransportError::Decode(_))));
    }

    #[test]
    fn non_array_body_is_decode_error() {
        let body: serde_json::Value = serde_json::from_str(r#"{"code": -1121, "msg": "Invalid symbol."}"#).unwrap();
        assert!(matches!(parse_klines(&body), Err(TransportError::Decode(_))));
    }

    #[test]
    fn oversized_limit_is_clamped() {
        assert_eq!(effective_limit(5000), MAX_KLINES_LIMIT);
        assert_eq!(effective_limit(0), 1);
        assert_eq!(effective_limit(3), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_client_recovers_after_a_minute() {
        let client = BinanceClient::new(None, "http://127.0.0.1:9").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("X-MBX-USED-WEIGHT-1M", HeaderValue::from_static("1000"));
        client.rate_limit.update_from_headers(&headers);

        let blocked = client.get_klines("BTCUSDT", "1m", 2, None).await;
        assert_eq!(blocked, Err(TransportError::RateLimited { used_weight: 1000 }));

        tokio::time::advance(Duration::from_secs(61)).await;
        // Nothing listens on port 9: the request is sent and fails in transport.
        let sent = client.get_klines("BTCUSDT", "1m", 2, None).await;
        assert!(matches!(sent, Err(TransportError::Request(_))), "{sent:?}");
    }

    #[test]
    fn debug_redacts_key() {
        let client = BinanceClient::new(Some("secret-key"), "https://api.binance.com/").unwrap();
        let dbg = format!("{client:?}");
        assert!(!dbg.contains("secret-key"));
        assert!(dbg.contains("https://api.binance.com\""));
    }
}
