// =============================================================================
// Shared types used across the candle sync service
// =============================================================================

use std::str::FromStr;

use chrono::DateTime;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// A single OHLCV candle keyed by its start time (milliseconds).
///
/// OHLC ordering (`low <= open, close <= high`) is expected but never checked;
/// well-typed but inconsistent bars are stored as received.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub start_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn new(start_time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            start_time,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Copy the OHLCV fields of `other` into `self`. The start time is the
    /// buffer key and never changes once a bar is stored.
    pub fn overwrite_prices(&mut self, other: &Bar) {
        self.open = other.open;
        self.high = other.high;
        self.low = other.low;
        self.close = other.close;
        self.volume = other.volume;
    }
}

impl From<&BarUpdate> for Bar {
    fn from(u: &BarUpdate) -> Self {
        Bar::new(u.start_time, u.open, u.high, u.low, u.close, u.volume)
    }
}

/// A bar update as consumed from the latest-value store.
///
/// Unknown fields in the stored JSON are ignored so that publishers may add
/// fields without breaking consumers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BarUpdate {
    pub start_time: i64,
    pub open: f64,
    pub close: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
    pub is_closed: bool,
}

impl BarUpdate {
    /// Validate a raw store payload into a `BarUpdate`.
    pub fn from_json(payload: &str) -> Result<Self, ValidationError> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// The record the publisher writes under `"{symbol}@{interval}"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KlineEvent {
    pub event_time: i64,
    pub symbol: String,
    pub interval: String,
    pub start_time: i64,
    pub end_time: i64,
    pub open: f64,
    pub close: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
    pub is_closed: bool,
}

impl KlineEvent {
    pub fn key(&self) -> CandleKey {
        CandleKey {
            symbol: self.symbol.clone(),
            interval: self.interval.clone(),
        }
    }
}

/// Composite key that identifies a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub interval: String,
}

impl CandleKey {
    pub fn new(symbol: impl Into<String>, interval: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into().trim().to_uppercase(),
            interval: interval.into().trim().to_string(),
        }
    }

    /// Store topic for this series.
    pub fn topic(&self) -> String {
        self.to_string()
    }
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

impl FromStr for CandleKey {
    type Err = ValidationError;

    /// Parse `"BTCUSDT@1m"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().split_once('@') {
            Some((symbol, interval)) if !symbol.trim().is_empty() && !interval.trim().is_empty() => {
                Ok(CandleKey::new(symbol, interval))
            }
            _ => Err(ValidationError::InvalidField {
                field: "topic",
                value: s.to_string(),
            }),
        }
    }
}

/// Render a millisecond timestamp for log output.
pub fn fmt_ms(ms: i64) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}
