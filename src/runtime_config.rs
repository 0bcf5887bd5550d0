// =============================================================================
// Runtime Configuration — service settings with atomic save
// =============================================================================
//
// Loaded from `runtime_config.json`, then overridden by environment variables
// (a `.env` file is honoured). All fields carry `#[serde(default)]` so that
// adding new fields never breaks loading an older config file.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::history::RetryPolicy;
use crate::types::CandleKey;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_publisher_topics() -> Vec<String> {
    vec!["BTCUSDT@1m".to_string(), "ETHUSDT@5m".to_string()]
}

fn default_pair() -> String {
    "BTCUSDT".to_string()
}

fn default_interval() -> String {
    "1m".to_string()
}

fn default_seed_count() -> u32 {
    3
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_retry_max_attempts() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_binance_rest_url() -> String {
    "https://api.binance.com".to_string()
}

fn default_binance_ws_url() -> String {
    "wss://stream.binance.com:9443".to_string()
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

// =============================================================================
// RuntimeConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Publisher ----------------------------------------------------------

    /// Series streamed by the publisher, as `"SYMBOL@interval"`.
    #[serde(default = "default_publisher_topics")]
    pub publisher_topics: Vec<String>,

    // --- Worker -------------------------------------------------------------

    /// Pair reconciled by the worker.
    #[serde(default = "default_pair")]
    pub pair: String,

    /// Kline interval reconciled by the worker (e.g. `1m`).
    #[serde(default = "default_interval")]
    pub interval: String,

    /// Bars loaded by the initial / lazy seed.
    #[serde(default = "default_seed_count")]
    pub seed_count: u32,

    /// Delay between two reads of the store.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    // --- History retry ------------------------------------------------------

    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    /// Backoff unit; attempt `n` waits `2^n` of these after failing.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    // --- Endpoints ----------------------------------------------------------

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    #[serde(default = "default_binance_rest_url")]
    pub binance_rest_url: String,

    #[serde(default = "default_binance_ws_url")]
    pub binance_ws_url: String,

    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            publisher_topics: default_publisher_topics(),
            pair: default_pair(),
            interval: default_interval(),
            seed_count: default_seed_count(),
            poll_interval_ms: default_poll_interval_ms(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            redis_url: default_redis_url(),
            binance_rest_url: default_binance_rest_url(),
            binance_ws_url: default_binance_ws_url(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            pair = %config.pair,
            interval = %config.interval,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration to `path` using an atomic write (write to
    /// `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Apply environment overrides. `lookup` is `std::env::var(..).ok()` in
    /// production.
    ///
    /// Recognised: `CANDLE_TOPICS`, `PAIR`, `INTERVAL`, `SEED_COUNT`,
    /// `POLL_INTERVAL_MS`, `REDIS_URL` (or `REDIS_HOST` + `REDIS_PORT`),
    /// `BINANCE_BASE_URL`, `BINANCE_WS_URL`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(topics) = non_empty("CANDLE_TOPICS") {
            self.publisher_topics = topics
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(pair) = non_empty("PAIR") {
            self.pair = pair.to_uppercase();
        }
        if let Some(interval) = non_empty("INTERVAL") {
            self.interval = interval;
        }
        if let Some(raw) = non_empty("SEED_COUNT") {
            match raw.parse() {
                Ok(n) => self.seed_count = n,
                Err(_) => warn!(value = %raw, "ignoring invalid SEED_COUNT"),
            }
        }
        if let Some(raw) = non_empty("POLL_INTERVAL_MS") {
            match raw.parse() {
                Ok(n) => self.poll_interval_ms = n,
                Err(_) => warn!(value = %raw, "ignoring invalid POLL_INTERVAL_MS"),
            }
        }

        if let Some(url) = non_empty("REDIS_URL") {
            self.redis_url = url;
        } else if let Some(host) = non_empty("REDIS_HOST") {
            let port = non_empty("REDIS_PORT").unwrap_or_else(|| "6379".to_string());
            self.redis_url = format!("redis://{host}:{port}");
        }

        if let Some(url) = non_empty("BINANCE_BASE_URL") {
            self.binance_rest_url = url;
        }
        if let Some(url) = non_empty("BINANCE_WS_URL") {
            self.binance_ws_url = url;
        }
    }

    /// Series reconciled by the worker.
    pub fn worker_key(&self) -> CandleKey {
        CandleKey::new(&self.pair, &self.interval)
    }

    /// Series streamed by the publisher.
    pub fn publisher_keys(&self) -> Result<Vec<CandleKey>> {
        self.publisher_topics
            .iter()
            .map(|t| t.parse::<CandleKey>().with_context(|| format!("invalid publisher topic {t:?}")))
            .collect()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}
