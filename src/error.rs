// =============================================================================
// Error taxonomy
// =============================================================================
//
// ValidationError  — an inbound message failed the schema; drop it and go on.
// TransportError   — one history request failed; retried by the caller.
// HistoryFetchError — retries exhausted; terminal for seed / correct.
// StoreError       — the latest-value store could not be read or written.
// =============================================================================

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing field {0}")]
    MissingField(&'static str),

    #[error("field {field} has unexpected value: {value}")]
    InvalidField { field: &'static str, value: String },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("rate limit exceeded: used weight {used_weight}")]
    RateLimited { used_weight: u32 },

    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            TransportError::Decode(err.to_string())
        } else {
            TransportError::Request(err.to_string())
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HistoryFetchError {
    #[error("history fetch count must be at least 1")]
    InvalidCount,

    #[error("history fetch failed after {attempts} attempts: {last_error}")]
    Exhausted {
        attempts: u32,
        last_error: TransportError,
    },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}
