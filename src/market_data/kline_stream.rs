// =============================================================================
// Kline Stream Publisher — Binance WebSocket → latest-value store
// =============================================================================
//
// Each raw kline message is validated into a `KlineEvent` and written, as
// JSON, under its `"{symbol}@{interval}"` topic. Invalid messages are logged
// and skipped; they never end the stream.
// =============================================================================

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::error::ValidationError;
use crate::store::LatestValueStore;
use crate::types::{CandleKey, KlineEvent};

/// Single-stream kline URL for one series.
pub fn kline_stream_url(ws_base: &str, key: &CandleKey) -> String {
    format!(
        "{}/ws/{}@kline_{}",
        ws_base.trim_end_matches('/'),
        key.symbol.to_lowercase(),
        key.interval
    )
}

/// Parse a kline message, either a direct single-stream payload or the
/// combined-stream envelope.
///
/// ```json
/// { "e": "kline", "E": 1700000001000, "s": "BTCUSDT", "k": { "t": ..., "x": false, ... } }
/// ```
pub fn parse_kline_event(text: &str) -> Result<KlineEvent, ValidationError> {
    let root: serde_json::Value = serde_json::from_str(text)?;

    let data = root.get("data").unwrap_or(&root);

    let event_time = data["E"].as_i64().ok_or(ValidationError::MissingField("E"))?;
    let k = data.get("k").ok_or(ValidationError::MissingField("k"))?;

    let symbol = k["s"]
        .as_str()
        .or_else(|| data["s"].as_str())
        .ok_or(ValidationError::MissingField("k.s"))?
        .to_uppercase();
    let interval = k["i"]
        .as_str()
        .ok_or(ValidationError::MissingField("k.i"))?
        .to_string();

    Ok(KlineEvent {
        event_time,
        symbol,
        interval,
        start_time: k["t"].as_i64().ok_or(ValidationError::MissingField("k.t"))?,
        end_time: k["T"].as_i64().ok_or(ValidationError::MissingField("k.T"))?,
        open: parse_string_f64(&k["o"], "k.o")?,
        close: parse_string_f64(&k["c"], "k.c")?,
        high: parse_string_f64(&k["h"], "k.h")?,
        low: parse_string_f64(&k["l"], "k.l")?,
        volume: parse_string_f64(&k["v"], "k.v")?,
        is_closed: k["x"].as_bool().ok_or(ValidationError::MissingField("k.x"))?,
    })
}

/// Binance sends numeric values as JSON strings inside kline objects.
fn parse_string_f64(val: &serde_json::Value, name: &'static str) -> Result<f64, ValidationError> {
    match val {
        serde_json::Value::String(s) => s.parse::<f64>().map_err(|_| ValidationError::InvalidField {
            field: name,
            value: s.clone(),
        }),
        serde_json::Value::Number(n) => n.as_f64().ok_or(ValidationError::InvalidField {
            field: name,
            value: n.to_string(),
        }),
        serde_json::Value::Null => Err(ValidationError::MissingField(name)),
        other => Err(ValidationError::InvalidField {
            field: name,
            value: other.to_string(),
        }),
    }
}

/// Validate one text frame and overwrite the store value for its topic.
/// Returns the topic written, or `None` when the frame was discarded.
pub async fn publish_frame(text: &str, store: &dyn LatestValueStore) -> Option<String> {
    let event = match parse_kline_event(text) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "discarding invalid kline message");
            return None;
        }
    };

    let topic = event.key().topic();
    let payload = match serde_json::to_string(&event) {
        Ok(p) => p,
        Err(e) => {
            error!(topic = %topic, error = %e, "failed to serialise kline event");
            return None;
        }
    };

    match store.set(&topic, &payload).await {
        Ok(()) => {
            debug!(topic = %topic, close = event.close, closed = event.is_closed, "kline published");
            Some(topic)
        }
        Err(e) => {
            error!(topic = %topic, error = %e, "failed to publish kline");
            None
        }
    }
}

/// Connect to the kline stream for `key` and publish every update.
///
/// Runs until the stream disconnects or errors, then returns so that the
/// caller can reconnect.
pub async fn run_kline_stream(key: &CandleKey, ws_base: &str, store: &dyn LatestValueStore) -> Result<()> {
    let url = kline_stream_url(ws_base, key);
    info!(url = %url, key = %key, "connecting to kline WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to kline WebSocket")?;

    info!(key = %key, "kline WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                publish_frame(&text, store).await;
            }
            // tungstenite answers pings itself.
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(key = %key, error = %e, "kline WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(key = %key, "kline WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::BarUpdate;

    const SINGLE: &str = r#"{
        "e": "kline", "E": 1700000001000, "s": "BTCUSDT",
        "k": {
            "t": 1700000000000, "T": 1700000059999, "s": "BTCUSDT", "i": "1m",
            "o": "37000.00", "h": "37050.00", "l": "36990.00", "c": "37020.00",
            "v": "123.456", "n": 1500, "x": false, "q": "4567890.12"
        }
    }"#;

    #[test]
    fn url_uses_lowercase_symbol() {
        let url = kline_stream_url("wss://stream.binance.com:9443/", &CandleKey::new("BTCUSDT", "1m"));
        assert_eq!(url, "wss://stream.binance.com:9443/ws/btcusdt@kline_1m");
    }

    #[test]
    fn parses_single_stream_message() {
        let event = parse_kline_event(SINGLE).expect("should parse");
        assert_eq!(event.symbol, "BTCUSDT");
        assert_eq!(event.interval, "1m");
        assert_eq!(event.event_time, 1_700_000_001_000);
        assert_eq!(event.end_time, 1_700_000_059_999);
        assert!((event.close - 37020.0).abs() < f64::EPSILON);
        assert!(!event.is_closed);
    }

    #[test]
    fn parses_combined_envelope() {
        let combined = format!(r#"{{ "stream": "btcusdt@kline_1m", "data": {SINGLE} }}"#);
        let event = parse_kline_event(&combined).unwrap();
        assert_eq!(event.start_time, 1_700_000_000_000);
    }

    #[test]
    fn rejects_missing_and_mistyped_fields() {
        let missing = SINGLE.replace(r#""x": false,"#, "");
        assert!(matches!(
            parse_kline_event(&missing),
            Err(ValidationError::MissingField("k.x"))
        ));

        let mistyped = SINGLE.replace(r#""c": "37020.00""#, r#""c": "n/a""#);
        assert!(matches!(
            parse_kline_event(&mistyped),
            Err(ValidationError::InvalidField { field: "k.c", .. })
        ));

        assert!(matches!(parse_kline_event("not json"), Err(ValidationError::Json(_))));
    }

    #[tokio::test]
    async fn publish_overwrites_topic_with_consumable_record() {
        let store = MemoryStore::new();

        assert_eq!(publish_frame(SINGLE, &store).await.as_deref(), Some("BTCUSDT@1m"));
        let closed = SINGLE.replace(r#""x": false"#, r#""x": true"#);
        publish_frame(&closed, &store).await;

        let payload = store.get("BTCUSDT@1m").await.unwrap().unwrap();
        let update = BarUpdate::from_json(&payload).unwrap();
        assert!(update.is_closed);
        assert_eq!(update.start_time, 1_700_000_000_000);
    }

    #[tokio::test]
    async fn invalid_frame_leaves_store_untouched() {
        let store = MemoryStore::new();
        assert_eq!(publish_frame(r#"{"e":"kline"}"#, &store).await, None);
        assert_eq!(store.get("BTCUSDT@1m").await.unwrap(), None);
    }
}
