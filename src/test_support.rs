// Test doubles shared by the unit tests.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::TransportError;
use crate::history::HistoryFetcher;
use crate::types::{Bar, BarUpdate};

/// Fetcher that replays queued responses and records every call as
/// `(count, end_time)`. An empty queue answers with a transport error.
#[derive(Default)]
pub struct ScriptedFetcher {
    responses: Mutex<VecDeque<Result<Vec<Bar>, TransportError>>>,
    calls: Mutex<Vec<(u32, Option<i64>)>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_ok(&self, bars: Vec<Bar>) {
        self.responses.lock().push_back(Ok(bars));
    }

    pub fn push_err(&self, err: TransportError) {
        self.responses.lock().push_back(Err(err));
    }

    pub fn calls(&self) -> Vec<(u32, Option<i64>)> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl HistoryFetcher for ScriptedFetcher {
    async fn fetch_historical(
        &self,
        _pair: &str,
        _interval: &str,
        count: u32,
        end_time: Option<i64>,
    ) -> Result<Vec<Bar>, TransportError> {
        self.calls.lock().push((count, end_time));
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Request("no scripted response".into())))
    }
}

pub fn bar(start_time: i64, close: f64) -> Bar {
    Bar::new(start_time, close, close + 1.0, close - 1.0, close, 10.0)
}

pub fn update(start_time: i64, close: f64, is_closed: bool) -> BarUpdate {
    BarUpdate {
        start_time,
        open: close,
        close,
        high: close + 1.0,
        low: close - 1.0,
        volume: 10.0,
        is_closed,
    }
}
