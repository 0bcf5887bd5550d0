pub mod candle_buffer;
pub mod kline_stream;

pub use candle_buffer::{BarState, CandleBuffer, CorrectionMode, IngestOutcome};
