use thiserror::Error;

#[derive(Debug, Error)]
pub enum MarketError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid series: {0}")]
    InvalidSeries(String),
    #[error("history block overlaps series: block ends at {block_end}, series starts at {series_start}")]
    Overlap { block_end: i64, series_start: i64 },
    #[error("partial history: fetched {fetched} of {requested} backfill pages: {reason}")]
    PartialHistory {
        fetched: u32,
        requested: u32,
        reason: String,
    },
    #[error("fetch timed out after {0}ms")]
    FetchTimeout(u64),
    #[error("provider error {code}: {message}")]
    Provider { code: String, message: String },
    #[error("request error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("json decode error: {0}")]
    SimdJson(#[from] simd_json::Error),
    #[error("float parse error: {0}")]
    ParseFloat(#[from] std::num::ParseFloatError),
}

impl From<tokio_tungstenite::tungstenite::Error> for MarketError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(value))
    }
}
