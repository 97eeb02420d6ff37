//! Streaming candle analytics for a single tradable instrument.
//!
//! A session merges an initial history page, a bounded sequence of older
//! backfill pages, and a live websocket feed into one gap-free ascending
//! candle series, then derives trend, support/resistance, and advisory
//! signals from every revision of that series.

pub mod analysis;
pub mod error;
pub mod market;

pub use analysis::signals::{AnalysisParams, TradeAdvice, TrendAnalysis};
pub use error::MarketError;
pub use market::session::SessionController;
pub use market::types::{AnalyticsSnapshot, Candle, SessionArgs, SessionPhase, Timeframe};
