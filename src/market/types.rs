use crate::analysis::signals::{AnalysisParams, SupportResistanceLevels, TradeAdvice, TrendAnalysis};
use crate::error::MarketError;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub const DEFAULT_INST_ID: &str = "BTC-USDT-SWAP";
pub const DEFAULT_TIMEFRAME: Timeframe = Timeframe::M15;
pub const DEFAULT_HISTORY_LIMIT: u16 = 303;
pub const DEFAULT_BACKFILL_PAGES: u32 = 3;
pub const DEFAULT_BACKFILL_PAGE_LIMIT: u16 = 100;
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_FETCH_RETRIES: u32 = 3;
pub const MIN_HISTORY_LIMIT: u16 = 50;
pub const MAX_HISTORY_LIMIT: u16 = 1_000;
pub const MAX_BACKFILL_PAGES: u32 = 10;
pub const MIN_BACKFILL_PAGE_LIMIT: u16 = 10;
pub const MAX_BACKFILL_PAGE_LIMIT: u16 = 300;
pub const MIN_FETCH_TIMEOUT_MS: u64 = 1_000;
pub const MAX_FETCH_TIMEOUT_MS: u64 = 60_000;
pub const MAX_FETCH_RETRIES: u32 = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1H")]
    H1,
    #[serde(rename = "2H")]
    H2,
    #[serde(rename = "4H")]
    H4,
    #[serde(rename = "1D")]
    D1,
    #[serde(rename = "1W")]
    W1,
    #[serde(rename = "1M")]
    Mo1,
}

impl Timeframe {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M3 => "3m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1H",
            Self::H2 => "2H",
            Self::H4 => "4H",
            Self::D1 => "1D",
            Self::W1 => "1W",
            Self::Mo1 => "1M",
        }
    }

    pub fn duration_ms(self) -> i64 {
        match self {
            Self::M1 => 60_000,
            Self::M3 => 180_000,
            Self::M5 => 300_000,
            Self::M15 => 900_000,
            Self::M30 => 1_800_000,
            Self::H1 => 3_600_000,
            Self::H2 => 7_200_000,
            Self::H4 => 14_400_000,
            Self::D1 => 86_400_000,
            Self::W1 => 604_800_000,
            Self::Mo1 => 2_592_000_000,
        }
    }

    pub fn parse_str(value: &str) -> Result<Self, MarketError> {
        match value {
            "1m" => Ok(Self::M1),
            "3m" => Ok(Self::M3),
            "5m" => Ok(Self::M5),
            "15m" => Ok(Self::M15),
            "30m" => Ok(Self::M30),
            "1H" => Ok(Self::H1),
            "2H" => Ok(Self::H2),
            "4H" => Ok(Self::H4),
            "1D" => Ok(Self::D1),
            "1W" => Ok(Self::W1),
            "1M" => Ok(Self::Mo1),
            other => Err(MarketError::InvalidArgument(format!(
                "unknown timeframe '{other}'"
            ))),
        }
    }
}

/// One aggregated price bar. Timestamps are epoch milliseconds and act as the
/// unique ordering key within a series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turnover: Option<f64>,
}

/// Raw OKX candle row: an array of decimal strings,
/// `[ts, o, h, l, c, vol, volCcy, volCcyQuote, confirm]`.
/// Websocket rows may carry fewer trailing fields; the first five are required.
#[derive(Debug, Deserialize)]
pub struct CandleRowWire(pub Vec<String>);

impl CandleRowWire {
    pub fn into_candle(self) -> Result<Candle, MarketError> {
        let row = self.0;
        if row.len() < 5 {
            return Err(MarketError::InvalidArgument(format!(
                "candle row must have at least 5 fields, got {}",
                row.len()
            )));
        }

        let timestamp = row[0].parse::<i64>().map_err(|_| {
            MarketError::InvalidArgument(format!("candle timestamp '{}' is not an integer", row[0]))
        })?;
        let open = row[1].parse::<f64>()?;
        let high = row[2].parse::<f64>()?;
        let low = row[3].parse::<f64>()?;
        let close = row[4].parse::<f64>()?;

        if !open.is_finite() || !high.is_finite() || !low.is_finite() || !close.is_finite() {
            return Err(MarketError::InvalidArgument(
                "candle prices must be finite".to_string(),
            ));
        }

        let volume = match row.get(5) {
            Some(raw) if !raw.is_empty() => {
                let value = raw.parse::<f64>()?;
                if !value.is_finite() || value < 0.0 {
                    return Err(MarketError::InvalidArgument(
                        "candle volume must be finite and non-negative".to_string(),
                    ));
                }
                Some(value)
            }
            _ => None,
        };
        let turnover = match row.get(7) {
            Some(raw) if !raw.is_empty() => {
                let value = raw.parse::<f64>()?;
                if !value.is_finite() || value < 0.0 {
                    return Err(MarketError::InvalidArgument(
                        "candle turnover must be finite and non-negative".to_string(),
                    ));
                }
                Some(value)
            }
            _ => None,
        };

        Ok(Candle {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            turnover,
        })
    }
}

#[derive(Debug, Deserialize)]
struct LiveMessageWire {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Option<Vec<CandleRowWire>>,
}

/// Decodes one websocket payload into a candle update.
///
/// Returns `Ok(None)` for frames that carry no candle data: subscription
/// acknowledgements, channel events, and keepalive `pong` text.
pub fn parse_live_candle_payload(payload: &mut [u8]) -> Result<Option<Candle>, MarketError> {
    if payload == b"pong" {
        return Ok(None);
    }

    let wire: LiveMessageWire = simd_json::serde::from_slice(payload)?;
    if wire.event.as_deref() == Some("error") {
        return Err(MarketError::Provider {
            code: wire.code.unwrap_or_else(|| "unknown".to_string()),
            message: wire.msg.unwrap_or_default(),
        });
    }

    let Some(rows) = wire.data else {
        return Ok(None);
    };
    let Some(row) = rows.into_iter().next() else {
        return Ok(None);
    };
    row.into_candle().map(Some)
}

#[derive(Debug, Deserialize)]
pub struct InstrumentWire {
    #[serde(rename = "instId")]
    pub inst_id: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Instrument {
    pub inst_id: String,
    pub name: String,
}

impl From<InstrumentWire> for Instrument {
    fn from(value: InstrumentWire) -> Self {
        let name = value.inst_id.clone();
        Self {
            inst_id: value.inst_id,
            name,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Idle,
    Loading,
    Ready,
    Stopped,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionArgs {
    pub inst_id: Option<String>,
    pub timeframe: Option<Timeframe>,
    pub history_limit: Option<u16>,
    pub backfill_pages: Option<u32>,
    pub backfill_page_limit: Option<u16>,
    pub fetch_timeout_ms: Option<u64>,
    pub fetch_retries: Option<u32>,
    pub analysis: Option<AnalysisParams>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub inst_id: String,
    pub timeframe: Timeframe,
    pub history_limit: u16,
    pub backfill_pages: u32,
    pub backfill_page_limit: u16,
    pub fetch_timeout_ms: u64,
    pub fetch_retries: u32,
    pub analysis: AnalysisParams,
}

impl SessionArgs {
    pub fn normalize(self) -> Result<SessionConfig, MarketError> {
        let inst_id = self
            .inst_id
            .unwrap_or_else(|| DEFAULT_INST_ID.to_string())
            .trim()
            .to_ascii_uppercase();

        if inst_id.is_empty()
            || !inst_id
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '-')
        {
            return Err(MarketError::InvalidArgument(
                "instId must be non-empty alphanumeric ASCII with dashes".to_string(),
            ));
        }

        let timeframe = self.timeframe.unwrap_or(DEFAULT_TIMEFRAME);

        let history_limit = self.history_limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        if !(MIN_HISTORY_LIMIT..=MAX_HISTORY_LIMIT).contains(&history_limit) {
            return Err(MarketError::InvalidArgument(format!(
                "historyLimit must be between {MIN_HISTORY_LIMIT} and {MAX_HISTORY_LIMIT}"
            )));
        }

        let backfill_pages = self.backfill_pages.unwrap_or(DEFAULT_BACKFILL_PAGES);
        if backfill_pages > MAX_BACKFILL_PAGES {
            return Err(MarketError::InvalidArgument(format!(
                "backfillPages must be at most {MAX_BACKFILL_PAGES}"
            )));
        }

        let backfill_page_limit = self
            .backfill_page_limit
            .unwrap_or(DEFAULT_BACKFILL_PAGE_LIMIT);
        if !(MIN_BACKFILL_PAGE_LIMIT..=MAX_BACKFILL_PAGE_LIMIT).contains(&backfill_page_limit) {
            return Err(MarketError::InvalidArgument(format!(
                "backfillPageLimit must be between {MIN_BACKFILL_PAGE_LIMIT} and {MAX_BACKFILL_PAGE_LIMIT}"
            )));
        }

        let fetch_timeout_ms = self.fetch_timeout_ms.unwrap_or(DEFAULT_FETCH_TIMEOUT_MS);
        if !(MIN_FETCH_TIMEOUT_MS..=MAX_FETCH_TIMEOUT_MS).contains(&fetch_timeout_ms) {
            return Err(MarketError::InvalidArgument(format!(
                "fetchTimeoutMs must be between {MIN_FETCH_TIMEOUT_MS} and {MAX_FETCH_TIMEOUT_MS}"
            )));
        }

        let fetch_retries = self.fetch_retries.unwrap_or(DEFAULT_FETCH_RETRIES);
        if fetch_retries > MAX_FETCH_RETRIES {
            return Err(MarketError::InvalidArgument(format!(
                "fetchRetries must be at most {MAX_FETCH_RETRIES}"
            )));
        }

        let analysis = self.analysis.unwrap_or_default();
        analysis.validate()?;

        Ok(SessionConfig {
            inst_id,
            timeframe,
            history_limit,
            backfill_pages,
            backfill_page_limit,
            fetch_timeout_ms,
            fetch_retries,
            analysis,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub generation: u64,
    pub inst_id: String,
    pub timeframe: Timeframe,
    pub history_limit: u16,
    pub backfill_pages: u32,
}

impl SessionInfo {
    pub fn from_config(generation: u64, config: &SessionConfig) -> Self {
        Self {
            generation,
            inst_id: config.inst_id.clone(),
            timeframe: config.timeframe,
            history_limit: config.history_limit,
            backfill_pages: config.backfill_pages,
        }
    }
}

/// The published view of a session: the merged series plus everything derived
/// from it, recomputed wholesale after each mutation and tagged with the
/// generation it belongs to.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsSnapshot {
    pub generation: u64,
    pub phase: SessionPhase,
    pub inst_id: String,
    pub timeframe: Timeframe,
    pub candles: Vec<Candle>,
    pub trend: Option<TrendAnalysis>,
    pub levels: Option<SupportResistanceLevels>,
    pub advice: Option<TradeAdvice>,
    pub price_precision: Option<u8>,
    pub last_update_ms: Option<i64>,
    pub reason: Option<String>,
}

impl AnalyticsSnapshot {
    pub fn idle() -> Self {
        Self {
            generation: 0,
            phase: SessionPhase::Idle,
            inst_id: DEFAULT_INST_ID.to_string(),
            timeframe: DEFAULT_TIMEFRAME,
            candles: Vec::new(),
            trend: None,
            levels: None,
            advice: None,
            price_precision: None,
            last_update_ms: None,
            reason: Some("session idle".to_string()),
        }
    }
}

pub(crate) fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}
