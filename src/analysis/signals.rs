//! Trend classification, support/resistance levels, and advisory signal
//! generation derived from a series snapshot. Everything here is recomputed
//! wholesale after each series mutation; nothing is updated incrementally.

use crate::analysis::indicators::{
    bollinger_bands, ema, fibonacci_retracement, pivot_points, price_range, rsi, BollingerBands,
    FibonacciLevel, PivotPoints,
};
use crate::error::MarketError;
use crate::market::types::Candle;
use serde::{Deserialize, Serialize};

pub const DEFAULT_EMA_FAST_PERIOD: usize = 12;
pub const DEFAULT_EMA_SLOW_PERIOD: usize = 26;
pub const DEFAULT_RSI_PERIOD: usize = 14;
pub const DEFAULT_BOLLINGER_PERIOD: usize = 20;
pub const DEFAULT_BOLLINGER_STD_DEV: f64 = 2.0;
pub const DEFAULT_EMA_CONVERGENCE_THRESHOLD: f64 = 0.01;
pub const DEFAULT_RSI_NEUTRAL_LOW: f64 = 45.0;
pub const DEFAULT_RSI_NEUTRAL_HIGH: f64 = 55.0;

/// Tunable indicator parameters. The EMA convergence threshold is an absolute
/// price difference, so low-priced instruments want a smaller value than the
/// default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalysisParams {
    pub ema_fast_period: usize,
    pub ema_slow_period: usize,
    pub rsi_period: usize,
    pub bollinger_period: usize,
    pub bollinger_std_dev: f64,
    pub ema_convergence_threshold: f64,
    pub rsi_neutral_low: f64,
    pub rsi_neutral_high: f64,
}

impl Default for AnalysisParams {
    fn default() -> Self {
        Self {
            ema_fast_period: DEFAULT_EMA_FAST_PERIOD,
            ema_slow_period: DEFAULT_EMA_SLOW_PERIOD,
            rsi_period: DEFAULT_RSI_PERIOD,
            bollinger_period: DEFAULT_BOLLINGER_PERIOD,
            bollinger_std_dev: DEFAULT_BOLLINGER_STD_DEV,
            ema_convergence_threshold: DEFAULT_EMA_CONVERGENCE_THRESHOLD,
            rsi_neutral_low: DEFAULT_RSI_NEUTRAL_LOW,
            rsi_neutral_high: DEFAULT_RSI_NEUTRAL_HIGH,
        }
    }
}

impl AnalysisParams {
    pub fn validate(&self) -> Result<(), MarketError> {
        if self.ema_fast_period == 0
            || self.ema_slow_period == 0
            || self.rsi_period == 0
            || self.bollinger_period == 0
        {
            return Err(MarketError::InvalidArgument(
                "indicator periods must be at least 1".to_string(),
            ));
        }
        if self.ema_fast_period >= self.ema_slow_period {
            return Err(MarketError::InvalidArgument(
                "emaFastPeriod must be smaller than emaSlowPeriod".to_string(),
            ));
        }
        if !self.bollinger_std_dev.is_finite() || self.bollinger_std_dev <= 0.0 {
            return Err(MarketError::InvalidArgument(
                "bollingerStdDev must be finite and positive".to_string(),
            ));
        }
        if !self.ema_convergence_threshold.is_finite() || self.ema_convergence_threshold < 0.0 {
            return Err(MarketError::InvalidArgument(
                "emaConvergenceThreshold must be finite and non-negative".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&self.rsi_neutral_low)
            || !(0.0..=100.0).contains(&self.rsi_neutral_high)
            || self.rsi_neutral_low > self.rsi_neutral_high
        {
            return Err(MarketError::InvalidArgument(
                "rsiNeutral band must be an ordered pair within [0, 100]".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TrendAnalysis {
    Bullish,
    Bearish,
    Neutral,
}

fn is_range_bound(
    candles: &[Candle],
    last_fast: f64,
    last_slow: f64,
    last_rsi: f64,
    params: &AnalysisParams,
) -> bool {
    let Some(range) = price_range(candles) else {
        return false;
    };
    let current = candles[candles.len() - 1].close;

    let price_in_band = current >= range.low && current <= range.high;
    let emas_intertwined = (last_fast - last_slow).abs() < params.ema_convergence_threshold;
    let rsi_neutral =
        last_rsi >= params.rsi_neutral_low && last_rsi <= params.rsi_neutral_high;

    price_in_band && emas_intertwined && rsi_neutral
}

/// Classifies the current trend from the latest fast/slow EMA pair, after a
/// range-bound test. Returns `None` when the series is too short for a
/// well-defined RSI.
pub fn determine_trend(candles: &[Candle], params: &AnalysisParams) -> Option<TrendAnalysis> {
    if candles.len() <= params.rsi_period {
        return None;
    }

    let fast = ema(candles, params.ema_fast_period);
    let slow = ema(candles, params.ema_slow_period);
    let rsi_values = rsi(candles, params.rsi_period);

    let last_fast = *fast.last()?;
    let last_slow = *slow.last()?;
    let last_rsi = *rsi_values.last()?;

    if is_range_bound(candles, last_fast, last_slow, last_rsi, params) {
        return Some(TrendAnalysis::Neutral);
    }

    if last_fast > last_slow {
        Some(TrendAnalysis::Bullish)
    } else if last_fast < last_slow {
        Some(TrendAnalysis::Bearish)
    } else {
        Some(TrendAnalysis::Neutral)
    }
}

/// Immutable snapshot of the derived support/resistance structure.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportResistanceLevels {
    pub pivot_points: PivotPoints,
    pub fibonacci_levels: Vec<FibonacciLevel>,
    pub bollinger_bands: BollingerBands,
}

/// Derives pivot levels from the most recent candle, retracement levels from
/// the session range, and Bollinger bands over the configured window.
pub fn calculate_support_resistance(
    candles: &[Candle],
    params: &AnalysisParams,
) -> Option<SupportResistanceLevels> {
    let last = candles.last()?;
    let range = price_range(candles)?;

    Some(SupportResistanceLevels {
        pivot_points: pivot_points(last.high, last.low, last.close),
        fibonacci_levels: fibonacci_retracement(range.high, range.low),
        bollinger_bands: bollinger_bands(
            candles,
            params.bollinger_period,
            params.bollinger_std_dev,
        ),
    })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeAdvice {
    pub entry_points: Vec<String>,
    pub exit_points: Vec<String>,
}

fn fibonacci_price(levels: &[FibonacciLevel], label: &str) -> Option<f64> {
    levels
        .iter()
        .find(|level| level.label == label)
        .map(|level| level.price)
}

/// Advisory entry/exit hints from the latest close against the derived
/// levels. The conditions are independent; both lists may be non-empty at
/// once, or both empty.
pub fn generate_trade_advice(candles: &[Candle], levels: &SupportResistanceLevels) -> TradeAdvice {
    let mut advice = TradeAdvice::default();
    let Some(last) = candles.last() else {
        return advice;
    };
    let close = last.close;

    if close <= levels.pivot_points.support1 {
        advice
            .entry_points
            .push(format!("price {close} at or below support1 {}", levels.pivot_points.support1));
    }
    if let Some(price) = fibonacci_price(&levels.fibonacci_levels, "61.8%") {
        if close <= price {
            advice
                .entry_points
                .push(format!("price {close} at or below 61.8% retracement {price}"));
        }
    }
    if let Some(lower) = levels.bollinger_bands.lower.last() {
        if close <= *lower {
            advice
                .entry_points
                .push(format!("price {close} at or below lower Bollinger band {lower}"));
        }
    }

    if close >= levels.pivot_points.resistance1 {
        advice.exit_points.push(format!(
            "price {close} at or above resistance1 {}",
            levels.pivot_points.resistance1
        ));
    }
    if let Some(price) = fibonacci_price(&levels.fibonacci_levels, "23.6%") {
        if close >= price {
            advice
                .exit_points
                .push(format!("price {close} at or above 23.6% retracement {price}"));
        }
    }
    if let Some(upper) = levels.bollinger_bands.upper.last() {
        if close >= *upper {
            advice
                .exit_points
                .push(format!("price {close} at or above upper Bollinger band {upper}"));
        }
    }

    advice
}

/// Decimal digits of the first close, used by renderers to pick a price
/// precision. Computed synchronously from the snapshot.
pub fn derive_price_precision(candles: &[Candle]) -> Option<u8> {
    let first = candles.first()?;
    let rendered = format!("{}", first.close);
    let precision = rendered
        .split_once('.')
        .map(|(_, fraction)| fraction.len())
        .unwrap_or(0);
    Some(precision.min(u8::MAX as usize) as u8)
}

/// Everything derived from one series snapshot.
#[derive(Debug, Clone)]
pub struct Analytics {
    pub trend: Option<TrendAnalysis>,
    pub levels: Option<SupportResistanceLevels>,
    pub advice: Option<TradeAdvice>,
    pub price_precision: Option<u8>,
}

/// Full recomputation over the snapshot; O(n) and run after every mutation.
pub fn compute_analytics(candles: &[Candle], params: &AnalysisParams) -> Analytics {
    let trend = determine_trend(candles, params);
    let levels = calculate_support_resistance(candles, params);
    let advice = levels
        .as_ref()
        .map(|levels| generate_trade_advice(candles, levels));

    Analytics {
        trend,
        levels,
        advice,
        price_precision: derive_price_precision(candles),
    }
}
