//! Pure indicator math over an ascending candle slice. Every function is
//! deterministic and allocation-bounded; none of them touch shared state.

use crate::market::types::Candle;
use serde::Serialize;

/// Exponential moving average, seeded with the first close so the output has
/// the same length as the input. Early values are not converged; consumers
/// must not treat them as such.
pub fn ema(candles: &[Candle], period: usize) -> Vec<f64> {
    if candles.is_empty() || period == 0 {
        return Vec::new();
    }

    let k = 2.0 / (period as f64 + 1.0);
    let mut values = Vec::with_capacity(candles.len());
    values.push(candles[0].close);

    for candle in &candles[1..] {
        let previous = values[values.len() - 1];
        values.push(candle.close * k + previous * (1.0 - k));
    }
    values
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    // Zero average loss means no down moves in the window; the ratio would be
    // infinite, so the oscillator saturates at 100 instead of going NaN.
    if avg_loss <= 0.0 {
        return 100.0;
    }
    100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
}

/// Relative strength index: arithmetic seed over the first `period` deltas,
/// Wilder smoothing afterwards. Requires more than `period` candles; returns
/// an empty vector otherwise.
pub fn rsi(candles: &[Candle], period: usize) -> Vec<f64> {
    if period == 0 || candles.len() <= period {
        return Vec::new();
    }

    let mut gains = Vec::with_capacity(candles.len() - 1);
    let mut losses = Vec::with_capacity(candles.len() - 1);
    for pair in candles.windows(2) {
        let difference = pair[1].close - pair[0].close;
        if difference >= 0.0 {
            gains.push(difference);
            losses.push(0.0);
        } else {
            gains.push(0.0);
            losses.push(-difference);
        }
    }

    let mut avg_gain = gains[..period].iter().sum::<f64>() / period as f64;
    let mut avg_loss = losses[..period].iter().sum::<f64>() / period as f64;

    let mut values = Vec::with_capacity(gains.len() - period + 1);
    values.push(rsi_value(avg_gain, avg_loss));

    for i in period..gains.len() {
        avg_gain = (avg_gain * (period as f64 - 1.0) + gains[i]) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + losses[i]) / period as f64;
        values.push(rsi_value(avg_gain, avg_loss));
    }

    values
}

/// Simple trailing mean; the first output corresponds to input index
/// `period - 1`.
pub fn sma(candles: &[Candle], period: usize) -> Vec<f64> {
    if period == 0 || candles.len() < period {
        return Vec::new();
    }

    let mut values = Vec::with_capacity(candles.len() - period + 1);
    let mut window_sum: f64 = candles[..period].iter().map(|c| c.close).sum();
    values.push(window_sum / period as f64);

    for i in period..candles.len() {
        window_sum += candles[i].close - candles[i - period].close;
        values.push(window_sum / period as f64);
    }
    values
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BollingerBands {
    pub upper: Vec<f64>,
    pub lower: Vec<f64>,
}

/// Volatility bands at SMA +/- `multiplier` population standard deviations
/// over the same trailing window.
pub fn bollinger_bands(candles: &[Candle], period: usize, multiplier: f64) -> BollingerBands {
    if period == 0 || candles.len() < period {
        return BollingerBands {
            upper: Vec::new(),
            lower: Vec::new(),
        };
    }

    let means = sma(candles, period);
    let mut upper = Vec::with_capacity(means.len());
    let mut lower = Vec::with_capacity(means.len());

    for (offset, mean) in means.iter().enumerate() {
        let window = &candles[offset..offset + period];
        let variance = window
            .iter()
            .map(|c| {
                let deviation = c.close - mean;
                deviation * deviation
            })
            .sum::<f64>()
            / period as f64;
        let std_dev = variance.sqrt();
        upper.push(mean + multiplier * std_dev);
        lower.push(mean - multiplier * std_dev);
    }

    BollingerBands { upper, lower }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PivotPoints {
    pub pivot: f64,
    pub resistance1: f64,
    pub support1: f64,
    pub resistance2: f64,
    pub support2: f64,
}

/// Classical pivot levels from the most recent swing's high/low/close.
pub fn pivot_points(high: f64, low: f64, close: f64) -> PivotPoints {
    let pivot = (high + low + close) / 3.0;
    PivotPoints {
        pivot,
        resistance1: 2.0 * pivot - low,
        support1: 2.0 * pivot - high,
        resistance2: pivot + (high - low),
        support2: pivot - (high - low),
    }
}

pub const FIBONACCI_RATIOS: [(&str, f64); 6] = [
    ("0%", 0.0),
    ("23.6%", 0.236),
    ("38.2%", 0.382),
    ("50%", 0.5),
    ("61.8%", 0.618),
    ("100%", 1.0),
];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FibonacciLevel {
    pub label: &'static str,
    pub price: f64,
}

/// Retracement levels mapped linearly between `high` (0%) and `low` (100%),
/// ordered from high to low.
pub fn fibonacci_retracement(high: f64, low: f64) -> Vec<FibonacciLevel> {
    FIBONACCI_RATIOS
        .iter()
        .map(|(label, ratio)| FibonacciLevel {
            label,
            price: high - (high - low) * ratio,
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceRange {
    pub high: f64,
    pub low: f64,
}

/// Session-wide high/low band.
pub fn price_range(candles: &[Candle]) -> Option<PriceRange> {
    if candles.is_empty() {
        return None;
    }
    let mut high = f64::MIN;
    let mut low = f64::MAX;
    for candle in candles {
        high = high.max(candle.high);
        low = low.min(candle.low);
    }
    Some(PriceRange { high, low })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                timestamp: (i as i64 + 1) * 60_000,
                open: close,
                high: close + 1.0,
                low: close - 1.0,
                close,
                volume: Some(1.0),
                turnover: None,
            })
            .collect()
    }

    #[test]
    fn ema_matches_input_length_and_seeds_with_first_close() {
        let candles = candles_from_closes(&[10.0, 11.0, 12.0, 11.5, 13.0]);
        let values = ema(&candles, 3);

        assert_eq!(values.len(), candles.len());
        assert_eq!(values[0], 10.0);
        // k = 0.5 for period 3: 11*0.5 + 10*0.5 = 10.5
        assert!((values[1] - 10.5).abs() < 1e-12);
    }

    #[test]
    fn ema_of_constant_series_is_constant() {
        let candles = candles_from_closes(&[5.0; 30]);
        let values = ema(&candles, 12);
        assert!(values.iter().all(|v| (v - 5.0).abs() < 1e-12));
    }

    #[test]
    fn rsi_stays_within_bounds() {
        let closes: Vec<f64> = (0..50)
            .map(|i| 100.0 + ((i * 7) % 13) as f64 - 6.0)
            .collect();
        let candles = candles_from_closes(&closes);
        let values = rsi(&candles, 14);

        assert!(!values.is_empty());
        assert!(values.iter().all(|v| (0.0..=100.0).contains(v)));
    }

    #[test]
    fn rsi_is_100_when_every_delta_is_a_gain() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        let candles = candles_from_closes(&closes);
        let values = rsi(&candles, 14);

        assert!(values.iter().all(|v| (*v - 100.0).abs() < 1e-12));
    }

    #[test]
    fn rsi_is_0_when_every_delta_is_a_loss() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 - i as f64).collect();
        let candles = candles_from_closes(&closes);
        let values = rsi(&candles, 14);

        assert!(values.iter().all(|v| v.abs() < 1e-12));
    }

    #[test]
    fn rsi_applies_zero_loss_policy_on_flat_series() {
        // All closes equal: average gain and loss are both zero, and the
        // defined policy yields 100 rather than NaN.
        let candles = candles_from_closes(&[10.0, 10.0, 10.0]);
        let values = rsi(&candles, 2);

        assert!(!values.is_empty());
        assert!(values.iter().all(|v| *v == 100.0));
    }

    #[test]
    fn rsi_requires_more_candles_than_period() {
        let candles = candles_from_closes(&[10.0, 11.0, 12.0]);
        assert!(rsi(&candles, 3).is_empty());
    }

    #[test]
    fn sma_aligns_first_output_at_period_minus_one() {
        let candles = candles_from_closes(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        let values = sma(&candles, 3);

        assert_eq!(values.len(), 3);
        assert!((values[0] - 2.0).abs() < 1e-12);
        assert!((values[2] - 4.0).abs() < 1e-12);
    }

    #[test]
    fn bollinger_bands_bracket_the_mean() {
        let closes: Vec<f64> = (0..30).map(|i| 50.0 + (i % 5) as f64).collect();
        let candles = candles_from_closes(&closes);
        let bands = bollinger_bands(&candles, 20, 2.0);
        let means = sma(&candles, 20);

        assert_eq!(bands.upper.len(), means.len());
        for i in 0..means.len() {
            assert!(bands.upper[i] >= means[i]);
            assert!(bands.lower[i] <= means[i]);
        }
    }

    #[test]
    fn bollinger_bands_collapse_on_constant_series() {
        let candles = candles_from_closes(&[7.0; 25]);
        let bands = bollinger_bands(&candles, 20, 2.0);

        assert!(bands.upper.iter().all(|v| (v - 7.0).abs() < 1e-12));
        assert!(bands.lower.iter().all(|v| (v - 7.0).abs() < 1e-12));
    }

    #[test]
    fn pivot_levels_are_ordered() {
        let levels = pivot_points(110.0, 90.0, 100.0);

        assert!(levels.support2 <= levels.support1);
        assert!(levels.support1 <= levels.pivot);
        assert!(levels.pivot <= levels.resistance1);
        assert!(levels.resistance1 <= levels.resistance2);
    }

    #[test]
    fn fibonacci_levels_decrease_from_high_to_low() {
        let levels = fibonacci_retracement(200.0, 100.0);

        assert_eq!(levels.first().unwrap().label, "0%");
        assert_eq!(levels.first().unwrap().price, 200.0);
        assert_eq!(levels.last().unwrap().label, "100%");
        assert_eq!(levels.last().unwrap().price, 100.0);
        for pair in levels.windows(2) {
            assert!(pair[0].price >= pair[1].price);
        }
    }

    #[test]
    fn price_range_spans_extremes() {
        let candles = candles_from_closes(&[10.0, 14.0, 8.0]);
        let range = price_range(&candles).expect("non-empty series has a range");

        assert_eq!(range.high, 15.0);
        assert_eq!(range.low, 7.0);
        assert!(price_range(&[]).is_none());
    }
}
