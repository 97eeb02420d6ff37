use crate::error::MarketError;
use crate::market::types::Candle;

/// How a live update was folded into the series.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveApplyOutcome {
    /// Same timestamp as the last bar: the still-open bar was replaced.
    ReplacedLast,
    /// Newer timestamp: the previous bar closed, a new one was appended.
    Appended,
    /// Older timestamp: out-of-order delivery, dropped without effect.
    Stale { update: i64, last: i64 },
}

/// The canonical ordered candle sequence for the active session.
///
/// Timestamps are strictly increasing at every observation point; only the
/// trailing bar may be replaced in place while it is still forming. Every
/// successful mutation bumps the revision counter, which is the controller's
/// cue to re-derive analytics.
#[derive(Debug, Default)]
pub struct CandleSeries {
    candles: Vec<Candle>,
    revision: u64,
}

fn validate_strictly_ascending(candles: &[Candle], context: &str) -> Result<(), MarketError> {
    for pair in candles.windows(2) {
        if pair[1].timestamp <= pair[0].timestamp {
            return Err(MarketError::InvalidSeries(format!(
                "{context}: timestamp {} does not increase over {}",
                pair[1].timestamp, pair[0].timestamp
            )));
        }
    }
    Ok(())
}

impl CandleSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    pub fn first_timestamp(&self) -> Option<i64> {
        self.candles.first().map(|c| c.timestamp)
    }

    /// Replaces the whole series with an already-ascending sequence.
    pub fn replace(&mut self, candles: Vec<Candle>) -> Result<(), MarketError> {
        validate_strictly_ascending(&candles, "replace")?;
        self.candles = candles;
        self.revision += 1;
        Ok(())
    }

    /// Inserts a strictly-older block before the current head. The block must
    /// be ascending and must end before the head's timestamp.
    pub fn prepend_history(&mut self, older: Vec<Candle>) -> Result<(), MarketError> {
        if older.is_empty() {
            return Ok(());
        }
        validate_strictly_ascending(&older, "prepend_history")?;

        if let Some(head) = self.candles.first() {
            let block_end = older[older.len() - 1].timestamp;
            if block_end >= head.timestamp {
                return Err(MarketError::Overlap {
                    block_end,
                    series_start: head.timestamp,
                });
            }
        }

        let mut merged = older;
        merged.append(&mut self.candles);
        self.candles = merged;
        self.revision += 1;
        Ok(())
    }

    /// Applies one live update per the open-bar rule: equal timestamp
    /// replaces the trailing bar, newer appends, older is dropped. Dropping a
    /// stale update is not an error and does not bump the revision.
    pub fn apply_live_update(&mut self, candle: Candle) -> LiveApplyOutcome {
        match self.candles.last() {
            Some(last) if candle.timestamp == last.timestamp => {
                let index = self.candles.len() - 1;
                self.candles[index] = candle;
                self.revision += 1;
                LiveApplyOutcome::ReplacedLast
            }
            Some(last) if candle.timestamp < last.timestamp => LiveApplyOutcome::Stale {
                update: candle.timestamp,
                last: last.timestamp,
            },
            _ => {
                self.candles.push(candle);
                self.revision += 1;
                LiveApplyOutcome::Appended
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(timestamp: i64, close: f64) -> Candle {
        Candle {
            timestamp,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: Some(1.0),
            turnover: None,
        }
    }

    fn ascending(timestamps: &[i64]) -> Vec<Candle> {
        timestamps.iter().map(|&t| candle(t, 100.0)).collect()
    }

    #[test]
    fn replace_accepts_ascending_series() {
        let mut series = CandleSeries::new();
        series.replace(ascending(&[1, 2, 3])).expect("valid series");

        assert_eq!(series.len(), 3);
        assert_eq!(series.revision(), 1);
    }

    #[test]
    fn replace_rejects_duplicate_timestamps() {
        let mut series = CandleSeries::new();
        let result = series.replace(ascending(&[1, 2, 2, 3]));

        assert!(matches!(result, Err(MarketError::InvalidSeries(_))));
        assert_eq!(series.revision(), 0);
    }

    #[test]
    fn replace_rejects_descending_input() {
        let mut series = CandleSeries::new();
        let result = series.replace(ascending(&[3, 2, 1]));
        assert!(matches!(result, Err(MarketError::InvalidSeries(_))));
    }

    #[test]
    fn prepend_inserts_older_block_before_head() {
        let mut series = CandleSeries::new();
        series.replace(ascending(&[10, 11, 12])).unwrap();
        series.prepend_history(ascending(&[7, 8, 9])).unwrap();

        let timestamps: Vec<i64> = series.candles().iter().map(|c| c.timestamp).collect();
        assert_eq!(timestamps, vec![7, 8, 9, 10, 11, 12]);
        assert_eq!(series.revision(), 2);
    }

    #[test]
    fn prepend_rejects_overlapping_block() {
        let mut series = CandleSeries::new();
        series.replace(ascending(&[10, 11, 12])).unwrap();
        let result = series.prepend_history(ascending(&[8, 9, 10]));

        assert!(matches!(
            result,
            Err(MarketError::Overlap {
                block_end: 10,
                series_start: 10
            })
        ));
        assert_eq!(series.len(), 3);
    }

    #[test]
    fn prepend_into_empty_series_behaves_like_replace() {
        let mut series = CandleSeries::new();
        series.prepend_history(ascending(&[1, 2])).unwrap();
        assert_eq!(series.len(), 2);
    }

    #[test]
    fn prepend_empty_block_is_a_no_op() {
        let mut series = CandleSeries::new();
        series.replace(ascending(&[10])).unwrap();
        series.prepend_history(Vec::new()).unwrap();
        assert_eq!(series.revision(), 1);
    }

    #[test]
    fn equal_timestamp_update_replaces_open_bar() {
        let mut series = CandleSeries::new();
        series.replace(ascending(&[1, 2, 3])).unwrap();

        let outcome = series.apply_live_update(candle(3, 250.0));
        assert_eq!(outcome, LiveApplyOutcome::ReplacedLast);
        assert_eq!(series.len(), 3);
        assert_eq!(series.last().unwrap().close, 250.0);
    }

    #[test]
    fn newer_timestamp_update_appends() {
        let mut series = CandleSeries::new();
        series.replace(ascending(&[1, 2, 3])).unwrap();

        let outcome = series.apply_live_update(candle(4, 110.0));
        assert_eq!(outcome, LiveApplyOutcome::Appended);
        assert_eq!(series.len(), 4);
    }

    #[test]
    fn older_timestamp_update_is_dropped() {
        let mut series = CandleSeries::new();
        series.replace(ascending(&[1, 2, 3])).unwrap();
        let revision = series.revision();

        let outcome = series.apply_live_update(candle(2, 110.0));
        assert_eq!(outcome, LiveApplyOutcome::Stale { update: 2, last: 3 });
        assert_eq!(series.len(), 3);
        assert_eq!(series.revision(), revision);
        assert_eq!(series.last().unwrap().close, 100.0);
    }

    #[test]
    fn live_update_is_idempotent() {
        let mut series = CandleSeries::new();
        series.replace(ascending(&[1, 2, 3])).unwrap();

        let update = candle(4, 120.0);
        series.apply_live_update(update.clone());
        let once: Vec<Candle> = series.candles().to_vec();

        series.apply_live_update(update);
        assert_eq!(series.candles(), once.as_slice());
    }

    #[test]
    fn first_update_into_empty_series_appends() {
        let mut series = CandleSeries::new();
        let outcome = series.apply_live_update(candle(1, 50.0));
        assert_eq!(outcome, LiveApplyOutcome::Appended);
        assert_eq!(series.len(), 1);
    }
}
