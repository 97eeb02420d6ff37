use crate::error::MarketError;
use crate::market::okx::MarketDataSource;
use crate::market::types::{now_unix_ms, Candle, SessionConfig};
use std::time::Duration;
use tracing::{debug, warn};

/// Result of a backfill run. Accumulated candles are committed even when the
/// run aborted early; `degraded` then carries the partial-history error for
/// the caller to surface.
#[derive(Debug)]
pub struct BackfillOutcome {
    /// Ascending block, strictly older than the head cursor.
    pub candles: Vec<Candle>,
    pub pages_fetched: u32,
    pub degraded: Option<MarketError>,
}

fn is_strictly_ascending(candles: &[Candle]) -> bool {
    candles
        .windows(2)
        .all(|pair| pair[0].timestamp < pair[1].timestamp)
}

pub(crate) fn retry_delay(attempt: u32) -> Duration {
    let exponent = attempt.min(6);
    let base_ms = 200_u64.saturating_mul(1_u64 << exponent);
    let jitter_ms = (now_unix_ms().unsigned_abs() % 250).min(249);
    Duration::from_millis((base_ms + jitter_ms).min(5_000))
}

async fn fetch_page(
    source: &dyn MarketDataSource,
    config: &SessionConfig,
    limit: u16,
    before: Option<i64>,
) -> Result<Vec<Candle>, MarketError> {
    let deadline = Duration::from_millis(config.fetch_timeout_ms);
    match tokio::time::timeout(
        deadline,
        source.fetch_candles(&config.inst_id, config.timeframe, limit, before),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(MarketError::FetchTimeout(config.fetch_timeout_ms)),
    }
}

/// Fetches one page with a bounded timeout and bounded retry/backoff.
pub(crate) async fn fetch_page_with_retry(
    source: &dyn MarketDataSource,
    config: &SessionConfig,
    limit: u16,
    before: Option<i64>,
) -> Result<Vec<Candle>, MarketError> {
    let mut attempt = 0_u32;
    loop {
        match fetch_page(source, config, limit, before).await {
            Ok(page) => return Ok(page),
            Err(error) => {
                if attempt >= config.fetch_retries {
                    return Err(error);
                }
                attempt += 1;
                warn!(
                    inst_id = %config.inst_id,
                    attempt,
                    error = %error,
                    "page fetch failed, retrying"
                );
                tokio::time::sleep(retry_delay(attempt)).await;
            }
        }
    }
}

/// Extends the known series backward through `backfill_pages` strictly
/// sequential fetches. Each fetch requests candles strictly older than the
/// earliest timestamp known so far; its result is reversed to ascending and
/// prepended to the accumulator before the next cursor is taken. The merged
/// block is returned in one piece so the caller commits it with a single
/// prepend.
pub async fn backfill_history(
    source: &dyn MarketDataSource,
    config: &SessionConfig,
    head_timestamp: i64,
) -> BackfillOutcome {
    let mut accumulated: Vec<Candle> = Vec::new();
    let mut pages_fetched = 0_u32;
    let mut degraded = None;

    for _ in 0..config.backfill_pages {
        let cursor = accumulated
            .first()
            .map(|c| c.timestamp)
            .unwrap_or(head_timestamp);

        match fetch_page_with_retry(source, config, config.backfill_page_limit, Some(cursor)).await
        {
            Ok(page) => {
                if page.is_empty() {
                    debug!(cursor, "history exhausted, stopping backfill");
                    break;
                }

                let mut page = page;
                page.reverse();

                if !is_strictly_ascending(&page) {
                    warn!(cursor, "discarding malformed backfill page");
                    continue;
                }
                let block_end = page[page.len() - 1].timestamp;
                if block_end >= cursor {
                    let overlap = MarketError::Overlap {
                        block_end,
                        series_start: cursor,
                    };
                    warn!(error = %overlap, "discarding overlapping backfill page");
                    continue;
                }

                pages_fetched += 1;
                page.append(&mut accumulated);
                accumulated = page;
            }
            Err(error) => {
                degraded = Some(MarketError::PartialHistory {
                    fetched: pages_fetched,
                    requested: config.backfill_pages,
                    reason: error.to_string(),
                });
                break;
            }
        }
    }

    BackfillOutcome {
        candles: accumulated,
        pages_fetched,
        degraded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::{Instrument, SessionArgs, Timeframe};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    const STEP_MS: i64 = 60_000;

    fn candle(timestamp: i64) -> Candle {
        Candle {
            timestamp,
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.0,
            volume: Some(1.0),
            turnover: None,
        }
    }

    fn test_config() -> SessionConfig {
        SessionArgs {
            fetch_retries: Some(0),
            ..SessionArgs::default()
        }
        .normalize()
        .unwrap()
    }

    /// Serves a continuous minute series ending at `latest`, newest-first,
    /// strictly older than the cursor. Individual calls can be scripted to
    /// fail or to return an overlapping page.
    struct SyntheticSource {
        latest: i64,
        calls: AtomicU32,
        fail_on_call: Option<u32>,
        overlap_on_call: Option<u32>,
    }

    impl SyntheticSource {
        fn new(latest: i64) -> Self {
            Self {
                latest,
                calls: AtomicU32::new(0),
                fail_on_call: None,
                overlap_on_call: None,
            }
        }
    }

    #[async_trait]
    impl MarketDataSource for SyntheticSource {
        async fn fetch_candles(
            &self,
            _inst_id: &str,
            _timeframe: Timeframe,
            limit: u16,
            before: Option<i64>,
        ) -> Result<Vec<Candle>, MarketError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on_call == Some(call) {
                return Err(MarketError::FetchTimeout(10));
            }

            let end = before.unwrap_or(self.latest + STEP_MS);
            let start_offset = if self.overlap_on_call == Some(call) {
                // Misbehaving page: newest candle sits exactly on the cursor.
                0
            } else {
                1
            };

            let mut page = Vec::with_capacity(limit as usize);
            let mut t = end - start_offset * STEP_MS;
            for _ in 0..limit {
                page.push(candle(t));
                t -= STEP_MS;
            }
            Ok(page)
        }

        async fn fetch_instruments(&self) -> Result<Vec<Instrument>, MarketError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn accumulates_sequential_pages_in_ascending_order() {
        let head = 1_000 * STEP_MS;
        let source = SyntheticSource::new(head);
        let config = test_config();

        let outcome = backfill_history(&source, &config, head).await;

        assert_eq!(outcome.pages_fetched, config.backfill_pages);
        assert!(outcome.degraded.is_none());
        assert_eq!(
            outcome.candles.len(),
            config.backfill_pages as usize * config.backfill_page_limit as usize
        );
        assert!(is_strictly_ascending(&outcome.candles));
        assert!(outcome.candles.last().unwrap().timestamp < head);
    }

    #[tokio::test]
    async fn page_failure_commits_partial_progress() {
        let head = 1_000 * STEP_MS;
        let mut source = SyntheticSource::new(head);
        source.fail_on_call = Some(1);
        let config = test_config();

        let outcome = backfill_history(&source, &config, head).await;

        assert_eq!(outcome.pages_fetched, 1);
        assert_eq!(
            outcome.candles.len(),
            config.backfill_page_limit as usize
        );
        assert!(matches!(
            outcome.degraded,
            Some(MarketError::PartialHistory { fetched: 1, .. })
        ));
    }

    #[tokio::test]
    async fn overlapping_page_is_discarded_and_loop_continues() {
        let head = 1_000 * STEP_MS;
        let mut source = SyntheticSource::new(head);
        source.overlap_on_call = Some(0);
        let config = test_config();

        let outcome = backfill_history(&source, &config, head).await;

        // First page discarded, the two remaining iterations still run.
        assert_eq!(outcome.pages_fetched, config.backfill_pages - 1);
        assert!(outcome.degraded.is_none());
        assert!(is_strictly_ascending(&outcome.candles));
        assert!(outcome.candles.last().unwrap().timestamp < head);
    }

    #[tokio::test]
    async fn retries_before_surfacing_page_failure() {
        let head = 1_000 * STEP_MS;
        let mut source = SyntheticSource::new(head);
        source.fail_on_call = Some(0);
        let config = SessionArgs {
            fetch_retries: Some(2),
            ..SessionArgs::default()
        }
        .normalize()
        .unwrap();

        let outcome = backfill_history(&source, &config, head).await;

        // The first call fails, the retry succeeds; no degradation recorded.
        assert!(outcome.degraded.is_none());
        assert_eq!(outcome.pages_fetched, config.backfill_pages);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_fetch_surfaces_as_fetch_timeout() {
        struct HangingSource;

        #[async_trait]
        impl MarketDataSource for HangingSource {
            async fn fetch_candles(
                &self,
                _inst_id: &str,
                _timeframe: Timeframe,
                _limit: u16,
                _before: Option<i64>,
            ) -> Result<Vec<Candle>, MarketError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Vec::new())
            }

            async fn fetch_instruments(&self) -> Result<Vec<Instrument>, MarketError> {
                Ok(Vec::new())
            }
        }

        let config = test_config();
        let error = fetch_page_with_retry(&HangingSource, &config, 10, None)
            .await
            .expect_err("hung fetch must time out");
        assert!(matches!(error, MarketError::FetchTimeout(ms) if ms == config.fetch_timeout_ms));

        let outcome = backfill_history(&HangingSource, &config, 1_000 * STEP_MS).await;
        assert_eq!(outcome.pages_fetched, 0);
        assert!(outcome.candles.is_empty());
        match outcome.degraded {
            Some(MarketError::PartialHistory {
                fetched: 0, reason, ..
            }) => assert!(reason.contains("timed out")),
            other => panic!("expected partial history, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_page_stops_backfill_without_degradation() {
        struct EmptySource;

        #[async_trait]
        impl MarketDataSource for EmptySource {
            async fn fetch_candles(
                &self,
                _inst_id: &str,
                _timeframe: Timeframe,
                _limit: u16,
                _before: Option<i64>,
            ) -> Result<Vec<Candle>, MarketError> {
                Ok(Vec::new())
            }

            async fn fetch_instruments(&self) -> Result<Vec<Instrument>, MarketError> {
                Ok(Vec::new())
            }
        }

        let outcome = backfill_history(&EmptySource, &test_config(), 1_000 * STEP_MS).await;
        assert_eq!(outcome.pages_fetched, 0);
        assert!(outcome.candles.is_empty());
        assert!(outcome.degraded.is_none());
    }
}
