use crate::market::okx::CandleStream;
use crate::market::series::{CandleSeries, LiveApplyOutcome};
use crate::market::types::{now_unix_ms, Candle};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::MarketError;
use futures_util::StreamExt;

/// Why the router's drive loop returned.
#[derive(Debug)]
pub enum RouterExit {
    /// The session token fired; shut down cleanly.
    Cancelled,
    /// The feed closed its end of the stream.
    Ended,
    /// The stream yielded a transport or decode error.
    Failed(MarketError),
}

/// Folds live candle updates into the shared series and notifies the caller
/// after each effective mutation. Stale updates are dropped silently; the
/// series ordering invariant is never the feed's problem.
pub struct LiveRouter {
    series: Arc<Mutex<CandleSeries>>,
    last_applied_ms: AtomicI64,
}

impl LiveRouter {
    pub fn new(series: Arc<Mutex<CandleSeries>>) -> Self {
        Self {
            series,
            last_applied_ms: AtomicI64::new(0),
        }
    }

    /// Wall-clock time of the last effective apply, if any.
    pub fn last_applied_ms(&self) -> Option<i64> {
        match self.last_applied_ms.load(Ordering::Relaxed) {
            0 => None,
            at => Some(at),
        }
    }

    /// Applies a single update. Also the entry point for replaying a recent
    /// history page after a reconnect: replays hit the same open-bar rule, so
    /// already-known candles fold in as replacements or stale drops.
    pub fn apply(&self, candle: Candle) -> LiveApplyOutcome {
        let outcome = self.series.lock().apply_live_update(candle);
        if !matches!(outcome, LiveApplyOutcome::Stale { .. }) {
            self.last_applied_ms.store(now_unix_ms(), Ordering::Relaxed);
        }
        outcome
    }

    /// Drives the stream until cancellation, stream end, or a stream error.
    /// `on_mutation` runs after every update that changed the series.
    pub async fn run(
        &self,
        mut stream: CandleStream,
        cancel: &CancellationToken,
        on_mutation: &mut (dyn FnMut() + Send),
    ) -> RouterExit {
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return RouterExit::Cancelled,
                item = stream.next() => item,
            };

            let Some(result) = item else {
                return RouterExit::Ended;
            };

            match result {
                Ok(candle) => match self.apply(candle) {
                    LiveApplyOutcome::Stale { update, last } => {
                        trace!(update, last, "dropped stale live update");
                    }
                    _ => on_mutation(),
                },
                Err(error) => return RouterExit::Failed(error),
            }
        }
    }
}
