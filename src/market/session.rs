//! Session lifecycle: one live analysis session per controller, replaced
//! wholesale on instrument or timeframe switch. Each session carries a
//! generation token; snapshots from superseded generations are fenced off at
//! the publish point, so a slow old task can never overwrite a newer one.

use crate::analysis::signals::compute_analytics;
use crate::error::MarketError;
use crate::market::backfill::{backfill_history, fetch_page_with_retry, retry_delay};
use crate::market::live::{LiveRouter, RouterExit};
use crate::market::okx::{LiveFeed, MarketDataSource, OkxMarketData};
use crate::market::series::{CandleSeries, LiveApplyOutcome};
use crate::market::types::{
    now_unix_ms, AnalyticsSnapshot, Instrument, SessionArgs, SessionConfig, SessionInfo,
    SessionPhase,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct SessionHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

type CatalogCache = Arc<AsyncMutex<Option<Arc<Vec<Instrument>>>>>;

/// Publishes snapshots for exactly one generation. The generation fence is
/// checked under the watch channel's lock, the same lock the controller bumps
/// the generation under, so a superseded task's sends become silent no-ops
/// and can never land after the bump.
struct SessionPublisher {
    generation: u64,
    current: Arc<AtomicU64>,
    tx: watch::Sender<AnalyticsSnapshot>,
    config: SessionConfig,
}

impl SessionPublisher {
    fn publish(&self, phase: SessionPhase, series: &CandleSeries, reason: Option<String>) -> bool {
        if self.current.load(Ordering::SeqCst) != self.generation {
            return false;
        }

        let candles = series.candles().to_vec();
        let analytics = compute_analytics(&candles, &self.config.analysis);
        let snapshot = AnalyticsSnapshot {
            generation: self.generation,
            phase,
            inst_id: self.config.inst_id.clone(),
            timeframe: self.config.timeframe,
            candles,
            trend: analytics.trend,
            levels: analytics.levels,
            advice: analytics.advice,
            price_precision: analytics.price_precision,
            last_update_ms: Some(now_unix_ms()),
            reason,
        };

        let mut published = false;
        self.tx.send_if_modified(|slot| {
            if self.current.load(Ordering::SeqCst) != self.generation {
                return false;
            }
            *slot = snapshot;
            published = true;
            true
        });
        published
    }
}

/// Owns the active session task and the snapshot channel. Starting a session
/// bumps the generation, cancels the previous task, and awaits it before the
/// replacement is spawned, so at most one task drives the series at a time.
pub struct SessionController {
    source: Arc<dyn MarketDataSource>,
    feed: Arc<dyn LiveFeed>,
    generation: Arc<AtomicU64>,
    active: AsyncMutex<Option<SessionHandle>>,
    instruments: CatalogCache,
    snapshot_tx: watch::Sender<AnalyticsSnapshot>,
}

impl SessionController {
    pub fn new(source: Arc<dyn MarketDataSource>, feed: Arc<dyn LiveFeed>) -> Self {
        let (snapshot_tx, _) = watch::channel(AnalyticsSnapshot::idle());
        Self {
            source,
            feed,
            generation: Arc::new(AtomicU64::new(0)),
            active: AsyncMutex::new(None),
            instruments: Arc::new(AsyncMutex::new(None)),
            snapshot_tx,
        }
    }

    /// Controller backed by the OKX REST and websocket endpoints.
    pub fn okx() -> Self {
        let okx = Arc::new(OkxMarketData::default());
        Self::new(Arc::clone(&okx) as Arc<dyn MarketDataSource>, okx)
    }

    pub fn subscribe(&self) -> watch::Receiver<AnalyticsSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> AnalyticsSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    /// Tradable instrument catalog, fetched once and cached.
    pub async fn instruments(&self) -> Result<Arc<Vec<Instrument>>, MarketError> {
        let mut cache = self.instruments.lock().await;
        if let Some(catalog) = cache.as_ref() {
            return Ok(Arc::clone(catalog));
        }
        let catalog = Arc::new(self.source.fetch_instruments().await?);
        *cache = Some(Arc::clone(&catalog));
        Ok(catalog)
    }

    /// First catalog entry, for a cold start with no instrument chosen.
    /// `None` when the catalog is unavailable; the built-in default applies.
    async fn default_inst_id(&self) -> Option<String> {
        match self.instruments().await {
            Ok(catalog) => catalog.first().map(|i| i.inst_id.clone()),
            Err(err) => {
                warn!(error = %err, "catalog unavailable, using built-in default instrument");
                None
            }
        }
    }

    /// Starts a session for the given arguments, replacing any active one.
    /// The new generation is claimed before the old task is cancelled, so the
    /// old task is fenced out of the snapshot channel immediately.
    pub async fn start(&self, mut args: SessionArgs) -> Result<SessionInfo, MarketError> {
        if args.inst_id.is_none() {
            args.inst_id = self.default_inst_id().await;
        }
        let config = args.normalize()?;
        let mut active = self.active.lock().await;

        // The bump shares the watch channel's internal lock with the publish
        // path, so no superseded publisher can pass the fence after it.
        let mut generation = 0;
        self.snapshot_tx.send_if_modified(|_| {
            generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            false
        });
        if let Some(old) = active.take() {
            old.cancel.cancel();
            let _ = old.task.await;
        }

        info!(
            generation,
            inst_id = %config.inst_id,
            timeframe = config.timeframe.as_str(),
            "starting market session"
        );

        let cancel = CancellationToken::new();
        let publisher = SessionPublisher {
            generation,
            current: Arc::clone(&self.generation),
            tx: self.snapshot_tx.clone(),
            config: config.clone(),
        };
        let info = SessionInfo::from_config(generation, &config);
        let task = tokio::spawn(run_session(
            Arc::clone(&self.source),
            Arc::clone(&self.feed),
            config,
            publisher,
            cancel.clone(),
            Arc::clone(&self.instruments),
        ));
        *active = Some(SessionHandle { cancel, task });
        Ok(info)
    }

    /// Cancels the active session, if any, and waits for its task to finish.
    /// The generation is left in place so the task's final stopped snapshot
    /// passes the fence.
    pub async fn stop(&self) {
        let handle = self.active.lock().await.take();
        if let Some(handle) = handle {
            handle.cancel.cancel();
            let _ = handle.task.await;
        }
    }
}

async fn run_session(
    source: Arc<dyn MarketDataSource>,
    feed: Arc<dyn LiveFeed>,
    config: SessionConfig,
    publisher: SessionPublisher,
    cancel: CancellationToken,
    catalog: CatalogCache,
) {
    let series = Arc::new(Mutex::new(CandleSeries::new()));

    match drive_session(&*source, &*feed, &config, &publisher, &cancel, &series, &catalog).await {
        Ok(()) => {
            publisher.publish(
                SessionPhase::Stopped,
                &series.lock(),
                Some("session stopped".to_string()),
            );
        }
        Err(err) => {
            error!(
                generation = publisher.generation,
                inst_id = %config.inst_id,
                error = %err,
                "session failed"
            );
            publisher.publish(SessionPhase::Error, &series.lock(), Some(err.to_string()));
        }
    }
}

/// The session's main sequence: initial page, backfill, then the live loop
/// with reconnects. Returns `Ok(())` on cancellation or clean shutdown and
/// `Err` only for a fatal startup failure.
async fn drive_session(
    source: &dyn MarketDataSource,
    feed: &dyn LiveFeed,
    config: &SessionConfig,
    publisher: &SessionPublisher,
    cancel: &CancellationToken,
    series: &Arc<Mutex<CandleSeries>>,
    catalog: &CatalogCache,
) -> Result<(), MarketError> {
    publisher.publish(
        SessionPhase::Loading,
        &series.lock(),
        Some("fetching initial history".to_string()),
    );

    // The catalog warm-up rides along with the initial fetch on a cold start.
    let initial = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        (page, _) = async {
            tokio::join!(
                fetch_page_with_retry(source, config, config.history_limit, None),
                warm_instrument_catalog(source, catalog),
            )
        } => page?,
    };
    let mut initial = initial;
    initial.reverse();
    series.lock().replace(initial)?;

    // The initial page is already renderable while the backfill runs.
    publisher.publish(
        SessionPhase::Loading,
        &series.lock(),
        Some("backfilling history".to_string()),
    );

    let mut ready_reason = None;
    let head = series.lock().first_timestamp();
    if let Some(head) = head {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            outcome = backfill_history(source, config, head) => outcome,
        };
        if let Some(degraded) = &outcome.degraded {
            warn!(
                inst_id = %config.inst_id,
                error = %degraded,
                "continuing with partial history"
            );
            ready_reason = Some(degraded.to_string());
        }
        if let Err(err) = series.lock().prepend_history(outcome.candles) {
            warn!(error = %err, "discarding backfill block");
        }
    }
    publisher.publish(SessionPhase::Ready, &series.lock(), ready_reason);

    let router = LiveRouter::new(Arc::clone(series));
    let mut reconnect_attempt = 0_u32;
    loop {
        let subscribed = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = feed.subscribe(&config.inst_id, config.timeframe) => result,
        };

        match subscribed {
            Ok(stream) => {
                reconnect_attempt = 0;
                let mut on_mutation = || {
                    publisher.publish(SessionPhase::Ready, &series.lock(), None);
                };
                match router.run(stream, cancel, &mut on_mutation).await {
                    RouterExit::Cancelled => return Ok(()),
                    RouterExit::Ended => info!(inst_id = %config.inst_id, "live feed closed"),
                    RouterExit::Failed(err) => {
                        warn!(inst_id = %config.inst_id, error = %err, "live feed failed");
                    }
                }
            }
            Err(err) => {
                warn!(inst_id = %config.inst_id, error = %err, "live subscribe failed");
            }
        }

        reconnect_attempt += 1;
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(retry_delay(reconnect_attempt)) => {}
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = reconcile_gap(source, config, &router, publisher, series) => {}
        }
    }
}

/// Populates the shared catalog cache once; failures are logged and retried
/// on the next explicit request.
async fn warm_instrument_catalog(source: &dyn MarketDataSource, cache: &CatalogCache) {
    let mut guard = cache.lock().await;
    if guard.is_some() {
        return;
    }
    match source.fetch_instruments().await {
        Ok(catalog) => *guard = Some(Arc::new(catalog)),
        Err(err) => warn!(error = %err, "instrument catalog fetch failed"),
    }
}

/// Closes any gap opened while the feed was down by replaying a recent
/// history page through the live apply path. Known candles fold in as
/// replacements or stale drops, so the replay is idempotent.
async fn reconcile_gap(
    source: &dyn MarketDataSource,
    config: &SessionConfig,
    router: &LiveRouter,
    publisher: &SessionPublisher,
    series: &Arc<Mutex<CandleSeries>>,
) {
    match fetch_page_with_retry(source, config, config.backfill_page_limit, None).await {
        Ok(mut page) => {
            page.reverse();
            let mut applied = 0_usize;
            for candle in page {
                if !matches!(router.apply(candle), LiveApplyOutcome::Stale { .. }) {
                    applied += 1;
                }
            }
            if applied > 0 {
                debug!(applied, "reconciled feed gap after reconnect");
                publisher.publish(SessionPhase::Ready, &series.lock(), None);
            }
        }
        Err(err) => {
            warn!(inst_id = %config.inst_id, error = %err, "gap reconciliation fetch failed");
        }
    }
}
