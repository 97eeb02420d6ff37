//! Watches one instrument from the terminal: starts a session and logs each
//! snapshot's phase, trend, and latest close as they arrive.
//!
//! Usage: `trend-watch [INST_ID] [TIMEFRAME]`, e.g. `trend-watch ETH-USDT-SWAP 1H`.

use market_analytics::{
    MarketError, SessionArgs, SessionController, SessionPhase, Timeframe, TrendAnalysis,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn args_from_cli() -> Result<SessionArgs, MarketError> {
    let mut cli = std::env::args().skip(1);
    let inst_id = cli.next();
    let timeframe = match cli.next() {
        Some(raw) => Some(Timeframe::parse_str(&raw)?),
        None => None,
    };
    Ok(SessionArgs {
        inst_id,
        timeframe,
        ..SessionArgs::default()
    })
}

#[tokio::main]
async fn main() -> Result<(), MarketError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let controller = SessionController::okx();
    let mut snapshots = controller.subscribe();

    let info = controller.start(args_from_cli()?).await?;
    info!(
        inst_id = %info.inst_id,
        timeframe = info.timeframe.as_str(),
        "session started"
    );

    loop {
        if snapshots.changed().await.is_err() {
            break;
        }
        let snapshot = snapshots.borrow_and_update().clone();

        let trend = match snapshot.trend {
            Some(TrendAnalysis::Bullish) => "bullish",
            Some(TrendAnalysis::Bearish) => "bearish",
            Some(TrendAnalysis::Neutral) => "neutral",
            None => "n/a",
        };
        let close = snapshot.candles.last().map(|c| c.close);

        match snapshot.phase {
            SessionPhase::Loading => {
                info!(
                    candles = snapshot.candles.len(),
                    reason = snapshot.reason.as_deref().unwrap_or(""),
                    "loading"
                );
            }
            SessionPhase::Ready => {
                let entries = snapshot
                    .advice
                    .as_ref()
                    .map(|a| a.entry_points.len())
                    .unwrap_or(0);
                let exits = snapshot
                    .advice
                    .as_ref()
                    .map(|a| a.exit_points.len())
                    .unwrap_or(0);
                info!(
                    candles = snapshot.candles.len(),
                    trend,
                    close = close.unwrap_or(f64::NAN),
                    entry_signals = entries,
                    exit_signals = exits,
                    "snapshot"
                );
            }
            SessionPhase::Error => {
                info!(
                    reason = snapshot.reason.as_deref().unwrap_or("unknown"),
                    "session error"
                );
                break;
            }
            SessionPhase::Stopped => break,
            SessionPhase::Idle => {}
        }
    }

    controller.stop().await;
    Ok(())
}
