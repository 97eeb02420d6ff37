use crate::error::MarketError;
use crate::market::types::{
    parse_live_candle_payload, Candle, CandleRowWire, Instrument, InstrumentWire, Timeframe,
};
use async_trait::async_trait;
use futures_util::stream::unfold;
use futures_util::{SinkExt, Stream, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use std::pin::Pin;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

const OKX_REST_BASE_URL: &str = "https://www.okx.com";
const OKX_WS_BUSINESS_URL: &str = "wss://ws.okx.com:8443/ws/v5/business";

pub type OkxWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type CandleStream = Pin<Box<dyn Stream<Item = Result<Candle, MarketError>> + Send>>;

/// Historical pages and the instrument catalog. Pages are delivered
/// newest-first, exactly as the provider returns them; callers reverse to
/// ascending. `before` requests candles strictly older than the cursor.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn fetch_candles(
        &self,
        inst_id: &str,
        timeframe: Timeframe,
        limit: u16,
        before: Option<i64>,
    ) -> Result<Vec<Candle>, MarketError>;

    async fn fetch_instruments(&self) -> Result<Vec<Instrument>, MarketError>;
}

/// Push feed of single-candle updates for one instrument/timeframe.
#[async_trait]
pub trait LiveFeed: Send + Sync {
    async fn subscribe(
        &self,
        inst_id: &str,
        timeframe: Timeframe,
    ) -> Result<CandleStream, MarketError>;
}

fn candles_endpoint(
    inst_id: &str,
    timeframe: Timeframe,
    limit: u16,
    before: Option<i64>,
) -> String {
    let mut endpoint = format!(
        "{OKX_REST_BASE_URL}/api/v5/market/candles?instId={inst_id}&bar={}&limit={limit}",
        timeframe.as_str()
    );
    if let Some(cursor) = before {
        // OKX calls the older-than cursor "after".
        endpoint.push_str(&format!("&after={cursor}"));
    }
    endpoint
}

fn instruments_endpoint() -> String {
    format!("{OKX_REST_BASE_URL}/api/v5/public/instruments?instType=SWAP")
}

fn subscribe_payload(inst_id: &str, timeframe: Timeframe) -> String {
    format!(
        r#"{{"op":"subscribe","args":[{{"channel":"candle{}","instType":"SWAP","instId":"{inst_id}"}}]}}"#,
        timeframe.as_str()
    )
}

#[derive(Debug, Deserialize)]
struct OkxRestEnvelope<T> {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

impl<T> OkxRestEnvelope<T> {
    fn into_data(self) -> Result<Vec<T>, MarketError> {
        if self.code != "0" {
            return Err(MarketError::Provider {
                code: self.code,
                message: self.msg,
            });
        }
        Ok(self.data)
    }
}

/// OKX REST + websocket implementation of both seams.
#[derive(Debug, Clone)]
pub struct OkxMarketData {
    client: Client,
}

impl OkxMarketData {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl Default for OkxMarketData {
    fn default() -> Self {
        Self::new(Client::new())
    }
}

#[async_trait]
impl MarketDataSource for OkxMarketData {
    async fn fetch_candles(
        &self,
        inst_id: &str,
        timeframe: Timeframe,
        limit: u16,
        before: Option<i64>,
    ) -> Result<Vec<Candle>, MarketError> {
        let endpoint = candles_endpoint(inst_id, timeframe, limit, before);
        let response = self.client.get(endpoint).send().await?.error_for_status()?;
        let payload = response
            .json::<OkxRestEnvelope<CandleRowWire>>()
            .await?
            .into_data()?;

        let mut candles = Vec::with_capacity(payload.len());
        for row in payload {
            candles.push(row.into_candle()?);
        }
        Ok(candles)
    }

    async fn fetch_instruments(&self) -> Result<Vec<Instrument>, MarketError> {
        let endpoint = instruments_endpoint();
        let response = self.client.get(endpoint).send().await?.error_for_status()?;
        let payload = response
            .json::<OkxRestEnvelope<InstrumentWire>>()
            .await?
            .into_data()?;

        let mut instruments: Vec<Instrument> =
            payload.into_iter().map(Instrument::from).collect();
        instruments.sort_unstable_by(|a, b| a.inst_id.cmp(&b.inst_id));
        instruments.dedup_by(|a, b| a.inst_id == b.inst_id);
        Ok(instruments)
    }
}

async fn connect_candle_stream(
    inst_id: &str,
    timeframe: Timeframe,
) -> Result<OkxWsStream, MarketError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(64 << 20),
        max_frame_size: Some(16 << 20),
        ..Default::default()
    };

    let (mut stream, _) =
        connect_async_with_config(OKX_WS_BUSINESS_URL, Some(ws_config), true).await?;
    stream
        .send(Message::Text(subscribe_payload(inst_id, timeframe)))
        .await?;
    Ok(stream)
}

fn candle_updates(ws: OkxWsStream) -> CandleStream {
    Box::pin(unfold(ws, |mut ws| async move {
        loop {
            let frame = ws.next().await?;
            match frame {
                Ok(Message::Text(text)) => {
                    let mut payload = text.into_bytes();
                    match parse_live_candle_payload(&mut payload) {
                        Ok(Some(candle)) => return Some((Ok(candle), ws)),
                        Ok(None) => continue,
                        Err(error) => return Some((Err(error), ws)),
                    }
                }
                Ok(Message::Binary(mut payload)) => {
                    match parse_live_candle_payload(&mut payload) {
                        Ok(Some(candle)) => return Some((Ok(candle), ws)),
                        Ok(None) => continue,
                        Err(error) => return Some((Err(error), ws)),
                    }
                }
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(error) => return Some((Err(error.into()), ws)),
            }
        }
    }))
}

#[async_trait]
impl LiveFeed for OkxMarketData {
    async fn subscribe(
        &self,
        inst_id: &str,
        timeframe: Timeframe,
    ) -> Result<CandleStream, MarketError> {
        let stream = connect_candle_stream(inst_id, timeframe).await?;
        Ok(candle_updates(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candles_endpoint_includes_instrument_bar_and_limit() {
        let endpoint = candles_endpoint("BTC-USDT-SWAP", Timeframe::M15, 303, None);
        assert!(endpoint.contains("/api/v5/market/candles"));
        assert!(endpoint.contains("instId=BTC-USDT-SWAP"));
        assert!(endpoint.contains("bar=15m"));
        assert!(endpoint.contains("limit=303"));
        assert!(!endpoint.contains("after="));
    }

    #[test]
    fn candles_endpoint_maps_cursor_to_after_param() {
        let endpoint =
            candles_endpoint("BTC-USDT-SWAP", Timeframe::H1, 100, Some(1_735_000_000_000));
        assert!(endpoint.contains("after=1735000000000"));
    }

    #[test]
    fn instruments_endpoint_requests_swap_catalog() {
        let endpoint = instruments_endpoint();
        assert!(endpoint.contains("/api/v5/public/instruments"));
        assert!(endpoint.contains("instType=SWAP"));
    }

    #[test]
    fn subscribe_payload_names_candle_channel() {
        let payload = subscribe_payload("ETH-USDT-SWAP", Timeframe::M1);
        assert!(payload.contains(r#""op":"subscribe""#));
        assert!(payload.contains(r#""channel":"candle1m""#));
        assert!(payload.contains(r#""instId":"ETH-USDT-SWAP""#));
    }

    #[test]
    fn envelope_surfaces_provider_error_code() {
        let envelope = OkxRestEnvelope::<CandleRowWire> {
            code: "51001".to_string(),
            msg: "Instrument ID does not exist".to_string(),
            data: Vec::new(),
        };
        let result = envelope.into_data();
        assert!(matches!(result, Err(MarketError::Provider { .. })));
    }
}
