//! Authenticated event stream over Backpack's websocket.
//!
//! One connection carries both channels the strategy needs: the public
//! depth diff stream and the private per-symbol order update stream. The
//! subscribe handshake is signed; after that the connection is read-only
//! apart from protocol pongs. There is no reconnect: a close or transport
//! error ends the session and the runner cleans up.

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use url::Url;

use crate::{
    errors::{WsError, WsResult},
    signer::InstructionSigner,
    types::{ClientOrderId, OrderStatus, PriceLevel, Side},
};

pub const DEFAULT_STREAM_URL: &str = "wss://ws.backpack.exchange";

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub url: String,
    pub symbol: String,
}

impl StreamConfig {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            url: DEFAULT_STREAM_URL.to_string(),
            symbol: symbol.into(),
        }
    }
}

/// One incremental depth update from the public stream.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthDiff {
    pub symbol: String,
    pub first_update_id: u64,
    pub last_update_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

/// One private order lifecycle event.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderUpdate {
    /// Wire event name, e.g. `orderFill` or `orderCancelled`.
    pub event: String,
    pub exchange_id: String,
    pub client_id: Option<ClientOrderId>,
    pub symbol: String,
    pub side: Side,
    pub status: OrderStatus,
    pub price: f64,
    pub quantity: f64,
    /// Quantity filled by this event, zero when not a fill.
    pub fill_quantity: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Depth(DepthDiff),
    Order(OrderUpdate),
    Pong,
    Closed(Option<CloseInfo>),
    /// Acknowledgement or other frame the strategy does not act on.
    Ignored(String),
}

/// Connector holding everything needed to open one subscribed session.
pub struct StreamClient {
    config: StreamConfig,
    url: Url,
}

impl StreamClient {
    pub fn new(config: StreamConfig) -> WsResult<Self> {
        let url = Url::parse(&config.url)?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => return Err(WsError::UnsupportedScheme(other.to_string())),
        }
        Ok(Self { config, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Dials the endpoint and sends the signed subscribe for the depth and
    /// order update channels.
    pub async fn connect(self, signer: &dyn InstructionSigner) -> WsResult<StreamConnection> {
        let (mut stream, _) = connect_async(self.url.as_str()).await?;
        let subscribe = subscribe_message(&self.config.symbol, signer);
        stream.send(Message::Text(subscribe)).await?;
        Ok(StreamConnection {
            symbol: self.config.symbol,
            stream,
        })
    }
}

pub struct StreamConnection {
    symbol: String,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl StreamConnection {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Next decoded event. `Ok(None)` means the server closed the stream
    /// without a close frame.
    pub async fn next_event(&mut self) -> WsResult<Option<StreamEvent>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return decode_event(&text).map(Some),
                Some(Ok(Message::Binary(binary))) => {
                    let text = String::from_utf8(binary)
                        .map_err(|_| WsError::InvalidMessage("invalid utf8 payload".into()))?;
                    return decode_event(&text).map(Some);
                }
                Some(Ok(Message::Ping(payload))) => {
                    self.stream.send(Message::Pong(payload)).await?;
                    return Ok(Some(StreamEvent::Pong));
                }
                Some(Ok(Message::Pong(_))) => return Ok(Some(StreamEvent::Pong)),
                Some(Ok(Message::Close(frame))) => {
                    let info = frame.map(|frame| CloseInfo {
                        code: u16::from(frame.code),
                        reason: frame.reason.into_owned(),
                    });
                    return Ok(Some(StreamEvent::Closed(info)));
                }
                Some(Ok(Message::Frame(_))) => continue,
                Some(Err(err)) => return Err(err.into()),
                None => return Ok(None),
            }
        }
    }

    pub async fn close(mut self) -> WsResult<()> {
        self.stream.close(None).await?;
        Ok(())
    }
}

/// Builds the signed subscribe payload for both channels.
fn subscribe_message(symbol: &str, signer: &dyn InstructionSigner) -> String {
    let sig = signer.subscribe_signature();
    json!({
        "method": "SUBSCRIBE",
        "params": [
            format!("depth.{symbol}"),
            format!("account.orderUpdate.{symbol}"),
        ],
        "signature": [sig.verifying_key, sig.signature, sig.timestamp, sig.window],
    })
    .to_string()
}

// Wire payloads. Prices and sizes arrive as decimal strings; the depth
// sequence ids arrive as integers.

#[derive(Debug, Deserialize)]
struct DepthPayload {
    s: String,
    #[serde(rename = "U")]
    first_update_id: u64,
    #[serde(rename = "u")]
    last_update_id: u64,
    #[serde(default)]
    b: Vec<[String; 2]>,
    #[serde(default)]
    a: Vec<[String; 2]>,
}

#[derive(Debug, Deserialize)]
struct OrderUpdatePayload {
    e: String,
    s: String,
    i: Value,
    #[serde(default)]
    c: Option<u64>,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "X")]
    status: String,
    #[serde(default)]
    p: Option<String>,
    #[serde(default)]
    q: Option<String>,
    #[serde(default)]
    l: Option<String>,
}

fn decode_event(text: &str) -> WsResult<StreamEvent> {
    let message: Value = serde_json::from_str(text)?;

    // Frames without a data envelope are subscription acks.
    let Some(data) = message.get("data") else {
        return Ok(StreamEvent::Ignored(text.to_string()));
    };
    let event = data
        .get("e")
        .and_then(Value::as_str)
        .ok_or_else(|| WsError::InvalidMessage("event payload missing \"e\"".into()))?;

    if event == "depth" {
        let payload: DepthPayload = serde_json::from_value(data.clone())?;
        return Ok(StreamEvent::Depth(DepthDiff {
            symbol: payload.s,
            first_update_id: payload.first_update_id,
            last_update_id: payload.last_update_id,
            bids: decode_levels(payload.b)?,
            asks: decode_levels(payload.a)?,
        }));
    }

    if event.starts_with("order") {
        let payload: OrderUpdatePayload = serde_json::from_value(data.clone())?;
        let side = Side::from_wire(&payload.side)
            .ok_or_else(|| WsError::InvalidMessage(format!("unknown side {:?}", payload.side)))?;
        return Ok(StreamEvent::Order(OrderUpdate {
            event: payload.e,
            exchange_id: id_to_string(&payload.i),
            client_id: payload.c.map(ClientOrderId::new),
            symbol: payload.s,
            side,
            status: OrderStatus::from_wire(&payload.status),
            price: decode_decimal(payload.p.as_deref())?,
            quantity: decode_decimal(payload.q.as_deref())?,
            fill_quantity: decode_decimal(payload.l.as_deref())?,
        }));
    }

    Ok(StreamEvent::Ignored(text.to_string()))
}

/// Order ids appear as strings in REST responses and may appear as bare
/// numbers on the stream; normalize both to the string form.
fn id_to_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn decode_decimal(text: Option<&str>) -> WsResult<f64> {
    match text {
        None => Ok(0.0),
        Some(text) => text
            .parse::<f64>()
            .map_err(|_| WsError::InvalidMessage(format!("bad decimal {text:?}"))),
    }
}

fn decode_levels(raw: Vec<[String; 2]>) -> WsResult<Vec<PriceLevel>> {
    raw.into_iter()
        .map(|[price, size]| {
            Ok(PriceLevel::new(
                decode_decimal(Some(&price))?,
                decode_decimal(Some(&size))?,
            ))
        })
        .collect()
}
