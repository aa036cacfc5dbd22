use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{EngineError, Result};
use crate::feed::FeedConfig;
use crate::traits::{FeedMessage, PriceUpdate, PushTransport};
use crate::types::Price;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// JSON tick as published by the streaming endpoint
#[derive(Debug, Deserialize)]
struct WireTick {
    symbol: String,
    price: Decimal,
    #[serde(default)]
    volume: u64,
    timestamp: Option<DateTime<Utc>>,
}

impl From<WireTick> for PriceUpdate {
    fn from(tick: WireTick) -> Self {
        Self {
            symbol: tick.symbol,
            price: Price::new(tick.price),
            volume: tick.volume,
            timestamp: tick.timestamp.unwrap_or_else(Utc::now),
        }
    }
}

/// Parse a text frame holding one tick or an array of ticks
pub fn parse_ticks(text: &str) -> Result<Vec<PriceUpdate>> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let ticks: Vec<WireTick> = if value.is_array() {
        serde_json::from_value(value)?
    } else if value.get("symbol").is_some() {
        vec![serde_json::from_value(value)?]
    } else {
        // Subscription acks and other control frames
        Vec::new()
    };
    Ok(ticks.into_iter().map(PriceUpdate::from).collect())
}

/// Push transport over a WebSocket carrying JSON ticks.
///
/// Speaks a plain JSON protocol: a `{"a":"subscribe","v":[symbols]}` frame
/// out, `{"symbol","price","volume","timestamp"}` ticks back. Binary tick
/// packets such as the Kite ticker's are not decoded, so it is pointed at a
/// JSON relay rather than at a brokerage stream directly.
///
/// The liveness probe is a WebSocket Ping; the matching Pong is the ack.
pub struct WebSocketTransport {
    url: String,
    sink: Mutex<Option<SplitSink<WsStream, Message>>>,
    stream: Mutex<Option<SplitStream<WsStream>>>,
    /// Ticks from a multi-tick frame not yet handed out
    pending: Mutex<Vec<PriceUpdate>>,
    closed: Notify,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            sink: Mutex::new(None),
            stream: Mutex::new(None),
            pending: Mutex::new(Vec::new()),
            closed: Notify::new(),
        }
    }

    /// Transport for the configured tick stream, if the feed has one
    pub fn from_config(config: &FeedConfig) -> Option<Self> {
        config
            .push_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .map(Self::new)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn send(&self, message: Message) -> Result<()> {
        let mut sink = self.sink.lock().await;
        let sink = sink
            .as_mut()
            .ok_or_else(|| EngineError::Feed("websocket not connected".to_string()))?;
        sink.send(message)
            .await
            .map_err(|e| EngineError::Feed(format!("websocket send failed: {}", e)))
    }
}

#[async_trait]
impl PushTransport for WebSocketTransport {
    async fn connect(&self, symbols: &[String]) -> Result<()> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| EngineError::transient(format!("websocket connect failed: {}", e)))?;
        let (sink, stream) = ws_stream.split();
        *self.sink.lock().await = Some(sink);
        *self.stream.lock().await = Some(stream);
        self.pending.lock().await.clear();

        let subscribe = json!({ "a": "subscribe", "v": symbols });
        self.send(Message::Text(subscribe.to_string())).await?;
        info!("WebSocket connected to {} for {} symbols", self.url, symbols.len());
        Ok(())
    }

    async fn send_heartbeat(&self) -> Result<()> {
        self.send(Message::Ping(Vec::new())).await
    }

    async fn next_message(&self) -> Option<Result<FeedMessage>> {
        loop {
            {
                let mut pending = self.pending.lock().await;
                if !pending.is_empty() {
                    return Some(Ok(FeedMessage::Tick(pending.remove(0))));
                }
            }

            let frame = {
                let mut stream = self.stream.lock().await;
                let stream = stream.as_mut()?;
                tokio::select! {
                    frame = stream.next() => frame,
                    _ = self.closed.notified() => return Some(Ok(FeedMessage::Closed)),
                }
            };

            match frame {
                Some(Ok(Message::Text(text))) => match parse_ticks(&text) {
                    Ok(ticks) => {
                        self.pending.lock().await.extend(ticks);
                    }
                    Err(e) => warn!("Dropping malformed frame: {}", e),
                },
                Some(Ok(Message::Pong(_))) => return Some(Ok(FeedMessage::HeartbeatAck)),
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(e) = self.send(Message::Pong(payload)).await {
                        debug!("Pong reply failed: {}", e);
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Some(Ok(FeedMessage::Closed)),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return Some(Err(EngineError::Feed(format!("websocket read failed: {}", e))))
                }
            }
        }
    }

    async fn close(&self) -> Result<()> {
        // Release a reader parked on the stream
        self.closed.notify_waiters();
        if let Some(mut sink) = self.sink.lock().await.take() {
            if let Err(e) = sink.close().await {
                debug!("WebSocket close: {}", e);
            }
        }
        self.stream.lock().await.take();
        Ok(())
    }
}
