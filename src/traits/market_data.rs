use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::traits::brokerage::Quote;
use crate::types::Price;

/// A single price observation for one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub symbol: String,
    pub price: Price,
    pub volume: u64,
    pub timestamp: DateTime<Utc>,
}

impl From<Quote> for PriceUpdate {
    fn from(quote: Quote) -> Self {
        Self {
            symbol: quote.symbol,
            price: quote.last_price,
            volume: quote.volume,
            timestamp: quote.timestamp,
        }
    }
}

/// Message read off a push transport
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Tick(PriceUpdate),
    /// Acknowledgment of a liveness probe
    HeartbeatAck,
    /// Remote closed the stream
    Closed,
}

/// Streaming price transport.
///
/// The feed manager owns exactly one of these. `next_message` returning
/// `None` means the stream has ended.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn connect(&self, symbols: &[String]) -> Result<()>;

    /// Send a liveness probe; the ack arrives as `FeedMessage::HeartbeatAck`
    async fn send_heartbeat(&self) -> Result<()>;

    async fn next_message(&self) -> Option<Result<FeedMessage>>;

    async fn close(&self) -> Result<()>;
}

/// Batched pull source used when the push transport goes silent
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(&self, symbols: &[String]) -> Result<Vec<Quote>>;
}
