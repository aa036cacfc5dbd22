use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{OptionType, Price};

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

/// Order status as reported by the brokerage order ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerStatus {
    Open,
    Complete,
    Cancelled,
    Rejected,
}

/// New order sent to the brokerage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: u32,
    /// `None` for a market order
    pub limit_price: Option<Price>,
    /// Client-side tag echoed back by the brokerage
    pub tag: Option<String>,
}

impl OrderRequest {
    pub fn market(symbol: impl Into<String>, side: OrderSide, quantity: u32) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            quantity,
            limit_price: None,
            tag: None,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

/// One row of the brokerage order ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLedgerEntry {
    pub remote_id: String,
    pub symbol: String,
    pub status: LedgerStatus,
    pub average_price: Price,
    pub filled_quantity: u32,
    pub updated_at: DateTime<Utc>,
    pub status_message: Option<String>,
}

/// One row of the brokerage fill (trade) ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillLedgerEntry {
    pub trade_id: String,
    pub remote_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub price: Price,
    pub quantity: u32,
    pub timestamp: DateTime<Utc>,
}

/// Lookup key for an option contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionContractQuery {
    pub instrument: String,
    pub strike: Decimal,
    pub option_type: OptionType,
    pub expiry: NaiveDate,
}

/// Resolved option contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionContract {
    pub token: u64,
    pub trading_symbol: String,
    pub lot_size: u32,
}

/// Point-in-time quote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub last_price: Price,
    pub volume: u64,
    pub timestamp: DateTime<Utc>,
}

/// Account and order interface of the remote brokerage.
///
/// Every method is a fallible remote call; callers route them through the
/// error recovery supervisor.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerageClient: Send + Sync {
    /// Available margin used as account value
    async fn account_value(&self) -> Result<Decimal>;

    async fn lookup_option_contract(&self, query: &OptionContractQuery) -> Result<OptionContract>;

    async fn quote(&self, symbol: &str) -> Result<Quote>;

    /// Snapshot of today's orders
    async fn order_ledger(&self) -> Result<Vec<OrderLedgerEntry>>;

    /// Snapshot of today's fills
    async fn fill_ledger(&self) -> Result<Vec<FillLedgerEntry>>;

    /// Submit an order, returning the remote order id
    async fn place_order(&self, request: &OrderRequest) -> Result<String>;

    async fn cancel_order(&self, remote_id: &str) -> Result<()>;
}

/// Re-establishes an expired brokerage session
#[async_trait]
pub trait Reauthenticator: Send + Sync {
    async fn reauthenticate(&self) -> Result<()>;
}
