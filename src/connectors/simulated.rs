use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use tokio::sync::{mpsc, Mutex, Notify, RwLock};

use crate::error::{EngineError, RemoteErrorKind, Result};
use crate::traits::{
    BrokerageClient, FeedMessage, FillLedgerEntry, LedgerStatus, OptionContract,
    OptionContractQuery, OrderLedgerEntry, OrderRequest, OrderSide, PriceUpdate, PushTransport,
    Quote, Reauthenticator, SnapshotSource,
};
use crate::types::Price;

pub const OP_ACCOUNT: &str = "account_value";
pub const OP_LOOKUP: &str = "lookup_option_contract";
pub const OP_QUOTE: &str = "quote";
pub const OP_ORDER_LEDGER: &str = "order_ledger";
pub const OP_FILL_LEDGER: &str = "fill_ledger";
pub const OP_PLACE: &str = "place_order";
pub const OP_CANCEL: &str = "cancel_order";
pub const OP_SNAPSHOT: &str = "fetch_snapshot";

/// In-memory brokerage.
///
/// Buy orders rest as `Open` until `complete_order`; sell orders fill
/// immediately at the current price. Failures can be queued per operation.
#[derive(Debug)]
pub struct SimulatedBrokerage {
    account_value: RwLock<Decimal>,
    prices: RwLock<HashMap<String, Price>>,
    ledger: RwLock<Vec<OrderLedgerEntry>>,
    fills: RwLock<Vec<FillLedgerEntry>>,
    placed: RwLock<Vec<(String, OrderRequest)>>,
    failures: Mutex<HashMap<&'static str, VecDeque<RemoteErrorKind>>>,
    calls: Mutex<HashMap<&'static str, usize>>,
    order_counter: AtomicU32,
    reauthentications: AtomicUsize,
}

impl SimulatedBrokerage {
    pub fn new(account_value: Decimal) -> Self {
        Self {
            account_value: RwLock::new(account_value),
            prices: RwLock::new(HashMap::new()),
            ledger: RwLock::new(Vec::new()),
            fills: RwLock::new(Vec::new()),
            placed: RwLock::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            order_counter: AtomicU32::new(1),
            reauthentications: AtomicUsize::new(0),
        }
    }

    pub async fn set_account_value(&self, value: Decimal) {
        *self.account_value.write().await = value;
    }

    pub async fn set_price(&self, symbol: &str, price: Price) {
        self.prices.write().await.insert(symbol.to_string(), price);
    }

    /// Make the next `times` calls of `operation` fail with `kind`
    pub async fn fail_next(&self, operation: &'static str, kind: RemoteErrorKind, times: usize) {
        let mut failures = self.failures.lock().await;
        let queue = failures.entry(operation).or_default();
        queue.extend(std::iter::repeat(kind).take(times));
    }

    pub async fn call_count(&self, operation: &str) -> usize {
        self.calls.lock().await.get(operation).copied().unwrap_or(0)
    }

    pub async fn placed_orders(&self) -> Vec<OrderRequest> {
        self.placed
            .read()
            .await
            .iter()
            .map(|(_, request)| request.clone())
            .collect()
    }

    pub fn reauthentication_count(&self) -> usize {
        self.reauthentications.load(Ordering::SeqCst)
    }

    /// Mark a resting order complete and record its fill
    pub async fn complete_order(&self, remote_id: &str, average_price: Price) -> bool {
        let now = Utc::now();
        let (symbol, quantity) = {
            let mut ledger = self.ledger.write().await;
            let entry = match ledger.iter_mut().find(|e| e.remote_id == remote_id) {
                Some(entry) if entry.status == LedgerStatus::Open => entry,
                _ => return false,
            };
            entry.status = LedgerStatus::Complete;
            entry.average_price = average_price;
            entry.updated_at = now;
            let quantity = self
                .placed
                .read()
                .await
                .iter()
                .find(|(id, _)| id == remote_id)
                .map(|(_, request)| request.quantity)
                .unwrap_or(0);
            entry.filled_quantity = quantity;
            (entry.symbol.clone(), quantity)
        };

        self.add_fill(FillLedgerEntry {
            trade_id: format!("T{}", self.order_counter.fetch_add(1, Ordering::SeqCst)),
            remote_order_id: remote_id.to_string(),
            symbol,
            side: OrderSide::Buy,
            price: average_price,
            quantity,
            timestamp: now,
        })
        .await;
        true
    }

    /// Set the ledger status of an order, e.g. a brokerage-side rejection
    pub async fn set_order_status(&self, remote_id: &str, status: LedgerStatus, message: &str) {
        let mut ledger = self.ledger.write().await;
        if let Some(entry) = ledger.iter_mut().find(|e| e.remote_id == remote_id) {
            entry.status = status;
            entry.status_message = Some(message.to_string());
            entry.updated_at = Utc::now();
        }
    }

    pub async fn add_fill(&self, fill: FillLedgerEntry) {
        self.fills.write().await.push(fill);
    }

    async fn enter(&self, operation: &'static str) -> Result<()> {
        *self.calls.lock().await.entry(operation).or_insert(0) += 1;
        let injected = self
            .failures
            .lock()
            .await
            .get_mut(operation)
            .and_then(|queue| queue.pop_front());
        match injected {
            Some(kind) => {
                debug!("Simulated {} failure for {}", kind, operation);
                Err(EngineError::remote(kind, format!("simulated {} failure", operation)))
            }
            None => Ok(()),
        }
    }

    async fn price_of(&self, symbol: &str) -> Option<Price> {
        self.prices.read().await.get(symbol).copied()
    }
}

fn contract_symbol(query: &OptionContractQuery) -> String {
    format!(
        "{}{}{}{}",
        query.instrument,
        query.expiry.format("%y%b").to_string().to_uppercase(),
        query.strike.normalize(),
        query.option_type
    )
}

#[async_trait]
impl BrokerageClient for SimulatedBrokerage {
    async fn account_value(&self) -> Result<Decimal> {
        self.enter(OP_ACCOUNT).await?;
        Ok(*self.account_value.read().await)
    }

    async fn lookup_option_contract(&self, query: &OptionContractQuery) -> Result<OptionContract> {
        self.enter(OP_LOOKUP).await?;
        Ok(OptionContract {
            token: u64::from(self.order_counter.fetch_add(1, Ordering::SeqCst)),
            trading_symbol: contract_symbol(query),
            lot_size: 1,
        })
    }

    async fn quote(&self, symbol: &str) -> Result<Quote> {
        self.enter(OP_QUOTE).await?;
        let price = self
            .price_of(symbol)
            .await
            .ok_or_else(|| EngineError::rejected(format!("no quote for {}", symbol)))?;
        Ok(Quote {
            symbol: symbol.to_string(),
            last_price: price,
            volume: 0,
            timestamp: Utc::now(),
        })
    }

    async fn order_ledger(&self) -> Result<Vec<OrderLedgerEntry>> {
        self.enter(OP_ORDER_LEDGER).await?;
        Ok(self.ledger.read().await.clone())
    }

    async fn fill_ledger(&self) -> Result<Vec<FillLedgerEntry>> {
        self.enter(OP_FILL_LEDGER).await?;
        Ok(self.fills.read().await.clone())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<String> {
        self.enter(OP_PLACE).await?;
        let remote_id = format!("SIM{:06}", self.order_counter.fetch_add(1, Ordering::SeqCst));
        let now = Utc::now();
        self.placed.write().await.push((remote_id.clone(), request.clone()));

        let mut entry = OrderLedgerEntry {
            remote_id: remote_id.clone(),
            symbol: request.symbol.clone(),
            status: LedgerStatus::Open,
            average_price: Price::zero(),
            filled_quantity: 0,
            updated_at: now,
            status_message: None,
        };

        if request.side == OrderSide::Sell {
            let price = match request.limit_price {
                Some(price) => price,
                None => self.price_of(&request.symbol).await.unwrap_or_default(),
            };
            entry.status = LedgerStatus::Complete;
            entry.average_price = price;
            entry.filled_quantity = request.quantity;
            self.add_fill(FillLedgerEntry {
                trade_id: format!("T{}", self.order_counter.fetch_add(1, Ordering::SeqCst)),
                remote_order_id: remote_id.clone(),
                symbol: request.symbol.clone(),
                side: OrderSide::Sell,
                price,
                quantity: request.quantity,
                timestamp: now,
            })
            .await;
        }

        self.ledger.write().await.push(entry);
        Ok(remote_id)
    }

    async fn cancel_order(&self, remote_id: &str) -> Result<()> {
        self.enter(OP_CANCEL).await?;
        let mut ledger = self.ledger.write().await;
        match ledger.iter_mut().find(|e| e.remote_id == remote_id) {
            Some(entry) if entry.status == LedgerStatus::Open => {
                entry.status = LedgerStatus::Cancelled;
                entry.updated_at = Utc::now();
                Ok(())
            }
            Some(_) => Err(EngineError::rejected(format!("order {} is not open", remote_id))),
            None => Err(EngineError::rejected(format!("unknown order {}", remote_id))),
        }
    }
}

#[async_trait]
impl SnapshotSource for SimulatedBrokerage {
    async fn fetch_snapshot(&self, symbols: &[String]) -> Result<Vec<Quote>> {
        self.enter(OP_SNAPSHOT).await?;
        let prices = self.prices.read().await;
        let now = Utc::now();
        Ok(symbols
            .iter()
            .filter_map(|symbol| {
                prices.get(symbol).map(|price| Quote {
                    symbol: symbol.clone(),
                    last_price: *price,
                    volume: 0,
                    timestamp: now,
                })
            })
            .collect())
    }
}

#[async_trait]
impl Reauthenticator for SimulatedBrokerage {
    async fn reauthenticate(&self) -> Result<()> {
        self.reauthentications.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Push transport driven by the test or demo through `push_tick`
#[derive(Debug)]
pub struct SimulatedFeed {
    sender: mpsc::UnboundedSender<FeedMessage>,
    receiver: Mutex<mpsc::UnboundedReceiver<FeedMessage>>,
    closed: Notify,
    connected: AtomicBool,
    ack_heartbeats: AtomicBool,
    failing_connects: AtomicU32,
    connects: AtomicUsize,
    heartbeats: AtomicUsize,
}

impl SimulatedFeed {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
            closed: Notify::new(),
            connected: AtomicBool::new(false),
            ack_heartbeats: AtomicBool::new(true),
            failing_connects: AtomicU32::new(0),
            connects: AtomicUsize::new(0),
            heartbeats: AtomicUsize::new(0),
        }
    }

    pub fn push_tick(&self, symbol: &str, price: Price) {
        let tick = FeedMessage::Tick(PriceUpdate {
            symbol: symbol.to_string(),
            price,
            volume: 1,
            timestamp: Utc::now(),
        });
        if self.sender.send(tick).is_err() {
            debug!("Simulated feed receiver dropped");
        }
    }

    /// Remote-side close of the stream
    pub fn drop_connection(&self) {
        if self.sender.send(FeedMessage::Closed).is_err() {
            debug!("Simulated feed receiver dropped");
        }
    }

    pub fn set_ack_heartbeats(&self, ack: bool) {
        self.ack_heartbeats.store(ack, Ordering::SeqCst);
    }

    /// Make the next `count` connection attempts fail
    pub fn fail_connects(&self, count: u32) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn heartbeat_count(&self) -> usize {
        self.heartbeats.load(Ordering::SeqCst)
    }
}

impl Default for SimulatedFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PushTransport for SimulatedFeed {
    async fn connect(&self, symbols: &[String]) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_connects.store(failing - 1, Ordering::SeqCst);
            return Err(EngineError::transient("simulated connection refused"));
        }
        debug!("Simulated feed connected for {:?}", symbols);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send_heartbeat(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(EngineError::Feed("not connected".to_string()));
        }
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        if self.ack_heartbeats.load(Ordering::SeqCst) && self.sender.send(FeedMessage::HeartbeatAck).is_err() {
            debug!("Simulated feed receiver dropped");
        }
        Ok(())
    }

    async fn next_message(&self) -> Option<Result<FeedMessage>> {
        let mut receiver = self.receiver.lock().await;
        tokio::select! {
            message = receiver.recv() => message.map(Ok),
            _ = self.closed.notified() => Some(Ok(FeedMessage::Closed)),
        }
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        // Wake a reader parked in next_message
        self.closed.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_injected_failures_are_consumed_in_order() {
        let brokerage = SimulatedBrokerage::new(dec!(100000));
        brokerage.fail_next(OP_ACCOUNT, RemoteErrorKind::RateLimited, 1).await;

        assert!(brokerage.account_value().await.unwrap_err().is_rate_limited());
        assert_eq!(brokerage.account_value().await.unwrap(), dec!(100000));
        assert_eq!(brokerage.call_count(OP_ACCOUNT).await, 2);
    }

    #[tokio::test]
    async fn test_sell_orders_fill_immediately() {
        let brokerage = SimulatedBrokerage::new(dec!(100000));
        brokerage.set_price("NIFTY", Price::new(dec!(58))).await;

        let buy = brokerage
            .place_order(&OrderRequest::market("NIFTY", OrderSide::Buy, 75))
            .await
            .unwrap();
        brokerage
            .place_order(&OrderRequest::market("NIFTY", OrderSide::Sell, 75))
            .await
            .unwrap();

        let ledger = brokerage.order_ledger().await.unwrap();
        assert_eq!(ledger[0].status, LedgerStatus::Open);
        assert_eq!(ledger[1].status, LedgerStatus::Complete);

        assert!(brokerage.complete_order(&buy, Price::new(dec!(50))).await);
        let fills = brokerage.fill_ledger().await.unwrap();
        assert_eq!(fills.len(), 2);
        assert_eq!(fills[0].price, Price::new(dec!(58)));
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_reader() {
        let feed = std::sync::Arc::new(SimulatedFeed::new());
        feed.connect(&["NIFTY".to_string()]).await.unwrap();

        let reader = {
            let feed = feed.clone();
            tokio::spawn(async move { feed.next_message().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        feed.close().await.unwrap();

        let message = reader.await.unwrap();
        assert!(matches!(message, Some(Ok(FeedMessage::Closed))));
    }
}
