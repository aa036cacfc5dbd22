use chrono::Utc;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::error::{EngineError, Result};
use crate::feed::price_series::{PriceSample, PriceSeries, DEFAULT_SERIES_CAPACITY};
use crate::recovery::ErrorRecoverySupervisor;
use crate::traits::{FeedMessage, PriceUpdate, PushTransport, SnapshotSource};
use crate::types::Price;

pub const POLL_OPERATION_CLASS: &str = "market_data_poll";

/// Subscriber callback, invoked synchronously on every update for its instrument
pub type PriceCallback =
    Arc<dyn Fn(&PriceUpdate) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> + Send + Sync>;

/// Feed manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// How long `initialize` waits for the first push update
    #[serde(with = "crate::config::millis")]
    pub grace_period: Duration,
    #[serde(with = "crate::config::millis")]
    pub poll_interval: Duration,
    #[serde(with = "crate::config::millis")]
    pub heartbeat_interval: Duration,
    /// Time allowed for a heartbeat acknowledgment
    #[serde(with = "crate::config::millis")]
    pub heartbeat_timeout: Duration,
    #[serde(with = "crate::config::millis")]
    pub reconnect_base_delay: Duration,
    #[serde(with = "crate::config::millis")]
    pub reconnect_max_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub series_capacity: usize,
    /// Fall back to snapshot polling when the push path fails
    pub poll_fallback_enabled: bool,
    /// Endpoint of a JSON tick stream; without one the feed polls
    pub push_url: Option<String>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(10),
            poll_interval: Duration::from_secs(3),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            max_reconnect_attempts: 10,
            series_capacity: DEFAULT_SERIES_CAPACITY,
            poll_fallback_enabled: true,
            push_url: None,
        }
    }
}

impl FeedConfig {
    fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.reconnect_base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.reconnect_max_delay)
    }
}

/// Where prices currently come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedMode {
    Push,
    Poll,
    Disconnected,
}

/// State of the single upstream connection
#[derive(Debug, Clone)]
pub struct FeedConnection {
    pub mode: FeedMode,
    pub last_ack: Option<Instant>,
    pub last_poll_success: Option<Instant>,
    pub consecutive_failures: u32,
    pub reconnect_attempts: u32,
}

impl FeedConnection {
    fn new() -> Self {
        Self {
            mode: FeedMode::Disconnected,
            last_ack: None,
            last_poll_success: None,
            consecutive_failures: 0,
            reconnect_attempts: 0,
        }
    }

    fn mark_connected(&mut self) {
        self.mode = FeedMode::Push;
        self.last_ack = Some(Instant::now());
        self.consecutive_failures = 0;
        self.reconnect_attempts = 0;
    }
}

/// Health summary of the feed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedHealth {
    pub mode: FeedMode,
    pub healthy: bool,
    /// Milliseconds since the last heartbeat ack (push) or poll success (poll)
    pub last_liveness_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub tracked_instruments: usize,
    pub push_exhausted: bool,
}

/// Keeps consumers supplied with live prices.
///
/// Owns one push transport and fails over to snapshot polling when the push
/// path goes silent. Both sources feed the same `update_price` path.
pub struct MarketDataFeedManager {
    config: FeedConfig,
    symbols: Vec<String>,
    transport: Option<Arc<dyn PushTransport>>,
    snapshot_source: Option<Arc<dyn SnapshotSource>>,
    supervisor: Arc<ErrorRecoverySupervisor>,
    series: DashMap<String, PriceSeries>,
    subscribers: DashMap<String, Vec<PriceCallback>>,
    connection: RwLock<FeedConnection>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Bumped on every teardown so stale push tasks stand down
    generation: AtomicU64,
    updates_received: AtomicU64,
    reconnecting: AtomicBool,
    /// Poll loop running; the push path stays down until `disconnect`
    polling: AtomicBool,
    push_exhausted: AtomicBool,
    shutdown: AtomicBool,
}

impl MarketDataFeedManager {
    pub fn new(
        config: FeedConfig,
        symbols: Vec<String>,
        transport: Option<Arc<dyn PushTransport>>,
        snapshot_source: Option<Arc<dyn SnapshotSource>>,
        supervisor: Arc<ErrorRecoverySupervisor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            symbols,
            transport,
            snapshot_source,
            supervisor,
            series: DashMap::new(),
            subscribers: DashMap::new(),
            connection: RwLock::new(FeedConnection::new()),
            tasks: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
            updates_received: AtomicU64::new(0),
            reconnecting: AtomicBool::new(false),
            polling: AtomicBool::new(false),
            push_exhausted: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        })
    }

    fn can_poll(&self) -> bool {
        self.config.poll_fallback_enabled && self.snapshot_source.is_some()
    }

    /// Establish the push connection and wait for data.
    ///
    /// Starts polling instead when the push connection cannot be established
    /// or stays silent through the grace period.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        self.shutdown.store(false, Ordering::SeqCst);
        self.push_exhausted.store(false, Ordering::SeqCst);
        let updates_before = self.updates_received.load(Ordering::SeqCst);

        let transport = match &self.transport {
            Some(transport) => transport.clone(),
            None => {
                if !self.can_poll() {
                    return Err(EngineError::Config(
                        "feed has neither a push transport nor a snapshot source".to_string(),
                    ));
                }
                info!("No push transport configured, polling snapshots");
                self.start_polling().await;
                return Ok(());
            }
        };

        if let Err(e) = transport.connect(&self.symbols).await {
            if !self.can_poll() {
                return Err(e);
            }
            warn!("Push connection failed ({}), falling back to polling", e);
            self.start_polling().await;
            return Ok(());
        }

        self.connection.write().await.mark_connected();
        let generation = self.generation.load(Ordering::SeqCst);
        self.spawn_push_tasks(transport, generation).await;
        info!("Push feed connected for {} instruments", self.symbols.len());

        let deadline = Instant::now() + self.config.grace_period;
        while self.updates_received.load(Ordering::SeqCst) == updates_before {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep((deadline - now).min(Duration::from_millis(50))).await;
        }

        if self.updates_received.load(Ordering::SeqCst) == updates_before && self.can_poll() {
            warn!(
                "No price update within {:?} of connecting, switching to polling",
                self.config.grace_period
            );
            self.switch_to_polling().await;
        }

        Ok(())
    }

    /// Register a callback for one instrument
    pub fn add_subscriber(&self, symbol: &str, callback: PriceCallback) {
        self.subscribers
            .entry(symbol.to_string())
            .or_default()
            .push(callback);
        debug!("Subscriber added for {}", symbol);
    }

    pub fn subscriber_count(&self, symbol: &str) -> usize {
        self.subscribers.get(symbol).map(|s| s.len()).unwrap_or(0)
    }

    /// Single ingestion path for push and poll data.
    ///
    /// Returns false when the update was dropped as invalid.
    pub fn update_price(&self, update: PriceUpdate) -> bool {
        if !update.price.is_positive() {
            warn!(
                "Dropping non-positive price {} for {}",
                update.price, update.symbol
            );
            return false;
        }

        self.series
            .entry(update.symbol.clone())
            .or_insert_with(|| PriceSeries::new(self.config.series_capacity))
            .push(PriceSample {
                price: update.price,
                volume: update.volume,
                timestamp: update.timestamp,
            });
        self.updates_received.fetch_add(1, Ordering::SeqCst);

        // Clone the list so callbacks may call back into the manager
        let callbacks = match self.subscribers.get(&update.symbol) {
            Some(callbacks) => callbacks.clone(),
            None => return true,
        };

        for callback in callbacks {
            if let Err(e) = callback(&update) {
                error!("Price subscriber for {} failed: {}", update.symbol, e);
            }
        }
        true
    }

    /// Last known price, zero when none has been seen
    pub fn get_current_price(&self, symbol: &str) -> Price {
        self.series
            .get(symbol)
            .and_then(|series| series.latest().map(|sample| sample.price))
            .unwrap_or_else(Price::zero)
    }

    pub fn price_series(&self, symbol: &str) -> Vec<PriceSample> {
        self.series
            .get(symbol)
            .map(|series| series.to_vec())
            .unwrap_or_default()
    }

    pub fn volatility(&self, symbol: &str) -> Option<f64> {
        self.series.get(symbol).and_then(|series| series.volatility())
    }

    pub async fn mode(&self) -> FeedMode {
        self.connection.read().await.mode
    }

    /// Set once push reconnection is exhausted with no poll fallback
    pub fn fatal_error(&self) -> Option<EngineError> {
        if self.push_exhausted.load(Ordering::SeqCst) && !self.can_poll() {
            Some(EngineError::ReconnectExhausted(self.config.max_reconnect_attempts))
        } else {
            None
        }
    }

    pub async fn health(&self) -> FeedHealth {
        let connection = self.connection.read().await;
        let (liveness, window) = match connection.mode {
            FeedMode::Push => (connection.last_ack, self.config.heartbeat_interval * 3),
            FeedMode::Poll => (connection.last_poll_success, self.config.poll_interval * 3),
            FeedMode::Disconnected => (None, Duration::ZERO),
        };
        let age = liveness.map(|at| at.elapsed());

        FeedHealth {
            mode: connection.mode,
            healthy: matches!(age, Some(age) if age <= window),
            last_liveness_ms: age.map(|age| age.as_millis() as u64),
            consecutive_failures: connection.consecutive_failures,
            tracked_instruments: self.symbols.len(),
            push_exhausted: self.push_exhausted.load(Ordering::SeqCst),
        }
    }

    /// Stop all loops, drop subscribers and release the transport.
    ///
    /// The manager stays down until `initialize` is called again.
    pub async fn disconnect(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);

        for handle in self.tasks.lock().await.drain(..) {
            handle.abort();
        }
        self.subscribers.clear();

        if let Some(transport) = &self.transport {
            if let Err(e) = transport.close().await {
                debug!("Error closing push transport: {}", e);
            }
        }

        self.connection.write().await.mode = FeedMode::Disconnected;
        self.reconnecting.store(false, Ordering::SeqCst);
        self.polling.store(false, Ordering::SeqCst);
        info!("Market data feed disconnected");
    }

    async fn spawn_push_tasks(self: &Arc<Self>, transport: Arc<dyn PushTransport>, generation: u64) {
        let reader = {
            let manager = self.clone();
            let transport = transport.clone();
            tokio::spawn(async move { manager.read_loop(transport, generation).await })
        };
        let heartbeat = {
            let manager = self.clone();
            tokio::spawn(async move { manager.heartbeat_loop(transport, generation).await })
        };

        let mut tasks = self.tasks.lock().await;
        tasks.retain(|handle| !handle.is_finished());
        tasks.push(reader);
        tasks.push(heartbeat);
    }

    fn is_current(&self, generation: u64) -> bool {
        !self.shutdown.load(Ordering::SeqCst) && self.generation.load(Ordering::SeqCst) == generation
    }

    async fn read_loop(self: Arc<Self>, transport: Arc<dyn PushTransport>, generation: u64) {
        while self.is_current(generation) {
            match transport.next_message().await {
                Some(Ok(FeedMessage::Tick(update))) => {
                    if self.is_current(generation) {
                        self.update_price(update);
                    }
                }
                Some(Ok(FeedMessage::HeartbeatAck)) => {
                    let mut connection = self.connection.write().await;
                    connection.last_ack = Some(Instant::now());
                    connection.consecutive_failures = 0;
                }
                Some(Ok(FeedMessage::Closed)) | None => {
                    warn!("Push stream closed by remote");
                    self.handle_transport_loss(generation).await;
                    return;
                }
                Some(Err(e)) => {
                    warn!("Push stream error: {}", e);
                    self.connection.write().await.consecutive_failures += 1;
                    self.handle_transport_loss(generation).await;
                    return;
                }
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, transport: Arc<dyn PushTransport>, generation: u64) {
        loop {
            tokio::time::sleep(self.config.heartbeat_interval).await;
            if !self.is_current(generation) {
                return;
            }

            let sent_at = Instant::now();
            if let Err(e) = transport.send_heartbeat().await {
                warn!("Heartbeat send failed: {}", e);
                self.handle_transport_loss(generation).await;
                return;
            }

            tokio::time::sleep(self.config.heartbeat_timeout).await;
            if !self.is_current(generation) {
                return;
            }

            let acked = self
                .connection
                .read()
                .await
                .last_ack
                .map(|ack| ack >= sent_at)
                .unwrap_or(false);
            if !acked {
                warn!(
                    "No heartbeat ack within {:?}, tearing down push transport",
                    self.config.heartbeat_timeout
                );
                self.connection.write().await.consecutive_failures += 1;
                self.handle_transport_loss(generation).await;
                return;
            }
        }
    }

    async fn handle_transport_loss(self: &Arc<Self>, generation: u64) {
        if !self.is_current(generation) || self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);

        if let Some(transport) = &self.transport {
            if let Err(e) = transport.close().await {
                debug!("Error closing push transport: {}", e);
            }
        }

        let handle = tokio::spawn(self.clone().reconnect_loop());
        self.tasks.lock().await.push(handle);
    }

    // Boxed to break the reconnect -> reader -> reconnect future cycle
    fn reconnect_loop(self: Arc<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move { self.run_reconnect().await })
    }

    async fn run_reconnect(self: Arc<Self>) {
        let transport = match &self.transport {
            Some(transport) => transport.clone(),
            None => return,
        };

        for attempt in 1..=self.config.max_reconnect_attempts {
            let delay = self.config.reconnect_delay(attempt);
            info!(
                "Reconnecting push feed in {:?} (attempt {}/{})",
                delay, attempt, self.config.max_reconnect_attempts
            );
            tokio::time::sleep(delay).await;
            if self.reconnect_superseded() {
                return;
            }

            self.connection.write().await.reconnect_attempts = attempt;
            match transport.connect(&self.symbols).await {
                Ok(()) => {
                    // Polling took over while the connect was in flight
                    if self.reconnect_superseded() {
                        if let Err(e) = transport.close().await {
                            debug!("Error closing push transport: {}", e);
                        }
                        return;
                    }
                    self.connection.write().await.mark_connected();
                    self.reconnecting.store(false, Ordering::SeqCst);
                    let generation = self.generation.load(Ordering::SeqCst);
                    self.spawn_push_tasks(transport, generation).await;
                    info!("Push feed reconnected");
                    return;
                }
                Err(e) => {
                    warn!("Reconnect attempt {} failed: {}", attempt, e);
                    self.connection.write().await.consecutive_failures += 1;
                }
            }
        }

        self.reconnecting.store(false, Ordering::SeqCst);
        self.push_exhausted.store(true, Ordering::SeqCst);

        if self.can_poll() {
            error!(
                "Push reconnection exhausted after {} attempts, switching to polling",
                self.config.max_reconnect_attempts
            );
            self.start_polling().await;
        } else {
            self.connection.write().await.mode = FeedMode::Disconnected;
            error!(
                "Push reconnection exhausted after {} attempts and no poll fallback is configured",
                self.config.max_reconnect_attempts
            );
        }
    }

    /// Shutdown or the switch to polling ends a pending reconnect
    fn reconnect_superseded(&self) -> bool {
        if self.shutdown.load(Ordering::SeqCst) || self.polling.load(Ordering::SeqCst) {
            debug!("Pending push reconnect abandoned");
            self.reconnecting.store(false, Ordering::SeqCst);
            return true;
        }
        false
    }

    async fn switch_to_polling(self: &Arc<Self>) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(transport) = &self.transport {
            if let Err(e) = transport.close().await {
                debug!("Error closing push transport: {}", e);
            }
        }
        self.start_polling().await;
    }

    async fn start_polling(self: &Arc<Self>) {
        let source = match &self.snapshot_source {
            Some(source) => source.clone(),
            None => return,
        };
        if self.polling.swap(true, Ordering::SeqCst) {
            debug!("Poll loop already running");
            return;
        }

        {
            let mut connection = self.connection.write().await;
            connection.mode = FeedMode::Poll;
            connection.consecutive_failures = 0;
        }

        let manager = self.clone();
        let handle = tokio::spawn(async move { manager.poll_loop(source).await });
        self.tasks.lock().await.push(handle);
        info!(
            "Polling snapshots every {:?} for {} instruments",
            self.config.poll_interval,
            self.symbols.len()
        );
    }

    async fn poll_loop(self: Arc<Self>, source: Arc<dyn SnapshotSource>) {
        while !self.shutdown.load(Ordering::SeqCst) {
            let result = self
                .supervisor
                .execute_with_recovery(POLL_OPERATION_CLASS, || {
                    source.fetch_snapshot(&self.symbols)
                })
                .await;

            match result {
                Ok(quotes) => {
                    for quote in quotes {
                        self.update_price(quote.into());
                    }
                    let mut connection = self.connection.write().await;
                    connection.last_poll_success = Some(Instant::now());
                    connection.consecutive_failures = 0;
                }
                Err(e) if e.is_rate_limited() => {
                    warn!("Snapshot poll rate limited, backing off one interval");
                    self.connection.write().await.consecutive_failures += 1;
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Err(e) => {
                    warn!("Snapshot poll failed: {}", e);
                    self.connection.write().await.consecutive_failures += 1;
                }
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Tracked instruments
    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    /// Time of the latest sample across all instruments
    pub fn last_update_time(&self) -> Option<chrono::DateTime<Utc>> {
        self.series
            .iter()
            .filter_map(|entry| entry.value().latest().map(|sample| sample.timestamp))
            .max()
    }
}
