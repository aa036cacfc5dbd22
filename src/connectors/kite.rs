use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use log::{debug, info, warn};
use reqwest::{Client, RequestBuilder, Response};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

use crate::config::{BrokerageSettings, Secret};
use crate::error::{classify_http_status, EngineError, RemoteErrorKind, Result};
use crate::traits::{
    BrokerageClient, FillLedgerEntry, LedgerStatus, OptionContract, OptionContractQuery,
    OrderLedgerEntry, OrderRequest, OrderSide, Quote, Reauthenticator, SnapshotSource,
};
use crate::types::Price;

const API_VERSION: &str = "3";
const DERIVATIVES_EXCHANGE: &str = "NFO";
const IST_OFFSET_SECS: i32 = 19_800;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Quote keys for the index underlyings
fn index_quote_key(symbol: &str) -> Option<&'static str> {
    match symbol {
        "NIFTY" => Some("NSE:NIFTY 50"),
        "BANKNIFTY" => Some("NSE:NIFTY BANK"),
        "FINNIFTY" => Some("NSE:NIFTY FIN SERVICE"),
        "MIDCPNIFTY" => Some("NSE:NIFTY MID SELECT"),
        "SENSEX" => Some("BSE:SENSEX"),
        _ => None,
    }
}

/// `exchange:tradingsymbol` key used by the quote endpoints
pub fn quote_key(symbol: &str) -> String {
    if symbol.contains(':') {
        return symbol.to_string();
    }
    match index_quote_key(symbol) {
        Some(key) => key.to_string(),
        None => format!("{}:{}", DERIVATIVES_EXCHANGE, symbol),
    }
}

/// Hex SHA-256 of api_key + request_token + api_secret
pub fn session_checksum(api_key: &str, request_token: &str, api_secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hasher.update(request_token.as_bytes());
    hasher.update(api_secret.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect()
}

/// Kite timestamps are exchange-local without an offset
fn parse_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    let ist = FixedOffset::east_opt(IST_OFFSET_SECS);
    raw.and_then(|raw| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").ok())
        .zip(ist)
        .and_then(|(naive, ist)| ist.from_local_datetime(&naive).single())
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

fn decimal_from(value: &Value) -> Decimal {
    match value {
        Value::Number(number) => Decimal::from_str(&number.to_string()).unwrap_or_default(),
        Value::String(s) => Decimal::from_str(s).unwrap_or_default(),
        _ => Decimal::ZERO,
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    error_type: String,
}

#[derive(Debug, Deserialize)]
struct KiteOrder {
    order_id: String,
    tradingsymbol: String,
    status: String,
    #[serde(default)]
    average_price: Value,
    #[serde(default)]
    filled_quantity: u32,
    order_timestamp: Option<String>,
    status_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KiteTrade {
    trade_id: String,
    order_id: String,
    tradingsymbol: String,
    transaction_type: String,
    average_price: Value,
    quantity: u32,
    fill_timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KiteLtp {
    last_price: Value,
}

#[derive(Debug, Deserialize)]
struct KiteOrderId {
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct KiteSession {
    access_token: String,
}

/// One row of the instrument dump
#[derive(Debug, Clone, PartialEq)]
struct InstrumentRow {
    token: u64,
    trading_symbol: String,
    name: String,
    expiry: Option<NaiveDate>,
    strike: Decimal,
    lot_size: u32,
    instrument_type: String,
}

fn parse_instruments(csv: &str) -> Vec<InstrumentRow> {
    let mut lines = csv.lines();
    let header: Vec<&str> = match lines.next() {
        Some(header) => header.split(',').map(str::trim).collect(),
        None => return Vec::new(),
    };
    let column = |name: &str| header.iter().position(|h| *h == name);
    let (token, symbol, name, expiry, strike, lot, kind) = match (
        column("instrument_token"),
        column("tradingsymbol"),
        column("name"),
        column("expiry"),
        column("strike"),
        column("lot_size"),
        column("instrument_type"),
    ) {
        (Some(a), Some(b), Some(c), Some(d), Some(e), Some(f), Some(g)) => (a, b, c, d, e, f, g),
        _ => return Vec::new(),
    };

    lines
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').map(|f| f.trim().trim_matches('"')).collect();
            Some(InstrumentRow {
                token: fields.get(token)?.parse().ok()?,
                trading_symbol: fields.get(symbol)?.to_string(),
                name: fields.get(name)?.to_string(),
                expiry: NaiveDate::parse_from_str(fields.get(expiry)?, "%Y-%m-%d").ok(),
                strike: Decimal::from_str(fields.get(strike)?).unwrap_or_default(),
                lot_size: fields.get(lot)?.parse().unwrap_or(1),
                instrument_type: fields.get(kind)?.to_string(),
            })
        })
        .collect()
}

fn ledger_status(status: &str) -> LedgerStatus {
    match status {
        "COMPLETE" => LedgerStatus::Complete,
        "CANCELLED" => LedgerStatus::Cancelled,
        "REJECTED" => LedgerStatus::Rejected,
        _ => LedgerStatus::Open,
    }
}

/// Kite Connect v3 REST client
pub struct KiteClient {
    api_key: String,
    api_secret: Secret,
    access_token: RwLock<Secret>,
    /// Spent by the first successful session exchange
    request_token: Mutex<Option<Secret>>,
    base_url: String,
    http_client: Client,
    instruments: RwLock<Option<Vec<InstrumentRow>>>,
}

impl KiteClient {
    pub fn new(settings: &BrokerageSettings) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| EngineError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            api_key: settings.api_key.clone(),
            api_secret: settings.api_secret.clone(),
            access_token: RwLock::new(settings.access_token.clone()),
            request_token: Mutex::new(settings.request_token.clone()),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            http_client,
            instruments: RwLock::new(None),
        })
    }

    pub async fn has_session(&self) -> bool {
        !self.access_token.read().await.is_empty()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        let token = self.access_token.read().await;
        builder
            .header("X-Kite-Version", API_VERSION)
            .header(
                "Authorization",
                format!("token {}:{}", self.api_key, token.expose()),
            )
    }

    /// Map a non-success response onto the remote error taxonomy
    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let body: Option<ErrorBody> = serde_json::from_str(&text).ok();
        let (message, error_type) = match body {
            Some(body) => (body.message, body.error_type),
            None => (text, String::new()),
        };

        let kind = if error_type == "TokenException" {
            RemoteErrorKind::AuthExpired
        } else {
            classify_http_status(status.as_u16())
        };
        debug!("Kite {} {}: {}", status.as_u16(), error_type, message);
        Err(EngineError::remote(
            kind,
            format!("HTTP {} {}: {}", status.as_u16(), error_type, message),
        ))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let request = self
            .authorized(self.http_client.get(self.url(path)).query(query))
            .await;
        let response = Self::check(request.send().await?).await?;
        let envelope: Envelope<T> = response.json().await?;
        Ok(envelope.data)
    }

    async fn load_instruments(&self) -> Result<()> {
        if self.instruments.read().await.is_some() {
            return Ok(());
        }
        let path = format!("/instruments/{}", DERIVATIVES_EXCHANGE);
        let request = self.authorized(self.http_client.get(self.url(&path))).await;
        let response = Self::check(request.send().await?).await?;
        let rows = parse_instruments(&response.text().await?);
        info!("Loaded {} {} instruments", rows.len(), DERIVATIVES_EXCHANGE);
        *self.instruments.write().await = Some(rows);
        Ok(())
    }

    async fn ltp(&self, symbols: &[String]) -> Result<Vec<Quote>> {
        let keys: Vec<(&str, String)> = symbols.iter().map(|s| ("i", quote_key(s))).collect();
        let data: HashMap<String, KiteLtp> = self.get_json("/quote/ltp", &keys).await?;
        let now = Utc::now();

        Ok(symbols
            .iter()
            .filter_map(|symbol| {
                let ltp = data.get(&quote_key(symbol))?;
                Some(Quote {
                    symbol: symbol.clone(),
                    last_price: Price::new(decimal_from(&ltp.last_price)),
                    volume: 0,
                    timestamp: now,
                })
            })
            .collect())
    }

    /// Exchange the one-time request token for an access token
    pub async fn create_session(&self) -> Result<()> {
        let mut request_token = self.request_token.lock().await;
        let token = match request_token.as_ref() {
            Some(token) => token.clone(),
            None => {
                return Err(EngineError::auth_expired(
                    "session expired and no request token is available, log in again",
                ))
            }
        };

        let checksum = session_checksum(&self.api_key, token.expose(), self.api_secret.expose());
        let form = [
            ("api_key", self.api_key.clone()),
            ("request_token", token.expose().to_string()),
            ("checksum", checksum),
        ];
        let response = self
            .http_client
            .post(self.url("/session/token"))
            .header("X-Kite-Version", API_VERSION)
            .form(&form)
            .send()
            .await?;
        let response = Self::check(response).await?;
        let envelope: Envelope<KiteSession> = response.json().await?;

        *self.access_token.write().await = Secret::new(envelope.data.access_token);
        *request_token = None;
        info!("Kite session established");
        Ok(())
    }
}

#[async_trait]
impl BrokerageClient for KiteClient {
    async fn account_value(&self) -> Result<Decimal> {
        let data: Value = self.get_json("/user/margins", &[]).await?;
        let equity = &data["equity"];
        let value = if equity["net"].is_null() {
            decimal_from(&equity["available"]["live_balance"])
        } else {
            decimal_from(&equity["net"])
        };
        Ok(value)
    }

    async fn lookup_option_contract(&self, query: &OptionContractQuery) -> Result<OptionContract> {
        self.load_instruments().await?;
        let instruments = self.instruments.read().await;
        let option_type = query.option_type.to_string();

        instruments
            .iter()
            .flatten()
            .find(|row| {
                row.name == query.instrument
                    && row.instrument_type == option_type
                    && row.expiry == Some(query.expiry)
                    && row.strike == query.strike
            })
            .map(|row| OptionContract {
                token: row.token,
                trading_symbol: row.trading_symbol.clone(),
                lot_size: row.lot_size,
            })
            .ok_or_else(|| {
                EngineError::rejected(format!(
                    "no {} {} {} contract expiring {}",
                    query.instrument, query.strike, option_type, query.expiry
                ))
            })
    }

    async fn quote(&self, symbol: &str) -> Result<Quote> {
        self.ltp(&[symbol.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::rejected(format!("no quote for {}", symbol)))
    }

    async fn order_ledger(&self) -> Result<Vec<OrderLedgerEntry>> {
        let orders: Vec<KiteOrder> = self.get_json("/orders", &[]).await?;
        Ok(orders
            .into_iter()
            .map(|order| OrderLedgerEntry {
                remote_id: order.order_id,
                symbol: order.tradingsymbol,
                status: ledger_status(&order.status),
                average_price: Price::new(decimal_from(&order.average_price)),
                filled_quantity: order.filled_quantity,
                updated_at: parse_timestamp(order.order_timestamp.as_deref()),
                status_message: order.status_message,
            })
            .collect())
    }

    async fn fill_ledger(&self) -> Result<Vec<FillLedgerEntry>> {
        let trades: Vec<KiteTrade> = self.get_json("/trades", &[]).await?;
        Ok(trades
            .into_iter()
            .map(|trade| FillLedgerEntry {
                trade_id: trade.trade_id,
                remote_order_id: trade.order_id,
                symbol: trade.tradingsymbol,
                side: if trade.transaction_type == "SELL" {
                    OrderSide::Sell
                } else {
                    OrderSide::Buy
                },
                price: Price::new(decimal_from(&trade.average_price)),
                quantity: trade.quantity,
                timestamp: parse_timestamp(trade.fill_timestamp.as_deref()),
            })
            .collect())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<String> {
        let mut form = vec![
            ("tradingsymbol", request.symbol.clone()),
            ("exchange", DERIVATIVES_EXCHANGE.to_string()),
            ("transaction_type", request.side.as_str().to_string()),
            ("quantity", request.quantity.to_string()),
            ("product", "MIS".to_string()),
            ("validity", "DAY".to_string()),
        ];
        match request.limit_price {
            Some(price) => {
                form.push(("order_type", "LIMIT".to_string()));
                form.push(("price", price.to_string()));
            }
            None => form.push(("order_type", "MARKET".to_string())),
        }
        if let Some(tag) = &request.tag {
            form.push(("tag", tag.clone()));
        }

        let builder = self
            .authorized(self.http_client.post(self.url("/orders/regular")).form(&form))
            .await;
        let response = Self::check(builder.send().await?).await?;
        let envelope: Envelope<KiteOrderId> = response.json().await?;
        info!(
            "Kite accepted {} {} x{} as {}",
            request.side.as_str(),
            request.symbol,
            request.quantity,
            envelope.data.order_id
        );
        Ok(envelope.data.order_id)
    }

    async fn cancel_order(&self, remote_id: &str) -> Result<()> {
        let path = format!("/orders/regular/{}", remote_id);
        let builder = self.authorized(self.http_client.delete(self.url(&path))).await;
        Self::check(builder.send().await?).await?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotSource for KiteClient {
    async fn fetch_snapshot(&self, symbols: &[String]) -> Result<Vec<Quote>> {
        let quotes = self.ltp(symbols).await?;
        if quotes.len() < symbols.len() {
            warn!(
                "Snapshot returned {} of {} instruments",
                quotes.len(),
                symbols.len()
            );
        }
        Ok(quotes)
    }
}

#[async_trait]
impl Reauthenticator for KiteClient {
    async fn reauthenticate(&self) -> Result<()> {
        self.create_session().await
    }
}
