use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::Path;

use crate::error::{EngineError, Result};
use crate::feed::FeedConfig;
use crate::oms::OrderManagerConfig;
use crate::recovery::SupervisorConfig;
use crate::risk::RiskConfig;
use crate::types::ExecutionMode;

/// Serde adapter for `Duration` fields stored as integer milliseconds
pub mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Credential that never appears in logs or `Debug` output
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Raw value, for request signing only
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First and last four characters only
    pub fn mask(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() <= 8 {
            return "****".to_string();
        }
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({})", self.mask())
    }
}

/// Kite Connect credentials and endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerageSettings {
    pub api_key: String,
    pub api_secret: Secret,
    /// Session token from an earlier login, if any
    #[serde(default)]
    pub access_token: Secret,
    /// One-time token from the login redirect, exchanged for an access token
    #[serde(default)]
    pub request_token: Option<Secret>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

fn default_base_url() -> String {
    "https://api.kite.trade".to_string()
}

impl BrokerageSettings {
    /// Load from `KITE_API_KEY`, `KITE_API_SECRET`, `KITE_ACCESS_TOKEN` and
    /// `KITE_REQUEST_TOKEN`
    pub fn from_env() -> Result<Self> {
        let required = |name: &str| -> Result<String> {
            match env::var(name) {
                Ok(value) if !value.is_empty() => Ok(value),
                _ => Err(EngineError::Config(format!("{} is not set", name))),
            }
        };

        Ok(Self {
            api_key: required("KITE_API_KEY")?,
            api_secret: Secret::new(required("KITE_API_SECRET")?),
            access_token: Secret::new(env::var("KITE_ACCESS_TOKEN").unwrap_or_default()),
            request_token: env::var("KITE_REQUEST_TOKEN").ok().filter(|t| !t.is_empty()).map(Secret::new),
            base_url: default_base_url(),
        })
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub mode: ExecutionMode,
    /// Market symbols the feed tracks
    pub instruments: Vec<String>,
    pub log_level: String,
    pub log_file: Option<String>,
    pub supervisor: SupervisorConfig,
    pub feed: FeedConfig,
    pub risk: RiskConfig,
    pub orders: OrderManagerConfig,
    pub brokerage: Option<BrokerageSettings>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Paper,
            instruments: vec!["NIFTY".to_string(), "BANKNIFTY".to_string()],
            log_level: "info".to_string(),
            log_file: None,
            supervisor: SupervisorConfig::default(),
            feed: FeedConfig::default(),
            risk: RiskConfig::default(),
            orders: OrderManagerConfig::default(),
            brokerage: None,
        }
    }
}

impl EngineConfig {
    /// Read a JSON config file; missing sections take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let mut config: EngineConfig = serde_json::from_str(&raw)?;
        // Top-level mode wins over the order manager's own
        config.orders.mode = config.mode;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let fraction = |name: &str, value: f64| -> Result<()> {
            if value > 0.0 && value <= 1.0 {
                Ok(())
            } else {
                Err(EngineError::Config(format!(
                    "{} must be in (0, 1], got {}",
                    name, value
                )))
            }
        };

        if self.instruments.is_empty() {
            return Err(EngineError::Config("no instruments configured".to_string()));
        }
        if self.supervisor.retry.max_attempts == 0 {
            return Err(EngineError::Config("retry.max_attempts must be at least 1".to_string()));
        }
        if self.supervisor.failure_threshold == 0 {
            return Err(EngineError::Config("failure_threshold must be at least 1".to_string()));
        }
        if self.supervisor.retry.multiplier < 1.0 {
            return Err(EngineError::Config("retry.multiplier must be at least 1".to_string()));
        }
        if self.feed.poll_interval.is_zero() || self.feed.heartbeat_interval.is_zero() {
            return Err(EngineError::Config("feed intervals must be non-zero".to_string()));
        }
        if self.orders.reconcile_interval.is_zero() {
            return Err(EngineError::Config("reconcile_interval must be non-zero".to_string()));
        }
        if self.orders.min_price_ratio >= self.orders.max_price_ratio {
            return Err(EngineError::Config("min_price_ratio must be below max_price_ratio".to_string()));
        }

        let risk = &self.risk;
        fraction("max_daily_loss_fraction", risk.max_daily_loss_fraction)?;
        fraction("max_position_fraction", risk.max_position_fraction)?;
        fraction("intraday_exit_loss_fraction", risk.intraday_exit_loss_fraction)?;
        fraction("kelly_multiplier", risk.kelly_multiplier)?;
        fraction("max_capital_fraction", risk.max_capital_fraction)?;
        fraction("kelly_floor", risk.kelly_floor)?;
        fraction("default_win_probability", risk.default_win_probability)?;
        if risk.intraday_exit_loss_fraction > risk.max_daily_loss_fraction {
            return Err(EngineError::Config(
                "intraday_exit_loss_fraction must not exceed max_daily_loss_fraction".to_string(),
            ));
        }
        if risk.block_score <= 0.0 || risk.block_score > 100.0 {
            return Err(EngineError::Config("block_score must be in (0, 100]".to_string()));
        }
        if risk.default_lot_size == 0 || risk.lot_sizes.values().any(|lot| *lot == 0) {
            return Err(EngineError::Config("lot sizes must be positive".to_string()));
        }

        if self.mode == ExecutionMode::Real && self.brokerage.is_none() {
            return Err(EngineError::Config(
                "real mode requires brokerage settings".to_string(),
            ));
        }
        Ok(())
    }
}
