//! Process configuration
//!
//! Layered sources, lowest precedence first: serde defaults, an optional
//! config file (`SCALPER_CONFIG`, default `scalper.{toml,yaml,json}`), then
//! `SCALPER__*` environment variables. Validated once at startup and treated
//! as immutable afterwards.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::amount::{resolve_mint, SOL_MINT};
use crate::error::{BotError, Result};
use crate::policy::PolicyConfig;
use crate::signals::SignalConfig;

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Tokens to trade (symbols or mint addresses)
    pub tokens: Vec<String>,
    #[serde(default = "default_quote_mint")]
    pub quote_mint: String,
    #[serde(default)]
    pub trading_mode: TradingMode,
    #[serde(default)]
    pub wallet_private_key: Option<WalletKey>,
    #[serde(default = "default_cycle_interval_secs")]
    pub cycle_interval_secs: u64,
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    #[serde(default)]
    pub risk: RiskParameters,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub signals: SignalConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub endpoints: EndpointConfig,
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    #[default]
    Paper,
    Live,
}

/// Base58 wallet keypair; never printed
#[derive(Clone, Deserialize, Serialize)]
#[serde(transparent)]
pub struct WalletKey(String);

impl WalletKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Base58 public key: the second half of a 64-byte keypair
    pub fn public_key(&self) -> Result<String> {
        match bs58::decode(&self.0).into_vec() {
            Ok(bytes) if bytes.len() == 64 => Ok(bs58::encode(&bytes[32..]).into_string()),
            _ => Err(BotError::Fatal(
                "wallet_private_key is not a valid base58 keypair".to_string(),
            )),
        }
    }
}

impl std::fmt::Debug for WalletKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WalletKey(***)")
    }
}

/// Immutable risk limits
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct RiskParameters {
    /// Max allowed deviation of fill price from quote (fraction)
    #[serde(default = "default_slippage_tolerance")]
    pub slippage_tolerance: Decimal,
    /// Unrealized gain (fraction of entry) that forces a sell
    #[serde(default = "default_profit_threshold")]
    pub profit_threshold: Decimal,
    /// Loss (fraction of entry) that forces a sell
    #[serde(default = "default_stop_loss_percentage")]
    pub stop_loss_percentage: Decimal,
    /// Starting capital in quote units
    #[serde(default = "default_initial_investment")]
    pub initial_investment: Decimal,
    /// Max exposure per token as a fraction of total capital
    #[serde(default = "default_max_position_fraction")]
    pub max_position_fraction: Decimal,
    /// Fraction of available cash allocated to one buy
    #[serde(default = "default_trade_fraction")]
    pub trade_fraction: Decimal,
    /// Mention count at or above which a social surge is suspected
    #[serde(default = "default_surge_mentions_threshold")]
    pub surge_mentions_threshold: u64,
    /// Sentiment at or above which a social surge is suspected
    #[serde(default = "default_surge_sentiment_threshold")]
    pub surge_sentiment_threshold: f64,
}

impl Default for RiskParameters {
    fn default() -> Self {
        Self {
            slippage_tolerance: default_slippage_tolerance(),
            profit_threshold: default_profit_threshold(),
            stop_loss_percentage: default_stop_loss_percentage(),
            initial_investment: default_initial_investment(),
            max_position_fraction: default_max_position_fraction(),
            trade_fraction: default_trade_fraction(),
            surge_mentions_threshold: default_surge_mentions_threshold(),
            surge_sentiment_threshold: default_surge_sentiment_threshold(),
        }
    }
}

/// Execution configuration (retries, backoff, timeouts)
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct ExecutionConfig {
    /// Total submission attempts per logical order
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Per-attempt confirmation timeout in seconds
    #[serde(default = "default_confirm_timeout_secs")]
    pub confirm_timeout_secs: u64,
    /// Fee charged by the paper simulator in basis points
    #[serde(default = "default_paper_fee_bps")]
    pub paper_fee_bps: u32,
}

impl ExecutionConfig {
    /// Backoff before attempt `attempt + 1`, doubling from the base
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(
            self.base_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_secs)
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            confirm_timeout_secs: default_confirm_timeout_secs(),
            paper_fee_bps: default_paper_fee_bps(),
        }
    }
}

/// External service endpoints
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct EndpointConfig {
    #[serde(default = "default_price_api_url")]
    pub price_api_url: String,
    #[serde(default)]
    pub sentiment_api_url: Option<String>,
    #[serde(default = "default_swap_gateway_url")]
    pub swap_gateway_url: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            price_api_url: default_price_api_url(),
            sentiment_api_url: None,
            swap_gateway_url: default_swap_gateway_url(),
        }
    }
}

fn default_quote_mint() -> String { SOL_MINT.to_string() }
fn default_cycle_interval_secs() -> u64 { 10 }
fn default_fetch_timeout_ms() -> u64 { 5_000 }
fn default_log_level() -> String { "info".to_string() }
fn default_slippage_tolerance() -> Decimal { Decimal::new(5, 3) }
fn default_profit_threshold() -> Decimal { Decimal::new(45, 2) }
fn default_stop_loss_percentage() -> Decimal { Decimal::new(10, 2) }
fn default_initial_investment() -> Decimal { Decimal::from(100) }
fn default_max_position_fraction() -> Decimal { Decimal::new(25, 2) }
fn default_trade_fraction() -> Decimal { Decimal::new(2, 2) }
fn default_surge_mentions_threshold() -> u64 { 200 }
fn default_surge_sentiment_threshold() -> f64 { 0.7 }
fn default_max_retries() -> u32 { 3 }
fn default_base_backoff_ms() -> u64 { 500 }
fn default_max_backoff_ms() -> u64 { 8_000 }
fn default_confirm_timeout_secs() -> u64 { 60 }
fn default_paper_fee_bps() -> u32 { 30 }
fn default_price_api_url() -> String { "https://api.dexscreener.com".to_string() }
fn default_swap_gateway_url() -> String { "http://localhost:8899".to_string() }

impl Config {
    /// Load from file and environment, then validate
    pub fn load() -> Result<Self> {
        let path = std::env::var("SCALPER_CONFIG").unwrap_or_else(|_| "scalper".to_string());

        let settings = config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .add_source(
                config::Environment::with_prefix("SCALPER")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("tokens")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| BotError::Validation(format!("failed to read configuration: {}", e)))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| BotError::Validation(format!("invalid configuration: {}", e)))?;

        config.validated()
    }

    /// Parse a TOML document and validate it
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| BotError::Validation(format!("invalid configuration: {}", e)))?;

        config.validated()
    }

    /// Validate and canonicalize token addresses
    pub fn validated(mut self) -> Result<Self> {
        self.validate()?;
        self.tokens = self
            .tokens
            .iter()
            .map(|t| resolve_mint(t.trim()))
            .collect::<Result<Vec<_>>>()?;
        self.quote_mint = resolve_mint(&self.quote_mint)?;
        Ok(self)
    }

    /// Check every invariant the core relies on
    pub fn validate(&self) -> Result<()> {
        if self.tokens.is_empty() {
            return invalid("token list is empty");
        }
        for token in &self.tokens {
            resolve_mint(token.trim())?;
        }
        if self.cycle_interval_secs == 0 {
            return invalid("cycle_interval_secs must be positive");
        }
        if self.fetch_timeout_ms == 0 {
            return invalid("fetch_timeout_ms must be positive");
        }

        let r = &self.risk;
        let one = Decimal::ONE;
        if r.slippage_tolerance <= Decimal::ZERO || r.slippage_tolerance >= one {
            return invalid("slippage_tolerance must be in (0, 1)");
        }
        if r.profit_threshold <= Decimal::ZERO {
            return invalid("profit_threshold must be positive");
        }
        if r.stop_loss_percentage <= Decimal::ZERO || r.stop_loss_percentage >= one {
            return invalid("stop_loss_percentage must be in (0, 1)");
        }
        if r.initial_investment <= Decimal::ZERO {
            return invalid("initial_investment must be positive");
        }
        if r.max_position_fraction <= Decimal::ZERO || r.max_position_fraction > one {
            return invalid("max_position_fraction must be in (0, 1]");
        }
        if r.trade_fraction <= Decimal::ZERO || r.trade_fraction >= one {
            return invalid("trade_fraction must be in (0, 1)");
        }
        if !(-1.0..=1.0).contains(&r.surge_sentiment_threshold) {
            return invalid("surge_sentiment_threshold must be in [-1, 1]");
        }

        if self.execution.max_retries == 0 {
            return invalid("max_retries must be at least 1");
        }
        if self.execution.confirm_timeout_secs == 0 {
            return invalid("confirm_timeout_secs must be positive");
        }

        self.policy.validate()?;
        self.signals.validate()?;

        if self.trading_mode == TradingMode::Live {
            let key = self.wallet_private_key.as_ref().ok_or_else(|| {
                BotError::Fatal("wallet_private_key is required in live mode".to_string())
            })?;
            key.public_key()?;
        }

        let quote = resolve_mint(&self.quote_mint)?;
        if self
            .tokens
            .iter()
            .any(|t| resolve_mint(t.trim()).ok().as_deref() == Some(quote.as_str()))
        {
            return invalid("quote_mint cannot also be a traded token");
        }

        Ok(())
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Directory for persisted state and the trade journal
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("scalp-runner")
        })
    }
}

fn invalid(message: &str) -> Result<()> {
    Err(BotError::Validation(message.to_string()))
}
