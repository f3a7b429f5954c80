//! Signal acquisition and discretization
//!
//! Price and sentiment are fetched concurrently for each cycle. Raw readings
//! never leave this module: they are validated, folded into a rolling price
//! history and binned into a [`MarketState`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{BotError, FeedError, Result};
use crate::types::{MarketSnapshot, MarketState};

/// Price reading from the market-data collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceReading {
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Sentiment reading from the social-feed collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentReading {
    /// Score in [-1, 1]
    pub score: f64,
    /// Social mentions the score was computed from
    #[serde(default)]
    pub mentions: u64,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn get_price(&self, token: &str) -> std::result::Result<PriceReading, FeedError>;
}

#[async_trait]
pub trait SentimentFeed: Send + Sync {
    async fn get_sentiment(&self, token: &str)
        -> std::result::Result<SentimentReading, FeedError>;
}

/// Fixed-width binning over `[lower, upper]`, clamped at both edges
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Binning {
    pub lower: f64,
    pub upper: f64,
    pub bins: u8,
}

impl Binning {
    pub const fn new(lower: f64, upper: f64, bins: u8) -> Self {
        Self { lower, upper, bins }
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        if !self.lower.is_finite() || !self.upper.is_finite() || self.lower >= self.upper {
            return Err(BotError::Validation(format!(
                "{} binning needs finite lower < upper",
                name
            )));
        }
        if self.bins == 0 {
            return Err(BotError::Validation(format!(
                "{} binning needs at least one bin",
                name
            )));
        }
        Ok(())
    }

    /// Bucket index for a value; non-finite values are rejected
    pub fn bucket(&self, value: f64) -> Result<u8> {
        if !value.is_finite() {
            return Err(BotError::Validation(format!(
                "cannot bucket non-finite value {}",
                value
            )));
        }
        let width = (self.upper - self.lower) / self.bins as f64;
        let idx = ((value - self.lower) / width).floor();
        Ok(idx.clamp(0.0, (self.bins - 1) as f64) as u8)
    }
}

/// Discretization settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalConfig {
    /// Number of prices kept per token for momentum and volatility
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// Deviation of price from the window mean (fraction)
    #[serde(default = "default_price_binning")]
    pub price: Binning,
    /// Return over the window (fraction)
    #[serde(default = "default_momentum_binning")]
    pub momentum: Binning,
    #[serde(default = "default_sentiment_binning")]
    pub sentiment: Binning,
    /// Std-dev of per-cycle returns
    #[serde(default = "default_volatility_binning")]
    pub volatility: Binning,
}

impl SignalConfig {
    pub fn validate(&self) -> Result<()> {
        if self.history_window < 2 {
            return Err(BotError::Validation(
                "history_window must be at least 2".to_string(),
            ));
        }
        self.price.validate("price")?;
        self.momentum.validate("momentum")?;
        self.sentiment.validate("sentiment")?;
        self.volatility.validate("volatility")
    }
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            history_window: default_history_window(),
            price: default_price_binning(),
            momentum: default_momentum_binning(),
            sentiment: default_sentiment_binning(),
            volatility: default_volatility_binning(),
        }
    }
}

fn default_history_window() -> usize { 20 }
fn default_price_binning() -> Binning { Binning::new(-0.10, 0.10, 5) }
fn default_momentum_binning() -> Binning { Binning::new(-0.05, 0.05, 5) }
fn default_sentiment_binning() -> Binning { Binning::new(-1.0, 1.0, 5) }
fn default_volatility_binning() -> Binning { Binning::new(0.0, 0.05, 4) }

/// Per-token rolling inputs
#[derive(Debug, Default)]
struct TokenSignals {
    history: VecDeque<f64>,
    last_price: Option<PriceReading>,
    last_sentiment: Option<SentimentReading>,
}

/// Turns raw feed readings into typed market snapshots
pub struct SignalAggregator {
    price_feed: Arc<dyn PriceFeed>,
    sentiment_feed: Arc<dyn SentimentFeed>,
    config: SignalConfig,
    fetch_timeout: Duration,
    tokens: HashMap<String, TokenSignals>,
}

impl SignalAggregator {
    pub fn new(
        price_feed: Arc<dyn PriceFeed>,
        sentiment_feed: Arc<dyn SentimentFeed>,
        config: SignalConfig,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            price_feed,
            sentiment_feed,
            config,
            fetch_timeout,
            tokens: HashMap::new(),
        }
    }

    /// Fetch price and sentiment concurrently and build a snapshot
    ///
    /// A failed or timed-out feed falls back to its last-known reading and
    /// marks the snapshot stale. Without any usable reading the cause is
    /// returned and the cycle must be skipped: [`BotError::TransientIo`] for
    /// a failed or slow feed, [`BotError::Validation`] for a malformed reading.
    pub async fn acquire(&mut self, token: &str) -> Result<MarketSnapshot> {
        let (price_res, sentiment_res) = tokio::join!(
            timeout(self.fetch_timeout, self.price_feed.get_price(token)),
            timeout(self.fetch_timeout, self.sentiment_feed.get_sentiment(token)),
        );
        let timeout_ms = self.fetch_timeout.as_millis() as u64;

        let fresh_price = match price_res {
            Ok(Ok(reading)) => validate_price(&reading).map(|()| reading),
            Ok(Err(e)) => Err(BotError::TransientIo(format!("price feed: {}", e))),
            Err(_) => Err(BotError::TransientIo(format!(
                "price feed timed out after {}ms",
                timeout_ms
            ))),
        };

        let fresh_sentiment = match sentiment_res {
            Ok(Ok(reading)) => validate_sentiment(&reading).map(|()| reading),
            Ok(Err(e)) => Err(BotError::TransientIo(format!("sentiment feed: {}", e))),
            Err(_) => Err(BotError::TransientIo(format!(
                "sentiment feed timed out after {}ms",
                timeout_ms
            ))),
        };

        let window = self.config.history_window;
        let entry = self.tokens.entry(token.to_string()).or_default();
        let mut stale = false;

        let price = match fresh_price {
            Ok(reading) => {
                let value = decimal_to_f64(reading.price)?;
                entry.history.push_back(value);
                while entry.history.len() > window {
                    entry.history.pop_front();
                }
                entry.last_price = Some(reading.clone());
                reading
            }
            Err(cause) => {
                stale = true;
                match entry.last_price.clone() {
                    Some(last) => {
                        warn!(token, error = %cause, "Using last known price");
                        last
                    }
                    None => return Err(cause),
                }
            }
        };

        let sentiment = match fresh_sentiment {
            Ok(reading) => {
                entry.last_sentiment = Some(reading.clone());
                reading
            }
            Err(cause) => {
                stale = true;
                match entry.last_sentiment.clone() {
                    Some(last) => {
                        warn!(token, error = %cause, "Using last known sentiment");
                        last
                    }
                    None => return Err(cause),
                }
            }
        };

        let state = discretize(&self.config, &entry.history, sentiment.score)?;
        debug!(token, ?state, stale, price = %price.price, mentions = sentiment.mentions, "Acquired market snapshot");

        Ok(MarketSnapshot {
            token: token.to_string(),
            state,
            price: price.price,
            sentiment: sentiment.score,
            mentions: sentiment.mentions,
            stale,
            observed_at: Utc::now(),
        })
    }
}

fn validate_price(reading: &PriceReading) -> Result<()> {
    if reading.price <= Decimal::ZERO {
        return Err(BotError::Validation(format!(
            "price must be positive, got {}",
            reading.price
        )));
    }
    Ok(())
}

fn validate_sentiment(reading: &SentimentReading) -> Result<()> {
    if !reading.score.is_finite() || reading.score.abs() > 1.0 {
        return Err(BotError::Validation(format!(
            "sentiment {} is outside [-1, 1]",
            reading.score
        )));
    }
    Ok(())
}

fn decimal_to_f64(value: Decimal) -> Result<f64> {
    value
        .to_f64()
        .filter(|v| v.is_finite())
        .ok_or_else(|| BotError::Validation(format!("price {} is not representable", value)))
}

/// Bin a price history (latest last) and sentiment score into a state
pub fn discretize(config: &SignalConfig, history: &VecDeque<f64>, sentiment: f64) -> Result<MarketState> {
    let latest = *history
        .back()
        .ok_or_else(|| BotError::Validation("empty price history".to_string()))?;

    let mean = history.iter().sum::<f64>() / history.len() as f64;
    let deviation = (latest - mean) / mean;

    let oldest = history.front().copied().unwrap_or(latest);
    let momentum = (latest - oldest) / oldest;

    let returns: Vec<f64> = history
        .iter()
        .zip(history.iter().skip(1))
        .map(|(prev, next)| (next - prev) / prev)
        .collect();
    let volatility = if returns.len() < 2 {
        0.0
    } else {
        let avg = returns.iter().sum::<f64>() / returns.len() as f64;
        let var = returns.iter().map(|r| (r - avg).powi(2)).sum::<f64>() / returns.len() as f64;
        var.sqrt()
    };

    Ok(MarketState {
        price_bucket: config.price.bucket(deviation)?,
        momentum_bucket: config.momentum.bucket(momentum)?,
        sentiment_bucket: config.sentiment.bucket(sentiment)?,
        volatility_bucket: config.volatility.bucket(volatility)?,
    })
}
