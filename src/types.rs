//! Core value types shared by the decision and execution loop

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;

/// Trade action proposed by the policy and vetted by risk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

impl Action {
    pub const ALL: [Action; 3] = [Action::Buy, Action::Sell, Action::Hold];

    /// Tie-break order for greedy selection, highest priority first
    pub const PRIORITY: [Action; 3] = [Action::Hold, Action::Sell, Action::Buy];

    pub fn index(&self) -> usize {
        match self {
            Action::Buy => 0,
            Action::Sell => 1,
            Action::Hold => 2,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Buy => write!(f, "buy"),
            Action::Sell => write!(f, "sell"),
            Action::Hold => write!(f, "hold"),
        }
    }
}

/// Discretized market snapshot used as the QTable key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MarketState {
    pub price_bucket: u8,
    pub momentum_bucket: u8,
    pub sentiment_bucket: u8,
    pub volatility_bucket: u8,
}

impl MarketState {
    pub fn new(
        price_bucket: u8,
        momentum_bucket: u8,
        sentiment_bucket: u8,
        volatility_bucket: u8,
    ) -> Self {
        Self {
            price_bucket,
            momentum_bucket,
            sentiment_bucket,
            volatility_bucket,
        }
    }
}

/// A market state together with the raw readings it was derived from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub token: String,
    pub state: MarketState,
    /// Latest price in quote units
    pub price: Decimal,
    /// Sentiment score in [-1, 1]
    pub sentiment: f64,
    #[serde(default)]
    pub mentions: u64,
    /// True when either reading fell back to a last-known value
    pub stale: bool,
    pub observed_at: DateTime<Utc>,
}

/// Result of one execution attempt for a vetted action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub token: String,
    pub action: Action,
    /// Logical order id, absent for holds
    pub order_id: Option<Uuid>,
    /// Quote units for buys, token units for sells
    pub requested_amount: Decimal,
    /// Token units bought or sold
    pub filled_amount: Decimal,
    /// Realized execution price in quote units per token
    pub price: Decimal,
    /// Fee in quote units
    pub fee: Decimal,
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    pub attempts: u32,
    pub message: String,
    pub completed_at: DateTime<Utc>,
}

impl TradeOutcome {
    /// Immediate successful outcome for a hold
    pub fn hold(token: &str, price: Decimal) -> Self {
        Self {
            token: token.to_string(),
            action: Action::Hold,
            order_id: None,
            requested_amount: Decimal::ZERO,
            filled_amount: Decimal::ZERO,
            price,
            fee: Decimal::ZERO,
            success: true,
            error_kind: None,
            attempts: 0,
            message: "hold".to_string(),
            completed_at: Utc::now(),
        }
    }

    /// Whether this outcome moved funds and must be applied to the portfolio
    pub fn is_fill(&self) -> bool {
        self.success && self.action != Action::Hold && self.filled_amount > Decimal::ZERO
    }
}
