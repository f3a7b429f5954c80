//! Portfolio tracking - Position and cash management

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::error::{BotError, Result};
use crate::types::{Action, TradeOutcome};

/// Cash and per-token positions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    /// Cash balance in quote units
    pub cash: Decimal,
    /// Open positions by token mint
    pub positions: HashMap<String, Position>,
    /// Realized P&L over the portfolio's lifetime, before fees
    #[serde(default)]
    pub realized_pnl: Decimal,
    /// Fees paid over the portfolio's lifetime
    #[serde(default)]
    pub fees_paid: Decimal,
    pub last_updated: DateTime<Utc>,
}

/// A single position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub token: String,
    pub quantity_held: Decimal,
    pub average_entry_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub current_price: Option<Decimal>,
}

impl Position {
    pub fn empty(token: &str) -> Self {
        Self {
            token: token.to_string(),
            quantity_held: Decimal::ZERO,
            average_entry_price: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            opened_at: None,
            current_price: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.quantity_held <= Decimal::ZERO
    }

    /// Value at the last marked price, falling back to cost basis
    pub fn market_value(&self) -> Decimal {
        let price = self.current_price.unwrap_or(self.average_entry_price);
        self.quantity_held * price
    }

    fn mark(&mut self, price: Decimal) {
        self.current_price = Some(price);
        self.unrealized_pnl = (price - self.average_entry_price) * self.quantity_held;
    }
}

/// Effect of applying one fill
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FillEffect {
    /// Realized P&L before fees; zero for buys
    pub realized_pnl: Decimal,
    pub quantity_after: Decimal,
    pub cash_after: Decimal,
}

/// Portfolio snapshot for reporting
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioSnapshot {
    pub cash: Decimal,
    pub positions: Vec<PositionSnapshot>,
    pub total_equity: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub fees_paid: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionSnapshot {
    pub token: String,
    pub quantity: Decimal,
    pub avg_entry: Decimal,
    pub current_price: Option<Decimal>,
    pub market_value: Decimal,
    pub unrealized_pnl: Decimal,
}

impl Portfolio {
    /// Create new portfolio with starting cash
    pub fn new(starting_cash: Decimal) -> Self {
        Self {
            cash: starting_cash,
            positions: HashMap::new(),
            realized_pnl: Decimal::ZERO,
            fees_paid: Decimal::ZERO,
            last_updated: Utc::now(),
        }
    }

    /// Position for a token, empty if none is open
    pub fn position(&self, token: &str) -> Position {
        self.positions
            .get(token)
            .cloned()
            .unwrap_or_else(|| Position::empty(token))
    }

    pub fn get_position(&self, token: &str) -> Option<&Position> {
        self.positions.get(token)
    }

    /// Apply a successful fill exactly as reported
    ///
    /// Buys are exact-in: `requested_amount` of quote is spent plus the fee,
    /// and a buy costing more than the cash held is rejected untouched.
    /// Sells never reduce a position below zero.
    pub fn apply_fill(&mut self, outcome: &TradeOutcome) -> Result<FillEffect> {
        if !outcome.is_fill() {
            return Err(BotError::Validation(format!(
                "outcome for {} is not a fill",
                outcome.token
            )));
        }
        if outcome.price <= Decimal::ZERO || outcome.fee < Decimal::ZERO {
            return Err(BotError::Validation(format!(
                "fill for {} has price {} and fee {}",
                outcome.token, outcome.price, outcome.fee
            )));
        }

        if outcome.action == Action::Buy {
            let cost = outcome.requested_amount + outcome.fee;
            if cost > self.cash {
                return Err(BotError::Validation(format!(
                    "buy of {} costs {} but only {} cash is held",
                    outcome.token, cost, self.cash
                )));
            }
        }

        let now = Utc::now();
        let realized = match outcome.action {
            Action::Buy => self.apply_buy(outcome, now),
            Action::Sell => self.apply_sell(outcome)?,
            Action::Hold => Decimal::ZERO,
        };

        self.fees_paid += outcome.fee;
        self.realized_pnl += realized;
        self.last_updated = now;

        Ok(FillEffect {
            realized_pnl: realized,
            quantity_after: self.position(&outcome.token).quantity_held,
            cash_after: self.cash,
        })
    }

    fn apply_buy(&mut self, outcome: &TradeOutcome, now: DateTime<Utc>) -> Decimal {
        self.cash -= outcome.requested_amount + outcome.fee;

        let pos = self
            .positions
            .entry(outcome.token.clone())
            .or_insert_with(|| Position::empty(&outcome.token));
        let old_qty = pos.quantity_held;
        let new_qty = old_qty + outcome.filled_amount;

        // Quantity-weighted average over the existing and new lots
        pos.average_entry_price = (old_qty * pos.average_entry_price
            + outcome.filled_amount * outcome.price)
            / new_qty;
        pos.quantity_held = new_qty;
        if pos.opened_at.is_none() {
            pos.opened_at = Some(now);
            info!(
                token = %outcome.token,
                qty = %new_qty,
                entry = %pos.average_entry_price,
                "New position"
            );
        } else {
            debug!(
                token = %outcome.token,
                "Position updated: qty {} -> {} | avg {}",
                old_qty, new_qty, pos.average_entry_price
            );
        }
        pos.mark(outcome.price);

        Decimal::ZERO
    }

    fn apply_sell(&mut self, outcome: &TradeOutcome) -> Result<Decimal> {
        let pos = self.positions.get_mut(&outcome.token).ok_or_else(|| {
            BotError::Validation(format!("sell fill for {} without a position", outcome.token))
        })?;

        let sold = outcome.filled_amount.min(pos.quantity_held);
        if sold < outcome.filled_amount {
            warn!(
                token = %outcome.token,
                filled = %outcome.filled_amount,
                held = %pos.quantity_held,
                "Sell fill larger than position, capping"
            );
        }

        let realized = (outcome.price - pos.average_entry_price) * sold;
        let proceeds = sold * outcome.price - outcome.fee;
        self.cash = (self.cash + proceeds).max(Decimal::ZERO);
        pos.quantity_held -= sold;

        if pos.is_empty() {
            self.positions.remove(&outcome.token);
            info!(
                token = %outcome.token,
                realized = %realized,
                "Position closed"
            );
        } else {
            pos.mark(outcome.price);
        }

        Ok(realized)
    }

    /// Update the current price of one position
    pub fn mark_to_market(&mut self, token: &str, price: Decimal) {
        if let Some(pos) = self.positions.get_mut(token) {
            pos.mark(price);
            self.last_updated = Utc::now();
        }
    }

    /// Cash plus all positions at their last marked price
    pub fn total_equity(&self) -> Decimal {
        self.cash
            + self
                .positions
                .values()
                .map(Position::market_value)
                .sum::<Decimal>()
    }

    /// Get portfolio snapshot
    pub fn snapshot(&self) -> PortfolioSnapshot {
        let mut positions: Vec<PositionSnapshot> = self
            .positions
            .values()
            .map(|pos| PositionSnapshot {
                token: pos.token.clone(),
                quantity: pos.quantity_held,
                avg_entry: pos.average_entry_price,
                current_price: pos.current_price,
                market_value: pos.market_value(),
                unrealized_pnl: pos.unrealized_pnl,
            })
            .collect();
        positions.sort_by(|a, b| a.token.cmp(&b.token));

        let unrealized_pnl = positions.iter().map(|p| p.unrealized_pnl).sum();

        PortfolioSnapshot {
            cash: self.cash,
            positions,
            total_equity: self.total_equity(),
            unrealized_pnl,
            realized_pnl: self.realized_pnl,
            fees_paid: self.fees_paid,
        }
    }
}
