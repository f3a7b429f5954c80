//! Risk management: stop-loss, take-profit, exposure limits and sizing
//!
//! The risk manager sits between the policy and the execution engine. It
//! never fails; a veto is a valid outcome that downgrades to `Hold`.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RiskParameters;
use crate::portfolio::Position;
use crate::types::{Action, MarketSnapshot};

/// Capital figures the sizing rules need
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Capital {
    /// Cash available to spend
    pub available: Decimal,
    /// Cash plus marked value of all positions
    pub total_equity: Decimal,
}

impl Capital {
    pub fn new(available: Decimal, total_equity: Decimal) -> Self {
        Self {
            available,
            total_equity,
        }
    }
}

/// Why the final action was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskReason {
    Approved,
    StopLoss,
    TakeProfit,
    /// Take-profit reached but a social surge keeps the position open
    SurgeHold,
    NoPosition,
    StalePrice,
    NoCapital,
    ExposureLimit,
}

/// Vetted action with its size
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskDecision {
    pub action: Action,
    /// Quote units for buys, token units for sells, zero for holds
    pub amount: Decimal,
    pub reason: RiskReason,
}

impl RiskDecision {
    fn hold(reason: RiskReason) -> Self {
        Self {
            action: Action::Hold,
            amount: Decimal::ZERO,
            reason,
        }
    }

    fn sell_all(position: &Position, reason: RiskReason) -> Self {
        Self {
            action: Action::Sell,
            amount: position.quantity_held,
            reason,
        }
    }

    /// True when risk replaced the proposed action
    pub fn overrode(&self, proposed: Action) -> bool {
        self.action != proposed
    }
}

/// Vets proposed actions against position and capital constraints
#[derive(Debug, Clone)]
pub struct RiskManager {
    params: RiskParameters,
}

impl RiskManager {
    pub fn new(params: RiskParameters) -> Self {
        Self { params }
    }

    /// Evaluate a proposal; forced exits win over anything the policy proposed
    pub fn evaluate(
        &self,
        proposed: Action,
        position: &Position,
        snapshot: &MarketSnapshot,
        capital: Capital,
    ) -> RiskDecision {
        let price = snapshot.price;

        if self.check_stop_loss(position, price) {
            warn!(
                token = %position.token,
                entry = %position.average_entry_price,
                price = %price,
                %proposed,
                "Stop-loss triggered, forcing sell"
            );
            return RiskDecision::sell_all(position, RiskReason::StopLoss);
        }

        if self.check_take_profit(position, price) {
            if self.surge_detected(snapshot) {
                info!(
                    token = %position.token,
                    entry = %position.average_entry_price,
                    price = %price,
                    mentions = snapshot.mentions,
                    sentiment = snapshot.sentiment,
                    "Take-profit reached during a social surge, holding"
                );
                return RiskDecision::hold(RiskReason::SurgeHold);
            }
            info!(
                token = %position.token,
                entry = %position.average_entry_price,
                price = %price,
                "Take-profit triggered, forcing sell"
            );
            return RiskDecision::sell_all(position, RiskReason::TakeProfit);
        }

        let decision = match proposed {
            Action::Hold => RiskDecision::hold(RiskReason::Approved),
            Action::Sell if position.is_empty() => RiskDecision::hold(RiskReason::NoPosition),
            Action::Sell => RiskDecision::sell_all(position, RiskReason::Approved),
            Action::Buy => self.size_buy(position, snapshot, capital),
        };

        if decision.overrode(proposed) {
            debug!(
                token = %snapshot.token,
                %proposed,
                action = %decision.action,
                reason = ?decision.reason,
                "Proposal vetoed"
            );
        }
        decision
    }

    fn size_buy(&self, position: &Position, snapshot: &MarketSnapshot, capital: Capital) -> RiskDecision {
        if snapshot.stale {
            return RiskDecision::hold(RiskReason::StalePrice);
        }
        if capital.available <= Decimal::ZERO {
            return RiskDecision::hold(RiskReason::NoCapital);
        }

        let exposure = position.quantity_held * snapshot.price;
        let headroom = self.params.max_position_fraction * capital.total_equity - exposure;
        if headroom <= Decimal::ZERO {
            return RiskDecision::hold(RiskReason::ExposureLimit);
        }

        let amount = (capital.available * self.params.trade_fraction)
            .min(headroom)
            .min(capital.available);
        if amount <= Decimal::ZERO {
            return RiskDecision::hold(RiskReason::NoCapital);
        }

        RiskDecision {
            action: Action::Buy,
            amount,
            reason: RiskReason::Approved,
        }
    }

    /// Heavy social volume with strongly positive sentiment
    pub fn surge_detected(&self, snapshot: &MarketSnapshot) -> bool {
        snapshot.mentions >= self.params.surge_mentions_threshold
            && snapshot.sentiment >= self.params.surge_sentiment_threshold
    }

    /// True when the loss from entry reaches the stop-loss percentage
    pub fn check_stop_loss(&self, position: &Position, current_price: Decimal) -> bool {
        match Self::return_from_entry(position, current_price) {
            Some(change) => change <= -self.params.stop_loss_percentage,
            None => false,
        }
    }

    /// True when the gain from entry reaches the profit threshold
    pub fn check_take_profit(&self, position: &Position, current_price: Decimal) -> bool {
        match Self::return_from_entry(position, current_price) {
            Some(change) => change >= self.params.profit_threshold,
            None => false,
        }
    }

    fn return_from_entry(position: &Position, current_price: Decimal) -> Option<Decimal> {
        if position.is_empty() || position.average_entry_price <= Decimal::ZERO {
            return None;
        }
        Some((current_price - position.average_entry_price) / position.average_entry_price)
    }
}
