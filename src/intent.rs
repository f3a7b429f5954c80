//! Order intent tracking for idempotency
//!
//! Each Buy/Sell is one logical order. Retries reuse the order id with a
//! fresh request id, and a confirmed fill can be applied to the portfolio
//! only once per order.

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{BotError, Result};
use crate::types::Action;

/// Order intent states
#[derive(Debug, Clone, PartialEq)]
pub enum OrderState {
    Created,
    Submitted { request_id: Uuid, attempt: u32 },
    Confirmed { filled_amount: Decimal, price: Decimal },
    Failed { error: String },
    /// Fill has been applied to the portfolio
    Applied,
}

/// One logical order
#[derive(Debug, Clone)]
pub struct OrderIntent {
    pub order_id: Uuid,
    pub token: String,
    pub action: Action,
    pub amount: Decimal,
    /// Request ids of every attempt, oldest first
    pub request_ids: Vec<Uuid>,
    pub state: OrderState,
    pub created_at: Instant,
}

impl OrderIntent {
    pub fn attempts(&self) -> u32 {
        self.request_ids.len() as u32
    }
}

/// Registry of in-flight and recent orders
pub struct IntentRegistry {
    intents: HashMap<Uuid, OrderIntent>,
    max_age: Duration,
}

impl IntentRegistry {
    pub fn new() -> Self {
        Self {
            intents: HashMap::new(),
            max_age: Duration::from_secs(3600),
        }
    }

    /// Register a new logical order
    pub fn create(&mut self, token: &str, action: Action, amount: Decimal) -> OrderIntent {
        let intent = OrderIntent {
            order_id: Uuid::new_v4(),
            token: token.to_string(),
            action,
            amount,
            request_ids: Vec::new(),
            state: OrderState::Created,
            created_at: Instant::now(),
        };

        self.intents.insert(intent.order_id, intent.clone());
        debug!(order_id = %intent.order_id, token, %action, "Created order intent");

        intent
    }

    pub fn get(&self, order_id: &Uuid) -> Option<&OrderIntent> {
        self.intents.get(order_id)
    }

    /// Allocate a fresh request id for the next attempt of an order
    pub fn next_attempt(&mut self, order_id: &Uuid) -> Result<(Uuid, u32)> {
        let intent = self.intents.get_mut(order_id).ok_or_else(|| not_found(order_id))?;
        match intent.state {
            OrderState::Confirmed { .. } | OrderState::Applied => {
                return Err(BotError::Validation(format!(
                    "order {} is already confirmed",
                    order_id
                )));
            }
            _ => {}
        }

        let request_id = Uuid::new_v4();
        intent.request_ids.push(request_id);
        let attempt = intent.attempts();
        intent.state = OrderState::Submitted {
            request_id,
            attempt,
        };
        Ok((request_id, attempt))
    }

    pub fn update_state(&mut self, order_id: &Uuid, state: OrderState) -> Result<()> {
        let intent = self.intents.get_mut(order_id).ok_or_else(|| not_found(order_id))?;
        if intent.state == OrderState::Applied {
            warn!(%order_id, ?state, "Ignoring state change on applied order");
            return Ok(());
        }
        debug!(%order_id, "Order state: {:?} -> {:?}", intent.state, state);
        intent.state = state;
        Ok(())
    }

    /// Claim the right to apply this order's fill
    ///
    /// Returns true exactly once per confirmed order; duplicates return false.
    pub fn mark_applied(&mut self, order_id: &Uuid) -> bool {
        match self.intents.get_mut(order_id) {
            Some(intent) => match intent.state {
                OrderState::Confirmed { .. } => {
                    intent.state = OrderState::Applied;
                    true
                }
                OrderState::Applied => {
                    warn!(%order_id, "Duplicate fill application suppressed");
                    false
                }
                _ => {
                    warn!(%order_id, state = ?intent.state, "Order is not confirmed");
                    false
                }
            },
            None => {
                warn!(%order_id, "Unknown order");
                false
            }
        }
    }

    /// Drop finalized orders older than the retention window
    pub fn cleanup(&mut self) {
        let before = self.intents.len();
        let max_age = self.max_age;
        self.intents.retain(|_, intent| {
            intent.created_at.elapsed() < max_age
                || !matches!(intent.state, OrderState::Applied | OrderState::Failed { .. })
        });
        let after = self.intents.len();
        if before != after {
            debug!("Cleaned up {} old intents", before - after);
        }
    }

    pub fn len(&self) -> usize {
        self.intents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }
}

impl Default for IntentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(order_id: &Uuid) -> BotError {
    BotError::Validation(format!("intent not found: {}", order_id))
}
