//! Execution engine - turns a vetted action into a confirmed swap
//!
//! Every Buy/Sell becomes one logical order in the [`IntentRegistry`]. Each
//! submission attempt carries a fresh request id next to the stable order id,
//! so a gateway that already landed an earlier attempt answers
//! `AlreadyConfirmed` instead of swapping twice.

use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ExecutionConfig;
use crate::error::{BotError, ErrorKind, Result, SwapError};
use crate::intent::{IntentRegistry, OrderState};
use crate::risk::RiskDecision;
use crate::runner::Shutdown;
use crate::types::{Action, MarketSnapshot, TradeOutcome};

/// One submission attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapRequest {
    /// Stable across retries of the same logical order
    pub order_id: Uuid,
    /// Unique per attempt
    pub request_id: Uuid,
    pub side: Action,
    pub token_in: String,
    pub token_out: String,
    /// Input amount: quote units for buys, token units for sells
    pub amount: Decimal,
    /// Price the decision was made at, quote per token
    pub quoted_price: Decimal,
    pub slippage_tolerance: Decimal,
}

impl SwapRequest {
    /// The traded token, whichever side of the pair it is on
    pub fn token(&self) -> &str {
        match self.side {
            Action::Sell => &self.token_in,
            _ => &self.token_out,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapStatus {
    Confirmed,
    AlreadyConfirmed,
    Failed,
    Pending,
}

/// Gateway answer to one attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapResponse {
    /// Token units bought or sold
    pub filled_amount: Decimal,
    /// Realized price, quote per token
    pub price: Decimal,
    /// Fee in quote units
    pub fee: Decimal,
    pub status: SwapStatus,
    #[serde(default)]
    pub message: Option<String>,
}

/// Swap submission collaborator
#[async_trait]
pub trait SwapSubmitter: Send + Sync {
    async fn submit_swap(&self, request: &SwapRequest) -> std::result::Result<SwapResponse, SwapError>;
}

/// Submits vetted actions with bounded retries
pub struct ExecutionEngine {
    submitter: Arc<dyn SwapSubmitter>,
    config: ExecutionConfig,
    quote_mint: String,
    slippage_tolerance: Decimal,
    registry: IntentRegistry,
}

impl ExecutionEngine {
    pub fn new(
        submitter: Arc<dyn SwapSubmitter>,
        config: ExecutionConfig,
        quote_mint: impl Into<String>,
        slippage_tolerance: Decimal,
    ) -> Self {
        Self {
            submitter,
            config,
            quote_mint: quote_mint.into(),
            slippage_tolerance,
            registry: IntentRegistry::new(),
        }
    }

    /// Execute a vetted decision
    ///
    /// Every non-fatal failure resolves into an unsuccessful outcome. Only an
    /// authorization failure is returned as an error.
    ///
    /// Once `shutdown` is triggered no fresh attempt is started after one that
    /// certainly did not land. An attempt with an unknown result (pending or
    /// timed out) gets a single follow-up on the same order to resolve it.
    pub async fn execute(
        &mut self,
        decision: &RiskDecision,
        snapshot: &MarketSnapshot,
        shutdown: &Shutdown,
    ) -> Result<TradeOutcome> {
        let token = snapshot.token.as_str();
        if decision.action == Action::Hold {
            return Ok(TradeOutcome::hold(token, snapshot.price));
        }
        if decision.amount <= Decimal::ZERO {
            warn!(token, action = %decision.action, "Non-positive amount, holding");
            return Ok(TradeOutcome::hold(token, snapshot.price));
        }

        self.registry.cleanup();
        let intent = self.registry.create(token, decision.action, decision.amount);
        let order_id = intent.order_id;
        let (token_in, token_out) = match decision.action {
            Action::Buy => (self.quote_mint.clone(), token.to_string()),
            _ => (token.to_string(), self.quote_mint.clone()),
        };

        let mut last_error = String::from("no attempt made");
        let max_attempts = self.config.max_retries.max(1);
        let mut followed_up = false;

        for attempt_no in 1..=max_attempts {
            let (request_id, attempt) = self.registry.next_attempt(&order_id)?;
            let request = SwapRequest {
                order_id,
                request_id,
                side: decision.action,
                token_in: token_in.clone(),
                token_out: token_out.clone(),
                amount: decision.amount,
                quoted_price: snapshot.price,
                slippage_tolerance: self.slippage_tolerance,
            };

            info!(
                token,
                action = %decision.action,
                %order_id,
                %request_id,
                attempt,
                amount = %decision.amount,
                "Submitting swap"
            );

            let result = tokio::time::timeout(
                self.config.confirm_timeout(),
                self.submitter.submit_swap(&request),
            )
            .await;

            // Whether the attempt may have landed without us seeing it
            let unresolved = match result {
                Ok(Ok(response)) => match response.status {
                    SwapStatus::Confirmed | SwapStatus::AlreadyConfirmed => {
                        if response.status == SwapStatus::AlreadyConfirmed {
                            info!(%order_id, %request_id, "Order already confirmed by an earlier attempt");
                        }
                        return Ok(self.confirmed(&request, response, attempt));
                    }
                    SwapStatus::Pending | SwapStatus::Failed => {
                        last_error = format!(
                            "swap {:?}: {}",
                            response.status,
                            response.message.unwrap_or_default()
                        );
                        warn!(%order_id, %request_id, attempt, error = %last_error, "Swap attempt not confirmed");
                        response.status == SwapStatus::Pending
                    }
                },
                Ok(Err(SwapError::Transient(msg))) => {
                    last_error = BotError::TransientIo(msg).to_string();
                    warn!(%order_id, %request_id, attempt, error = %last_error, "Swap attempt failed");
                    false
                }
                Ok(Err(SwapError::Rejected(msg))) => {
                    last_error = format!("rejected: {}", msg);
                    warn!(%order_id, %request_id, attempt, error = %last_error, "Swap rejected, not retrying");
                    break;
                }
                Ok(Err(SwapError::Unauthorized(msg))) => {
                    error!(%order_id, %request_id, "Swap gateway refused credentials: {}", msg);
                    self.registry.update_state(
                        &order_id,
                        OrderState::Failed { error: msg.clone() },
                    )?;
                    return Err(BotError::Fatal(format!("swap submission unauthorized: {}", msg)));
                }
                Err(_) => {
                    last_error = format!(
                        "no confirmation within {}s",
                        self.config.confirm_timeout_secs
                    );
                    warn!(%order_id, %request_id, attempt, error = %last_error, "Swap attempt timed out");
                    true
                }
            };

            if shutdown.is_triggered() {
                if !unresolved || followed_up {
                    info!(%order_id, attempt, "Shutdown requested, not retrying swap");
                    break;
                }
                info!(%order_id, attempt, "Shutdown requested, resolving unconfirmed swap once");
                followed_up = true;
            }

            if attempt_no < max_attempts {
                let delay = self.config.backoff(attempt_no);
                debug!(%order_id, delay_ms = delay.as_millis() as u64, "Backing off before retry");
                tokio::time::sleep(delay).await;
            }
        }

        let attempts = self.registry.get(&order_id).map(|i| i.attempts()).unwrap_or(0);
        self.registry.update_state(
            &order_id,
            OrderState::Failed {
                error: last_error.clone(),
            },
        )?;
        let err = BotError::ExecutionFailed {
            attempts,
            last_error,
        };
        error!(token, %order_id, "{}", err);

        Ok(failed_outcome(token, decision, Some(order_id), snapshot.price, attempts, &err))
    }

    fn confirmed(&mut self, request: &SwapRequest, response: SwapResponse, attempts: u32) -> TradeOutcome {
        let token = request.token();
        let quoted = request.quoted_price;

        if quoted > Decimal::ZERO {
            let deviation = ((response.price - quoted) / quoted).abs();
            if deviation > self.slippage_tolerance {
                let err = BotError::SlippageExceeded {
                    quoted,
                    realized: response.price,
                    tolerance: self.slippage_tolerance,
                };
                warn!(token, order_id = %request.order_id, "{}", err);
                if let Err(e) = self.registry.update_state(
                    &request.order_id,
                    OrderState::Failed {
                        error: err.to_string(),
                    },
                ) {
                    warn!(order_id = %request.order_id, error = %e, "Could not mark order failed");
                }
                // The chain may have moved funds; the fill is still not applied
                return TradeOutcome {
                    token: token.to_string(),
                    action: request.side,
                    order_id: Some(request.order_id),
                    requested_amount: request.amount,
                    filled_amount: Decimal::ZERO,
                    price: response.price,
                    fee: Decimal::ZERO,
                    success: false,
                    error_kind: Some(ErrorKind::SlippageExceeded),
                    attempts,
                    message: err.to_string(),
                    completed_at: Utc::now(),
                };
            }
        }

        if let Err(e) = self.registry.update_state(
            &request.order_id,
            OrderState::Confirmed {
                filled_amount: response.filled_amount,
                price: response.price,
            },
        ) {
            warn!(order_id = %request.order_id, error = %e, "Could not mark order confirmed");
        }

        info!(
            token,
            action = %request.side,
            order_id = %request.order_id,
            filled = %response.filled_amount,
            price = %response.price,
            fee = %response.fee,
            attempts,
            "Swap confirmed"
        );

        TradeOutcome {
            token: token.to_string(),
            action: request.side,
            order_id: Some(request.order_id),
            requested_amount: request.amount,
            filled_amount: response.filled_amount,
            price: response.price,
            fee: response.fee,
            success: true,
            error_kind: None,
            attempts,
            message: format!("{:?}", response.status).to_lowercase(),
            completed_at: Utc::now(),
        }
    }

    /// Claim the right to apply a confirmed order's fill; true once per order
    pub fn claim_fill(&mut self, order_id: &Uuid) -> bool {
        self.registry.mark_applied(order_id)
    }

    pub fn registry(&self) -> &IntentRegistry {
        &self.registry
    }
}

fn failed_outcome(
    token: &str,
    decision: &RiskDecision,
    order_id: Option<Uuid>,
    price: Decimal,
    attempts: u32,
    err: &BotError,
) -> TradeOutcome {
    TradeOutcome {
        token: token.to_string(),
        action: decision.action,
        order_id,
        requested_amount: decision.amount,
        filled_amount: Decimal::ZERO,
        price,
        fee: Decimal::ZERO,
        success: false,
        error_kind: Some(err.kind()),
        attempts,
        message: err.to_string(),
        completed_at: Utc::now(),
    }
}

/// In-process swap simulator for paper trading
///
/// Fills at the quoted price moved by a random deviation inside the slippage
/// tolerance, and answers `AlreadyConfirmed` for an order it has filled before.
pub struct PaperSwapClient {
    fee_bps: u32,
    rng: Mutex<StdRng>,
    filled: Mutex<HashMap<Uuid, SwapResponse>>,
}

impl PaperSwapClient {
    pub fn new(fee_bps: u32, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            fee_bps,
            rng: Mutex::new(rng),
            filled: Mutex::new(HashMap::new()),
        }
    }

    fn fill_price(&self, request: &SwapRequest) -> std::result::Result<Decimal, SwapError> {
        let unit = {
            let mut rng = self
                .rng
                .lock()
                .map_err(|_| SwapError::Transient("simulator rng poisoned".to_string()))?;
            rng.gen_range(-0.9..0.9)
        };
        let factor = Decimal::from_f64(unit).unwrap_or(Decimal::ZERO).round_dp(6);
        Ok(request.quoted_price * (Decimal::ONE + factor * request.slippage_tolerance))
    }
}

#[async_trait]
impl SwapSubmitter for PaperSwapClient {
    async fn submit_swap(&self, request: &SwapRequest) -> std::result::Result<SwapResponse, SwapError> {
        if request.amount <= Decimal::ZERO || request.quoted_price <= Decimal::ZERO {
            return Err(SwapError::Rejected(format!(
                "invalid amount {} at price {}",
                request.amount, request.quoted_price
            )));
        }

        let mut filled = self
            .filled
            .lock()
            .map_err(|_| SwapError::Transient("simulator state poisoned".to_string()))?;
        if let Some(previous) = filled.get(&request.order_id) {
            return Ok(SwapResponse {
                status: SwapStatus::AlreadyConfirmed,
                ..previous.clone()
            });
        }

        let price = self.fill_price(request)?;
        let fee_rate = Decimal::from(self.fee_bps) / Decimal::from(10_000);
        let (filled_amount, notional) = match request.side {
            Action::Buy => (request.amount / price, request.amount),
            _ => (request.amount, request.amount * price),
        };
        let response = SwapResponse {
            filled_amount,
            price,
            fee: notional * fee_rate,
            status: SwapStatus::Confirmed,
            message: Some("paper fill".to_string()),
        };

        debug!(
            order_id = %request.order_id,
            side = %request.side,
            filled = %response.filled_amount,
            price = %response.price,
            "Paper swap filled"
        );
        filled.insert(request.order_id, response.clone());
        Ok(response)
    }
}
