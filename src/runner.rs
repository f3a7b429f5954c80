//! Bot controller - the single-flight trading state machine
//!
//! One tick walks every configured token in order. Each token is one cycle:
//!
//! `Idle -> FetchingSignals -> Deciding -> RiskChecking -> Executing -> RecordingOutcome -> Idle`
//!
//! The shutdown signal is checked before entering each phase up to and
//! including `Executing`. Once a swap is submitted the cycle always reaches
//! `RecordingOutcome`, and only then moves to `ShuttingDown`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{BotError, Result};
use crate::executor::{ExecutionEngine, SwapSubmitter};
use crate::policy::{compute_reward, PolicyEngine};
use crate::portfolio::{Portfolio, PortfolioSnapshot};
use crate::risk::{Capital, RiskDecision, RiskManager};
use crate::signals::{PriceFeed, SentimentFeed, SignalAggregator};
use crate::state::{JournalEntry, PendingTransition, PersistedState, StateStore};
use crate::types::{Action, MarketSnapshot, MarketState, TradeOutcome};

/// Phase log entries kept for inspection
const PHASE_LOG_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Idle,
    FetchingSignals,
    Deciding,
    RiskChecking,
    Executing,
    RecordingOutcome,
    ShuttingDown,
}

impl CyclePhase {
    /// Phases that may not start once shutdown is requested
    fn starts_new_work(&self) -> bool {
        matches!(
            self,
            CyclePhase::FetchingSignals
                | CyclePhase::Deciding
                | CyclePhase::RiskChecking
                | CyclePhase::Executing
        )
    }
}

/// One phase transition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseRecord {
    pub cycle: u64,
    pub token: Option<String>,
    pub phase: CyclePhase,
    pub at: DateTime<Utc>,
}

/// Sender half of the shutdown signal
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

/// Receiver half of the shutdown signal
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested; never resolves if the handle is gone
    pub async fn triggered(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

pub fn shutdown_channel() -> (ShutdownHandle, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, Shutdown { rx })
}

/// External collaborators, injected so tests can script them
#[derive(Clone)]
pub struct Collaborators {
    pub price_feed: Arc<dyn PriceFeed>,
    pub sentiment_feed: Arc<dyn SentimentFeed>,
    pub submitter: Arc<dyn SwapSubmitter>,
    pub store: Arc<dyn StateStore>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleStats {
    pub cycles: u64,
    pub skipped: u64,
    pub fills: u64,
    pub failed_executions: u64,
    pub risk_overrides: u64,
}

/// Mutable trading state owned by the controller
#[derive(Debug, Clone)]
pub struct BotState {
    pub portfolio: Portfolio,
    /// At most one transition per token awaits its next state
    pub pending: HashMap<String, PendingTransition>,
    pub stats: CycleStats,
}

impl BotState {
    pub fn new(starting_cash: Decimal) -> Self {
        Self {
            portfolio: Portfolio::new(starting_cash),
            pending: HashMap::new(),
            stats: CycleStats::default(),
        }
    }
}

/// How a single cycle ended
#[derive(Debug, Clone)]
pub enum CycleResult {
    Completed(TradeOutcome),
    /// No usable market data; nothing was decided
    Skipped(String),
    /// Shutdown observed before any swap was submitted
    Interrupted,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    pub stats: CycleStats,
    pub q_states: usize,
    pub epsilon: f64,
    pub portfolio: PortfolioSnapshot,
}

pub struct BotController {
    config: Config,
    signals: SignalAggregator,
    policy: PolicyEngine,
    risk: RiskManager,
    executor: ExecutionEngine,
    store: Arc<dyn StateStore>,
    state: BotState,
    phase: CyclePhase,
    phase_log: VecDeque<PhaseRecord>,
    current_token: Option<String>,
    shutdown: Shutdown,
    restored: bool,
}

impl BotController {
    /// `config` must already be validated
    pub fn new(config: Config, collaborators: Collaborators, shutdown: Shutdown) -> Self {
        let signals = SignalAggregator::new(
            collaborators.price_feed,
            collaborators.sentiment_feed,
            config.signals.clone(),
            config.fetch_timeout(),
        );
        let executor = ExecutionEngine::new(
            collaborators.submitter,
            config.execution,
            config.quote_mint.clone(),
            config.risk.slippage_tolerance,
        );

        Self {
            signals,
            policy: PolicyEngine::new(config.policy.clone()),
            risk: RiskManager::new(config.risk),
            executor,
            store: collaborators.store,
            state: BotState::new(config.risk.initial_investment),
            phase: CyclePhase::Idle,
            phase_log: VecDeque::with_capacity(PHASE_LOG_CAPACITY),
            current_token: None,
            shutdown,
            restored: false,
            config,
        }
    }

    /// Load persisted state, or keep the fresh state if none exists
    pub async fn restore(&mut self) -> Result<()> {
        match self.store.load().await? {
            Some(saved) => {
                self.policy = PolicyEngine::restore(self.config.policy.clone(), saved.policy);
                self.state.portfolio = saved.portfolio;
                self.state.pending = saved
                    .pending
                    .into_iter()
                    .map(|p| (p.token.clone(), p))
                    .collect();
                info!(
                    cash = %self.state.portfolio.cash,
                    positions = self.state.portfolio.positions.len(),
                    pending = self.state.pending.len(),
                    "Resumed from saved state"
                );
            }
            None => {
                info!(
                    cash = %self.config.risk.initial_investment,
                    "No saved state, starting fresh"
                );
            }
        }
        self.restored = true;
        Ok(())
    }

    /// Run until shutdown or a fatal error, persisting state either way
    pub async fn run(&mut self) -> Result<ShutdownReport> {
        if !self.restored {
            self.restore().await?;
        }

        info!(
            tokens = self.config.tokens.len(),
            interval_secs = self.config.cycle_interval_secs,
            mode = ?self.config.trading_mode,
            "Controller starting"
        );

        let mut ticker = interval(self.config.cycle_interval());
        // A slow tick pushes the next one back instead of bursting
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.triggered() => {
                    info!("Shutdown requested");
                    break;
                }
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.run_tick().await {
                error!("Fatal error, stopping: {}", e);
                if let Err(persist_err) = self.shut_down().await {
                    error!("Failed to persist state after fatal error: {}", persist_err);
                }
                return Err(e);
            }

            if self.shutdown.is_triggered() {
                break;
            }
        }

        self.shut_down().await
    }

    /// One cycle per configured token, strictly in sequence
    pub async fn run_tick(&mut self) -> Result<()> {
        let tokens = self.config.tokens.clone();
        for token in &tokens {
            if self.shutdown.is_triggered() {
                break;
            }
            match self.run_cycle(token).await? {
                CycleResult::Interrupted => break,
                CycleResult::Skipped(reason) => debug!(token = %token, %reason, "Cycle skipped"),
                CycleResult::Completed(_) => {}
            }
        }
        self.checkpoint().await;
        Ok(())
    }

    /// Drive a single cycle for one token
    ///
    /// Only a fatal error is returned; everything else resolves in the cycle.
    pub async fn run_cycle(&mut self, token: &str) -> Result<CycleResult> {
        self.state.stats.cycles += 1;
        self.current_token = Some(token.to_string());

        if !self.advance(CyclePhase::FetchingSignals) {
            return Ok(CycleResult::Interrupted);
        }
        let snapshot = match self.signals.acquire(token).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(token, error = %e, "No usable market data, skipping cycle");
                self.state.stats.skipped += 1;
                self.finish_cycle();
                return Ok(CycleResult::Skipped(e.to_string()));
            }
        };

        // The previous outcome for this token learns from the new state
        self.resolve_pending(token, Some(snapshot.state));
        self.state.portfolio.mark_to_market(token, snapshot.price);

        if !self.advance(CyclePhase::Deciding) {
            return Ok(CycleResult::Interrupted);
        }
        let proposed = self.policy.select_action(&snapshot.state);

        if !self.advance(CyclePhase::RiskChecking) {
            return Ok(CycleResult::Interrupted);
        }
        let position = self.state.portfolio.position(token);
        let capital = Capital::new(
            self.state.portfolio.cash,
            self.state.portfolio.total_equity(),
        );
        let decision = self.risk.evaluate(proposed, &position, &snapshot, capital);
        if decision.overrode(proposed) {
            self.state.stats.risk_overrides += 1;
        }

        if !self.advance(CyclePhase::Executing) {
            return Ok(CycleResult::Interrupted);
        }
        let outcome = match self.executor.execute(&decision, &snapshot, &self.shutdown).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.enter(CyclePhase::ShuttingDown);
                return Err(e);
            }
        };

        // Past this point the cycle always records, even during shutdown
        self.enter(CyclePhase::RecordingOutcome);
        self.record_outcome(&snapshot, proposed, &decision, &outcome).await;

        self.finish_cycle();
        Ok(CycleResult::Completed(outcome))
    }

    async fn record_outcome(
        &mut self,
        snapshot: &MarketSnapshot,
        proposed: Action,
        decision: &RiskDecision,
        outcome: &TradeOutcome,
    ) {
        let mut realized = Decimal::ZERO;
        if outcome.is_fill() {
            let claimed = outcome
                .order_id
                .map(|id| self.executor.claim_fill(&id))
                .unwrap_or(false);
            if claimed {
                match self.state.portfolio.apply_fill(outcome) {
                    Ok(effect) => {
                        realized = effect.realized_pnl;
                        self.state.stats.fills += 1;
                    }
                    Err(e) => warn!(token = %outcome.token, error = %e, "Fill not applied"),
                }
            }
        } else if !outcome.success {
            self.state.stats.failed_executions += 1;
        }

        let reward = compute_reward(outcome, realized, self.config.risk.initial_investment);

        // A leftover transition would otherwise be overwritten without its update
        self.resolve_pending(&snapshot.token, Some(snapshot.state));
        self.state.pending.insert(
            snapshot.token.clone(),
            PendingTransition {
                token: snapshot.token.clone(),
                state: snapshot.state,
                action: decision.action,
                reward,
                recorded_at: outcome.completed_at,
            },
        );

        info!(
            token = %snapshot.token,
            %proposed,
            action = %decision.action,
            reason = ?decision.reason,
            success = outcome.success,
            filled = %outcome.filled_amount,
            reward,
            cash = %self.state.portfolio.cash,
            "Cycle recorded"
        );

        let entry = JournalEntry {
            cycle: self.state.stats.cycles,
            proposed,
            reason: decision.reason,
            outcome: outcome.clone(),
            realized_pnl: realized,
            reward,
            epsilon: self.policy.epsilon(),
        };
        if let Err(e) = self.store.append_journal(&entry).await {
            warn!(error = %e, "Failed to append trade journal");
        }
    }

    /// Apply the waiting update for a token; `None` reuses the recorded state
    fn resolve_pending(&mut self, token: &str, next_state: Option<MarketState>) {
        if let Some(pending) = self.state.pending.remove(token) {
            let next = next_state.unwrap_or(pending.state);
            self.policy
                .update(&pending.state, pending.action, pending.reward, &next);
        }
    }

    /// Flush every pending transition and persist
    pub async fn shut_down(&mut self) -> Result<ShutdownReport> {
        if self.phase != CyclePhase::ShuttingDown {
            self.current_token = None;
            self.enter(CyclePhase::ShuttingDown);
        }

        let tokens: Vec<String> = self.state.pending.keys().cloned().collect();
        for token in tokens {
            self.resolve_pending(&token, None);
        }

        self.store.save(&self.persisted_state()).await?;

        let report = self.report();
        info!(
            cycles = report.stats.cycles,
            fills = report.stats.fills,
            q_states = report.q_states,
            equity = %report.portfolio.total_equity,
            realized = %report.portfolio.realized_pnl,
            open_positions = report.portfolio.positions.len(),
            "Controller stopped"
        );
        Ok(report)
    }

    /// Save after each tick so a crash loses at most one tick
    async fn checkpoint(&self) {
        if let Err(e) = self.store.save(&self.persisted_state()).await {
            warn!(error = %e, "Checkpoint failed");
        }
    }

    fn persisted_state(&self) -> PersistedState {
        let mut pending: Vec<PendingTransition> = self.state.pending.values().cloned().collect();
        pending.sort_by(|a, b| a.token.cmp(&b.token));
        PersistedState::new(self.policy.snapshot(), self.state.portfolio.clone(), pending)
    }

    fn report(&self) -> ShutdownReport {
        ShutdownReport {
            stats: self.state.stats.clone(),
            q_states: self.policy.q_table().len(),
            epsilon: self.policy.epsilon(),
            portfolio: self.state.portfolio.snapshot(),
        }
    }

    /// Enter `next` unless shutdown forbids starting it
    fn advance(&mut self, next: CyclePhase) -> bool {
        if next.starts_new_work() && self.shutdown.is_triggered() {
            info!(phase = ?next, "Shutdown observed, not starting phase");
            self.enter(CyclePhase::ShuttingDown);
            return false;
        }
        self.enter(next);
        true
    }

    fn finish_cycle(&mut self) {
        if self.shutdown.is_triggered() {
            self.enter(CyclePhase::ShuttingDown);
        } else {
            self.enter(CyclePhase::Idle);
        }
        self.current_token = None;
    }

    fn enter(&mut self, phase: CyclePhase) {
        debug!(from = ?self.phase, to = ?phase, "Phase transition");
        self.phase = phase;
        if self.phase_log.len() == PHASE_LOG_CAPACITY {
            self.phase_log.pop_front();
        }
        self.phase_log.push_back(PhaseRecord {
            cycle: self.state.stats.cycles,
            token: self.current_token.clone(),
            phase,
            at: Utc::now(),
        });
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    pub fn phase_log(&self) -> &VecDeque<PhaseRecord> {
        &self.phase_log
    }

    pub fn state(&self) -> &BotState {
        &self.state
    }

    pub fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    pub fn executor(&self) -> &ExecutionEngine {
        &self.executor
    }
}

/// Map a controller error to the process exit code
pub fn exit_code_for(err: &BotError, during_startup: bool) -> u8 {
    match err {
        _ if during_startup => 2,
        BotError::Validation(_) => 2,
        _ => 3,
    }
}
