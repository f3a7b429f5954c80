//! Tabular Q-learning policy
//!
//! Epsilon-greedy selection over a QTable keyed by [`MarketState`], updated
//! with the one-step Q-learning rule. Exploration decays toward a positive
//! floor so the policy keeps adapting to regime changes.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::error::{BotError, Result};
use crate::types::{Action, MarketState, TradeOutcome};

/// Learning configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Learning rate (alpha), in (0, 1]
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Discount factor (gamma), in (0, 1]
    #[serde(default = "default_discount")]
    pub discount: f64,
    /// Initial exploration rate
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    /// Multiplicative decay applied after each update
    #[serde(default = "default_epsilon_decay")]
    pub epsilon_decay: f64,
    /// Exploration never drops below this
    #[serde(default = "default_epsilon_floor")]
    pub epsilon_floor: f64,
    /// Q-values are clamped to +/- this bound
    #[serde(default = "default_q_value_limit")]
    pub q_value_limit: f64,
    /// Rewards are clipped to +/- this bound
    #[serde(default = "default_reward_clip")]
    pub reward_clip: f64,
    /// Seed for reproducible exploration
    #[serde(default)]
    pub seed: Option<u64>,
}

impl PolicyConfig {
    pub fn validate(&self) -> Result<()> {
        let unit = |v: f64| v > 0.0 && v <= 1.0;
        if !unit(self.learning_rate) {
            return Err(BotError::Validation("learning_rate must be in (0, 1]".to_string()));
        }
        if !unit(self.discount) {
            return Err(BotError::Validation("discount must be in (0, 1]".to_string()));
        }
        if !unit(self.epsilon_floor) || self.epsilon_floor > self.epsilon || !unit(self.epsilon) {
            return Err(BotError::Validation(
                "epsilon values must satisfy 0 < epsilon_floor <= epsilon <= 1".to_string(),
            ));
        }
        if !unit(self.epsilon_decay) {
            return Err(BotError::Validation("epsilon_decay must be in (0, 1]".to_string()));
        }
        if !(self.q_value_limit.is_finite() && self.q_value_limit > 0.0) {
            return Err(BotError::Validation("q_value_limit must be positive".to_string()));
        }
        if !(self.reward_clip.is_finite() && self.reward_clip > 0.0) {
            return Err(BotError::Validation("reward_clip must be positive".to_string()));
        }
        Ok(())
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            discount: default_discount(),
            epsilon: default_epsilon(),
            epsilon_decay: default_epsilon_decay(),
            epsilon_floor: default_epsilon_floor(),
            q_value_limit: default_q_value_limit(),
            reward_clip: default_reward_clip(),
            seed: None,
        }
    }
}

fn default_learning_rate() -> f64 { 0.1 }
fn default_discount() -> f64 { 0.9 }
fn default_epsilon() -> f64 { 1.0 }
fn default_epsilon_decay() -> f64 { 0.995 }
fn default_epsilon_floor() -> f64 { 0.05 }
fn default_q_value_limit() -> f64 { 1_000.0 }
fn default_reward_clip() -> f64 { 1.0 }

/// Values of the three actions in one state, indexed by [`Action::index`]
pub type ActionValues = [f64; 3];

/// State-action value table; entries are only ever added
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(into = "Vec<QTableRow>", from = "Vec<QTableRow>")]
pub struct QTable {
    values: HashMap<MarketState, ActionValues>,
}

/// Flat persisted form; JSON maps cannot use struct keys
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QTableRow {
    pub state: MarketState,
    pub buy: f64,
    pub sell: f64,
    pub hold: f64,
}

impl From<QTable> for Vec<QTableRow> {
    fn from(table: QTable) -> Self {
        let mut rows: Vec<QTableRow> = table
            .values
            .into_iter()
            .map(|(state, v)| QTableRow {
                state,
                buy: v[Action::Buy.index()],
                sell: v[Action::Sell.index()],
                hold: v[Action::Hold.index()],
            })
            .collect();
        rows.sort_by_key(|r| {
            (
                r.state.price_bucket,
                r.state.momentum_bucket,
                r.state.sentiment_bucket,
                r.state.volatility_bucket,
            )
        });
        rows
    }
}

impl From<Vec<QTableRow>> for QTable {
    fn from(rows: Vec<QTableRow>) -> Self {
        let values = rows
            .into_iter()
            .map(|r| {
                let mut v = [0.0; 3];
                v[Action::Buy.index()] = r.buy;
                v[Action::Sell.index()] = r.sell;
                v[Action::Hold.index()] = r.hold;
                (r.state, v)
            })
            .collect();
        Self { values }
    }
}

impl QTable {
    /// Value of a pair; unseen pairs are worth 0
    pub fn get(&self, state: &MarketState, action: Action) -> f64 {
        self.values
            .get(state)
            .map(|v| v[action.index()])
            .unwrap_or(0.0)
    }

    pub fn max_value(&self, state: &MarketState) -> f64 {
        match self.values.get(state) {
            Some(v) => v.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            None => 0.0,
        }
    }

    /// Greedy action, ties broken Hold > Sell > Buy
    pub fn best_action(&self, state: &MarketState) -> Action {
        let mut best = Action::PRIORITY[0];
        let mut best_value = self.get(state, best);
        for action in &Action::PRIORITY[1..] {
            let value = self.get(state, *action);
            if value > best_value {
                best = *action;
                best_value = value;
            }
        }
        best
    }

    fn set(&mut self, state: MarketState, action: Action, value: f64) {
        self.values.entry(state).or_insert([0.0; 3])[action.index()] = value;
    }

    /// Number of distinct states observed
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MarketState, &ActionValues)> {
        self.values.iter()
    }
}

/// Counters for logging and tests
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyStats {
    pub explorations: u64,
    pub exploitations: u64,
    pub updates: u64,
    pub total_reward: f64,
}

/// Persisted learning state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub q_table: QTable,
    pub epsilon: f64,
    #[serde(default)]
    pub stats: PolicyStats,
}

/// Learns and evaluates the state -> action mapping
pub struct PolicyEngine {
    q_table: QTable,
    config: PolicyConfig,
    epsilon: f64,
    rng: StdRng,
    stats: PolicyStats,
}

impl PolicyEngine {
    pub fn new(config: PolicyConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let epsilon = config.epsilon.max(config.epsilon_floor);
        Self {
            q_table: QTable::default(),
            config,
            epsilon,
            rng,
            stats: PolicyStats::default(),
        }
    }

    /// Restore from a persisted snapshot
    pub fn restore(config: PolicyConfig, snapshot: PolicySnapshot) -> Self {
        let mut engine = Self::new(config);
        engine.epsilon = snapshot
            .epsilon
            .clamp(engine.config.epsilon_floor, 1.0);
        engine.q_table = snapshot.q_table;
        engine.stats = snapshot.stats;
        info!(
            states = engine.q_table.len(),
            epsilon = engine.epsilon,
            "Restored policy"
        );
        engine
    }

    /// Epsilon-greedy action selection
    pub fn select_action(&mut self, state: &MarketState) -> Action {
        if self.rng.gen::<f64>() < self.epsilon {
            let action = Action::ALL[self.rng.gen_range(0..Action::ALL.len())];
            self.stats.explorations += 1;
            debug!(%action, epsilon = self.epsilon, "Exploration: random action");
            action
        } else {
            let action = self.q_table.best_action(state);
            self.stats.exploitations += 1;
            debug!(%action, "Exploitation: best action");
            action
        }
    }

    /// One-step Q-learning update, followed by epsilon decay
    ///
    /// `Q[s,a] += alpha * (reward + gamma * max_a' Q[s',a'] - Q[s,a])`
    pub fn update(&mut self, state: &MarketState, action: Action, reward: f64, next_state: &MarketState) {
        let reward = if reward.is_finite() {
            reward.clamp(-self.config.reward_clip, self.config.reward_clip)
        } else {
            0.0
        };

        let current = self.q_table.get(state, action);
        let max_next = self.q_table.max_value(next_state);
        let target = reward + self.config.discount * max_next;
        let limit = self.config.q_value_limit;
        let updated = (current + self.config.learning_rate * (target - current)).clamp(-limit, limit);

        self.q_table.set(*state, action, updated);
        self.stats.updates += 1;
        self.stats.total_reward += reward;
        self.decay_epsilon();

        debug!(
            %action,
            reward,
            old = current,
            new = updated,
            epsilon = self.epsilon,
            "Q-value updated"
        );
    }

    fn decay_epsilon(&mut self) {
        self.epsilon = (self.epsilon * self.config.epsilon_decay).max(self.config.epsilon_floor);
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn q_table(&self) -> &QTable {
        &self.q_table
    }

    pub fn stats(&self) -> &PolicyStats {
        &self.stats
    }

    pub fn snapshot(&self) -> PolicySnapshot {
        PolicySnapshot {
            q_table: self.q_table.clone(),
            epsilon: self.epsilon,
            stats: self.stats.clone(),
        }
    }
}

/// Reward for a recorded outcome: realized P&L net of fees, normalized by
/// starting capital
pub fn compute_reward(outcome: &TradeOutcome, realized_pnl: Decimal, initial_investment: Decimal) -> f64 {
    if !outcome.is_fill() || initial_investment <= Decimal::ZERO {
        return 0.0;
    }
    ((realized_pnl - outcome.fee) / initial_investment)
        .to_f64()
        .unwrap_or(0.0)
}
