//! Scripted collaborators for driving the controller without network access

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use scalp_runner::{
    error::{BotError, FeedError, SwapError},
    executor::{SwapRequest, SwapResponse, SwapStatus, SwapSubmitter},
    policy::{PolicySnapshot, QTable, QTableRow},
    portfolio::Portfolio,
    runner::{Collaborators, ShutdownHandle},
    signals::{PriceFeed, PriceReading, SentimentFeed, SentimentReading},
    state::{JournalEntry, PersistedState, StateStore},
    types::{Action, MarketState},
    Config,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// State every flat price series discretizes to
pub const FLAT_STATE: MarketState = MarketState {
    price_bucket: 2,
    momentum_bucket: 2,
    sentiment_bucket: 2,
    volatility_bucket: 0,
};

/// Near-greedy exploration so scenarios are deterministic
pub const GREEDY_EPSILON: f64 = 0.000_001;

/// Validated config with fast retries and a seeded policy
pub fn test_config(tokens: &[&str]) -> Config {
    let list = tokens
        .iter()
        .map(|t| format!("\"{}\"", t))
        .collect::<Vec<_>>()
        .join(", ");
    let toml = format!(
        r#"
        tokens = [{list}]
        cycle_interval_secs = 1
        fetch_timeout_ms = 200

        [policy]
        epsilon = {eps}
        epsilon_floor = {eps}
        seed = 7

        [execution]
        max_retries = 3
        base_backoff_ms = 1
        max_backoff_ms = 4
        confirm_timeout_secs = 2
        "#,
        list = list,
        eps = GREEDY_EPSILON,
    );
    Config::from_toml_str(&toml).unwrap()
}

/// Saved state whose policy prefers `action` in [`FLAT_STATE`]
pub fn biased_state(action: Action, cash: Decimal) -> PersistedState {
    let mut row = QTableRow {
        state: FLAT_STATE,
        buy: 0.0,
        sell: 0.0,
        hold: 0.0,
    };
    match action {
        Action::Buy => row.buy = 1.0,
        Action::Sell => row.sell = 1.0,
        Action::Hold => row.hold = 1.0,
    }
    PersistedState::new(
        PolicySnapshot {
            q_table: QTable::from(vec![row]),
            epsilon: GREEDY_EPSILON,
            stats: Default::default(),
        },
        Portfolio::new(cash),
        vec![],
    )
}

/// Price feed replaying a per-token script; the last entry repeats
#[derive(Default)]
pub struct ScriptedPriceFeed {
    scripts: Mutex<HashMap<String, VecDeque<Option<Decimal>>>>,
    pub calls: AtomicUsize,
    /// Runtime clock at each fetch, one per cycle started
    call_times: Mutex<Vec<tokio::time::Instant>>,
}

impl ScriptedPriceFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` entries fail with `Unavailable`
    pub fn with_script(self, token: &str, script: Vec<Option<Decimal>>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(token.to_string(), script.into());
        self
    }

    pub fn with_constant(self, token: &str, price: Decimal) -> Self {
        self.with_script(token, vec![Some(price)])
    }

    /// Time between consecutive fetches
    pub fn call_gaps(&self) -> Vec<Duration> {
        let times = self.call_times.lock().unwrap();
        times.windows(2).map(|w| w[1] - w[0]).collect()
    }
}

#[async_trait]
impl PriceFeed for ScriptedPriceFeed {
    async fn get_price(&self, token: &str) -> Result<PriceReading, FeedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.call_times
            .lock()
            .unwrap()
            .push(tokio::time::Instant::now());
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts
            .get_mut(token)
            .ok_or_else(|| FeedError::Unavailable(format!("no script for {}", token)))?;
        let next = if script.len() > 1 {
            script.pop_front().flatten()
        } else {
            script.front().cloned().flatten()
        };
        next.map(|price| PriceReading {
            price,
            timestamp: Utc::now(),
        })
        .ok_or_else(|| FeedError::Unavailable("scripted outage".to_string()))
    }
}

pub struct FixedSentimentFeed {
    pub score: f64,
    pub mentions: u64,
}

#[async_trait]
impl SentimentFeed for FixedSentimentFeed {
    async fn get_sentiment(&self, _token: &str) -> Result<SentimentReading, FeedError> {
        Ok(SentimentReading {
            score: self.score,
            mentions: self.mentions,
            timestamp: Utc::now(),
        })
    }
}

/// Swap submitter replaying scripted answers, then filling at the quoted price
#[derive(Default)]
pub struct ScriptedSwapSubmitter {
    script: Mutex<VecDeque<Result<SwapResponse, SwapError>>>,
    pub requests: Mutex<Vec<SwapRequest>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    /// Triggered from inside the first submission
    shutdown_on_submit: Mutex<Option<ShutdownHandle>>,
    delay: Option<Duration>,
}

impl ScriptedSwapSubmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(self, script: Vec<Result<SwapResponse, SwapError>>) -> Self {
        *self.script.lock().unwrap() = script.into();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn shutting_down_on_submit(self, handle: ShutdownHandle) -> Self {
        *self.shutdown_on_submit.lock().unwrap() = Some(handle);
        self
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn fill_at_quote(request: &SwapRequest) -> SwapResponse {
        let filled_amount = match request.side {
            Action::Buy => request.amount / request.quoted_price,
            _ => request.amount,
        };
        SwapResponse {
            filled_amount,
            price: request.quoted_price,
            fee: Decimal::ZERO,
            status: SwapStatus::Confirmed,
            message: None,
        }
    }
}

#[async_trait]
impl SwapSubmitter for ScriptedSwapSubmitter {
    async fn submit_swap(&self, request: &SwapRequest) -> Result<SwapResponse, SwapError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        if let Some(handle) = self.shutdown_on_submit.lock().unwrap().take() {
            handle.trigger();
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.script.lock().unwrap().pop_front();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        scripted.unwrap_or_else(|| Ok(Self::fill_at_quote(request)))
    }
}

pub fn swap_response(status: SwapStatus, filled: Decimal, price: Decimal) -> Result<SwapResponse, SwapError> {
    Ok(SwapResponse {
        filled_amount: filled,
        price,
        fee: Decimal::ZERO,
        status,
        message: None,
    })
}

/// In-memory state store
#[derive(Default)]
pub struct MemoryStore {
    saved: Mutex<Option<PersistedState>>,
    pub saves: AtomicUsize,
    pub journal: Mutex<Vec<JournalEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: PersistedState) -> Self {
        let store = Self::default();
        *store.saved.lock().unwrap() = Some(state);
        store
    }

    pub fn saved(&self) -> Option<PersistedState> {
        self.saved.lock().unwrap().clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        self.journal.lock().unwrap().clone()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn save(&self, state: &PersistedState) -> Result<(), BotError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        *self.saved.lock().unwrap() = Some(state.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Option<PersistedState>, BotError> {
        Ok(self.saved.lock().unwrap().clone())
    }

    async fn append_journal(&self, entry: &JournalEntry) -> Result<(), BotError> {
        self.journal.lock().unwrap().push(entry.clone());
        Ok(())
    }
}

pub fn collaborators(
    prices: Arc<ScriptedPriceFeed>,
    submitter: Arc<ScriptedSwapSubmitter>,
    store: Arc<MemoryStore>,
) -> Collaborators {
    Collaborators {
        price_feed: prices,
        sentiment_feed: Arc::new(FixedSentimentFeed {
            score: 0.0,
            mentions: 0,
        }),
        submitter,
        store,
    }
}
