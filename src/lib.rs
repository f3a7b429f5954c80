//! Scalp Runner
//!
//! Reinforcement-learning trading core for DEX tokens: signal acquisition,
//! a tabular Q-learning policy, risk overrides and retried swap execution,
//! driven by a single-flight controller.

pub mod amount;
pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod intent;
pub mod policy;
pub mod portfolio;
pub mod risk;
pub mod runner;
pub mod signals;
pub mod state;
pub mod types;

// Re-export main types for convenience
pub use config::{Config, ExecutionConfig, RiskParameters, TradingMode};
pub use error::{BotError, ErrorKind, FeedError, Result, SwapError};
pub use executor::{ExecutionEngine, PaperSwapClient, SwapRequest, SwapResponse, SwapStatus, SwapSubmitter};
pub use policy::{PolicyConfig, PolicyEngine, QTable};
pub use portfolio::{Portfolio, Position};
pub use risk::{RiskDecision, RiskManager};
pub use runner::{shutdown_channel, BotController, Collaborators, CyclePhase, Shutdown, ShutdownHandle};
pub use signals::{PriceFeed, SentimentFeed, SignalAggregator, SignalConfig};
pub use state::{JsonFileStore, PersistedState, StateStore};
pub use types::{Action, MarketSnapshot, MarketState, TradeOutcome};
