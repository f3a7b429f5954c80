//! State persistence and the trade journal
//!
//! The learned table, the portfolio and any pending transitions are written
//! as one JSON document so a restart resumes exactly where shutdown left off.
//! Every recorded outcome is also appended to a JSON-lines journal.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{BotError, Result};
use crate::policy::PolicySnapshot;
use crate::portfolio::Portfolio;
use crate::risk::RiskReason;
use crate::types::{Action, MarketState, TradeOutcome};

const STATE_VERSION: u32 = 1;

/// Recorded outcome still waiting for its next state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTransition {
    pub token: String,
    pub state: MarketState,
    pub action: Action,
    pub reward: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Everything needed to resume after a restart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub policy: PolicySnapshot,
    pub portfolio: Portfolio,
    #[serde(default)]
    pub pending: Vec<PendingTransition>,
    pub saved_at: DateTime<Utc>,
}

impl PersistedState {
    pub fn new(policy: PolicySnapshot, portfolio: Portfolio, pending: Vec<PendingTransition>) -> Self {
        Self {
            version: STATE_VERSION,
            policy,
            portfolio,
            pending,
            saved_at: Utc::now(),
        }
    }
}

/// One line of the trade journal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub cycle: u64,
    pub proposed: Action,
    pub reason: RiskReason,
    pub outcome: TradeOutcome,
    pub realized_pnl: rust_decimal::Decimal,
    pub reward: f64,
    pub epsilon: f64,
}

/// Persistence collaborator
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save(&self, state: &PersistedState) -> Result<()>;

    /// `Ok(None)` when nothing has been saved yet
    async fn load(&self) -> Result<Option<PersistedState>>;

    async fn append_journal(&self, entry: &JournalEntry) -> Result<()>;
}

/// JSON files under a state directory
pub struct JsonFileStore {
    state_path: PathBuf,
    journal_dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        let base = state_dir.as_ref();
        Self {
            state_path: base.join("state.json"),
            journal_dir: base.join("journal"),
        }
    }

    pub async fn init(&self) -> Result<()> {
        if let Some(parent) = self.state_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::create_dir_all(&self.journal_dir).await?;
        Ok(())
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Journal file for the given day
    pub fn journal_path(&self, at: DateTime<Utc>) -> PathBuf {
        self.journal_dir
            .join(format!("trades-{}.jsonl", at.format("%Y-%m-%d")))
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn save(&self, state: &PersistedState) -> Result<()> {
        self.init().await?;
        let json = serde_json::to_string_pretty(state)?;

        // Write then rename so a crash never leaves a truncated file
        let tmp = self.state_path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &self.state_path).await?;

        info!(
            path = %self.state_path.display(),
            states = state.policy.q_table.len(),
            pending = state.pending.len(),
            "State saved"
        );
        Ok(())
    }

    async fn load(&self) -> Result<Option<PersistedState>> {
        let json = match fs::read_to_string(&self.state_path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.state_path.display(), "No saved state");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let state: PersistedState = serde_json::from_str(&json).map_err(|e| {
            BotError::Validation(format!(
                "saved state {} is malformed: {}",
                self.state_path.display(),
                e
            ))
        })?;
        if state.version != STATE_VERSION {
            return Err(BotError::Validation(format!(
                "saved state version {} is not supported",
                state.version
            )));
        }
        Ok(Some(state))
    }

    async fn append_journal(&self, entry: &JournalEntry) -> Result<()> {
        fs::create_dir_all(&self.journal_dir).await?;
        let path = self.journal_path(entry.outcome.completed_at);
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{PolicyConfig, PolicyEngine};
    use rust_decimal_macros::dec;

    fn sample_state() -> PersistedState {
        let mut engine = PolicyEngine::new(PolicyConfig {
            seed: Some(1),
            ..Default::default()
        });
        let s = MarketState::new(1, 2, 3, 0);
        engine.update(&s, Action::Buy, 0.25, &s);
        PersistedState::new(
            engine.snapshot(),
            Portfolio::new(dec!(100)),
            vec![PendingTransition {
                token: "TOKEN".to_string(),
                state: s,
                action: Action::Hold,
                reward: 0.0,
                recorded_at: Utc::now(),
            }],
        )
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested"));
        let state = sample_state();

        store.save(&state).await.unwrap();
        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.portfolio, state.portfolio);
        assert_eq!(loaded.pending, state.pending);
        assert_eq!(loaded.policy.q_table.len(), 1);
        assert!((loaded.policy.epsilon - state.policy.epsilon).abs() < 1e-12);
        assert!(!store.state_path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_malformed_state_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        store.init().await.unwrap();
        fs::write(store.state_path(), "{ not json").await.unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, BotError::Validation(_)));
    }

    #[tokio::test]
    async fn test_journal_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let outcome = TradeOutcome::hold("TOKEN", dec!(1));
        let entry = JournalEntry {
            cycle: 1,
            proposed: Action::Sell,
            reason: RiskReason::NoPosition,
            outcome: outcome.clone(),
            realized_pnl: dec!(0),
            reward: 0.0,
            epsilon: 0.9,
        };
        store.append_journal(&entry).await.unwrap();
        store
            .append_journal(&JournalEntry { cycle: 2, ..entry })
            .await
            .unwrap();

        let text = fs::read_to_string(store.journal_path(outcome.completed_at))
            .await
            .unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: JournalEntry = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.cycle, 2);
        assert_eq!(second.reason, RiskReason::NoPosition);
    }
}
