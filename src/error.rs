//! Error taxonomy for the trading core

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can leave a component of the trading core
#[derive(Debug, Error)]
pub enum BotError {
    /// Retryable I/O failure (feed timeout, RPC hiccup)
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    #[error("slippage exceeded: quoted {quoted}, realized {realized}, tolerance {tolerance}")]
    SlippageExceeded {
        quoted: Decimal,
        realized: Decimal,
        tolerance: Decimal,
    },

    /// Malformed configuration or market data
    #[error("validation error: {0}")]
    Validation(String),

    #[error("execution failed after {attempts} attempt(s): {last_error}")]
    ExecutionFailed { attempts: u32, last_error: String },

    /// Credential or authorization failure; terminates the process
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("persistence error: {0}")]
    Persistence(String),
}

impl BotError {
    /// Whether this error must stop the controller
    pub fn is_fatal(&self) -> bool {
        matches!(self, BotError::Fatal(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BotError::TransientIo(_) => ErrorKind::TransientIo,
            BotError::SlippageExceeded { .. } => ErrorKind::SlippageExceeded,
            BotError::Validation(_) => ErrorKind::Validation,
            BotError::ExecutionFailed { .. } => ErrorKind::ExecutionFailed,
            BotError::Fatal(_) => ErrorKind::Fatal,
            BotError::Persistence(_) => ErrorKind::Persistence,
        }
    }
}

impl From<std::io::Error> for BotError {
    fn from(err: std::io::Error) -> Self {
        BotError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for BotError {
    fn from(err: serde_json::Error) -> Self {
        BotError::Persistence(err.to_string())
    }
}

/// Serializable error classification carried by trade outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientIo,
    SlippageExceeded,
    Validation,
    ExecutionFailed,
    Fatal,
    Persistence,
}

/// Failure reported by a price or sentiment feed
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FeedError {
    #[error("feed unavailable: {0}")]
    Unavailable(String),
}

/// Failure reported by the swap-submission collaborator
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SwapError {
    /// Network or RPC problem; the attempt may be retried
    #[error("transient swap error: {0}")]
    Transient(String),

    /// The gateway refused the request; retrying cannot help
    #[error("swap rejected: {0}")]
    Rejected(String),

    #[error("swap unauthorized: {0}")]
    Unauthorized(String),
}

pub type Result<T> = std::result::Result<T, BotError>;
