//! Token metadata and amount conversion

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::error::{BotError, Result};

/// Wrapped SOL mint, the default quote asset
pub const SOL_MINT: &str = "So11111111111111111111111111111111111111112";

/// Known token metadata
#[derive(Debug, Clone, PartialEq)]
pub struct TokenInfo {
    pub mint: &'static str,
    pub symbol: &'static str,
    pub decimals: u8,
}

const KNOWN_TOKENS: &[TokenInfo] = &[
    TokenInfo {
        mint: SOL_MINT,
        symbol: "SOL",
        decimals: 9,
    },
    TokenInfo {
        mint: "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v",
        symbol: "USDC",
        decimals: 6,
    },
    TokenInfo {
        mint: "Es9vMFrzaCERmJfrF4H2FYD4KCoNkY11McCe8BenwNYB",
        symbol: "USDT",
        decimals: 6,
    },
    TokenInfo {
        mint: "DezXAZ8z7PnrnRJjz3wXBoRgixCa6xjnB7YaB1pPB263",
        symbol: "BONK",
        decimals: 5,
    },
];

/// Look up a token by symbol or mint address
pub fn get_token_info(symbol_or_mint: &str) -> Option<&'static TokenInfo> {
    KNOWN_TOKENS
        .iter()
        .find(|t| t.mint == symbol_or_mint || t.symbol.eq_ignore_ascii_case(symbol_or_mint))
}

/// True if the string is a base58-encoded 32-byte Solana address
pub fn is_valid_mint(address: &str) -> bool {
    matches!(bs58::decode(address).into_vec(), Ok(bytes) if bytes.len() == 32)
}

/// Resolve a configured symbol or mint to a canonical mint address
pub fn resolve_mint(symbol_or_mint: &str) -> Result<String> {
    if let Some(info) = get_token_info(symbol_or_mint) {
        return Ok(info.mint.to_string());
    }
    if is_valid_mint(symbol_or_mint) {
        Ok(symbol_or_mint.to_string())
    } else {
        Err(BotError::Validation(format!(
            "unknown symbol or invalid mint address: {}",
            symbol_or_mint
        )))
    }
}

/// Convert a UI amount to raw base units
///
/// Rejects negative amounts, amounts that overflow u64, and non-zero amounts
/// that round down to zero base units.
pub fn to_raw_amount(ui_amount: Decimal, decimals: u8) -> Result<u64> {
    if ui_amount < Decimal::ZERO {
        return Err(BotError::Validation(format!(
            "amount cannot be negative: {}",
            ui_amount
        )));
    }

    let multiplier = Decimal::from(10u64.pow(decimals as u32));
    let raw = (ui_amount * multiplier).trunc().to_u64().ok_or_else(|| {
        BotError::Validation(format!(
            "amount {} with {} decimals overflows u64",
            ui_amount, decimals
        ))
    })?;

    if raw == 0 && ui_amount > Decimal::ZERO {
        return Err(BotError::Validation(format!(
            "amount {} too small for {} decimals",
            ui_amount, decimals
        )));
    }

    Ok(raw)
}
