//! Scalp Runner - RL trading agent for DEX tokens
//!
//! 1. Loads `.env`, the config file and `SCALPER__*` overrides
//! 2. Restores the learned table and portfolio
//! 3. Polls price and sentiment, decides, vets and executes every interval
//! 4. Persists state on shutdown

use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn, Level};

use scalp_runner::client::{DexScreenerFeed, HttpSentimentFeed, NeutralSentimentFeed, SwapGatewayClient};
use scalp_runner::runner::exit_code_for;
use scalp_runner::signals::SentimentFeed;
use scalp_runner::{
    shutdown_channel, BotController, Collaborators, Config, JsonFileStore, PaperSwapClient,
    ShutdownHandle, SwapSubmitter, TradingMode,
};

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Failed to read .env: {}", e);
        }
    }

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::from(exit_code_for(&e, true));
        }
    };

    let level = config.log_level.parse::<Level>().unwrap_or(Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    info!("Starting Scalp Runner...");
    info!(
        tokens = ?config.tokens,
        mode = ?config.trading_mode,
        state_dir = %config.state_dir().display(),
        "Configuration loaded"
    );

    let collaborators = match build_collaborators(&config).await {
        Ok(c) => c,
        Err(e) => {
            error!("Startup failed: {:#}", e);
            return ExitCode::from(2);
        }
    };

    let (handle, shutdown) = shutdown_channel();
    spawn_signal_listener(handle);

    let mut controller = BotController::new(config, collaborators, shutdown);
    if let Err(e) = controller.restore().await {
        error!("Could not restore saved state: {}", e);
        return ExitCode::from(exit_code_for(&e, true));
    }

    match controller.run().await {
        Ok(report) => {
            info!(
                cycles = report.stats.cycles,
                fills = report.stats.fills,
                equity = %report.portfolio.total_equity,
                fees = %report.portfolio.fees_paid,
                "Shutdown complete"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Stopped on error: {}", e);
            ExitCode::from(exit_code_for(&e, false))
        }
    }
}

async fn build_collaborators(config: &Config) -> anyhow::Result<Collaborators> {
    let fetch_timeout = config.fetch_timeout();
    let price_feed = Arc::new(DexScreenerFeed::new(&config.endpoints.price_api_url, fetch_timeout)?);

    let sentiment_feed: Arc<dyn SentimentFeed> = match &config.endpoints.sentiment_api_url {
        Some(url) => Arc::new(HttpSentimentFeed::new(url, fetch_timeout)?),
        None => {
            warn!("No sentiment service configured, using neutral sentiment");
            Arc::new(NeutralSentimentFeed)
        }
    };

    let submitter: Arc<dyn SwapSubmitter> = match config.trading_mode {
        TradingMode::Paper => {
            info!("Running in PAPER TRADING mode");
            Arc::new(PaperSwapClient::new(
                config.execution.paper_fee_bps,
                config.policy.seed,
            ))
        }
        TradingMode::Live => {
            warn!("Running in LIVE TRADING mode - REAL MONEY AT RISK");
            let key = config
                .wallet_private_key
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("wallet_private_key is required in live mode"))?;
            Arc::new(SwapGatewayClient::new(
                &config.endpoints.swap_gateway_url,
                key.public_key()?,
                config.execution.confirm_timeout(),
            )?)
        }
    };

    let store = JsonFileStore::new(config.state_dir());
    store.init().await?;

    Ok(Collaborators {
        price_feed,
        sentiment_feed,
        submitter,
        store: Arc::new(store),
    })
}

/// Trigger shutdown on Ctrl-C or SIGTERM
fn spawn_signal_listener(handle: ShutdownHandle) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    warn!("SIGTERM handler unavailable: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("Signal received, finishing current cycle");
        handle.trigger();
    });
}
