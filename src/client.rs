//! HTTP collaborators: price feed, sentiment feed and swap gateway

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::amount::{get_token_info, to_raw_amount};
use crate::error::{FeedError, SwapError};
use crate::executor::{SwapRequest, SwapResponse, SwapStatus, SwapSubmitter};
use crate::signals::{PriceFeed, PriceReading, SentimentFeed, SentimentReading};
use crate::types::Action;

/// Decimals assumed for mints missing from the token table
const DEFAULT_DECIMALS: u8 = 6;

fn http_client(timeout: Duration) -> anyhow::Result<Client> {
    Ok(Client::builder()
        .timeout(timeout)
        .pool_max_idle_per_host(4)
        .build()?)
}

async fn get_json<T: serde::de::DeserializeOwned>(client: &Client, url: &str) -> anyhow::Result<T> {
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(anyhow::anyhow!("GET {} failed: {} - {}", url, status, text));
    }
    Ok(response.json().await?)
}

/// DexScreener token price feed
pub struct DexScreenerFeed {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DexScreenerResponse {
    #[serde(default)]
    pairs: Option<Vec<DexScreenerPair>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DexScreenerPair {
    #[serde(default)]
    price_usd: Option<String>,
}

impl DexScreenerFeed {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

/// Price of the first listed pair
fn first_pair_price(body: DexScreenerResponse) -> anyhow::Result<Decimal> {
    let raw = body
        .pairs
        .unwrap_or_default()
        .into_iter()
        .find_map(|p| p.price_usd)
        .ok_or_else(|| anyhow::anyhow!("no pairs with a USD price"))?;
    let price: Decimal = raw.parse()?;
    if price <= Decimal::ZERO {
        return Err(anyhow::anyhow!("non-positive price {}", price));
    }
    Ok(price)
}

#[async_trait]
impl PriceFeed for DexScreenerFeed {
    async fn get_price(&self, token: &str) -> Result<PriceReading, FeedError> {
        let url = format!("{}/latest/dex/tokens/{}", self.base_url, token);
        let fetch = async {
            let body: DexScreenerResponse = get_json(&self.client, &url).await?;
            first_pair_price(body)
        };
        let price = fetch
            .await
            .map_err(|e| FeedError::Unavailable(format!("dexscreener {}: {}", token, e)))?;
        debug!(token, %price, "Fetched price");
        Ok(PriceReading {
            price,
            timestamp: Utc::now(),
        })
    }
}

/// Sentiment service client
pub struct HttpSentimentFeed {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct SentimentResponse {
    score: f64,
    #[serde(default)]
    mentions: u64,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

impl HttpSentimentFeed {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SentimentFeed for HttpSentimentFeed {
    async fn get_sentiment(&self, token: &str) -> Result<SentimentReading, FeedError> {
        let url = format!("{}/sentiment/{}", self.base_url, token);
        let body: SentimentResponse = get_json(&self.client, &url)
            .await
            .map_err(|e| FeedError::Unavailable(format!("sentiment {}: {}", token, e)))?;
        debug!(token, score = body.score, mentions = body.mentions, "Fetched sentiment");
        Ok(SentimentReading {
            score: body.score,
            mentions: body.mentions,
            timestamp: body.timestamp.unwrap_or_else(Utc::now),
        })
    }
}

/// Used when no sentiment service is configured
pub struct NeutralSentimentFeed;

#[async_trait]
impl SentimentFeed for NeutralSentimentFeed {
    async fn get_sentiment(&self, _token: &str) -> Result<SentimentReading, FeedError> {
        Ok(SentimentReading {
            score: 0.0,
            mentions: 0,
            timestamp: Utc::now(),
        })
    }
}

/// Client for the swap-submission gateway
pub struct SwapGatewayClient {
    client: Client,
    base_url: String,
    wallet_public_key: String,
}

#[derive(Debug, Serialize)]
struct GatewaySwapRequest<'a> {
    order_id: Uuid,
    request_id: Uuid,
    side: Action,
    input_mint: &'a str,
    output_mint: &'a str,
    /// Raw input amount in base units
    in_amount: u64,
    quoted_price: Decimal,
    slippage_bps: u32,
    wallet: &'a str,
}

impl SwapGatewayClient {
    /// `wallet_public_key` identifies the signer; the key itself never leaves
    /// the process
    pub fn new(base_url: &str, wallet_public_key: String, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            wallet_public_key,
        })
    }
}

/// Map a non-success HTTP status to a swap error class
fn classify_status(status: StatusCode, body: String) -> SwapError {
    let detail = format!("{} - {}", status, body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SwapError::Unauthorized(detail),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => SwapError::Transient(detail),
        s if s.is_server_error() => SwapError::Transient(detail),
        _ => SwapError::Rejected(detail),
    }
}

fn slippage_bps(tolerance: Decimal) -> u32 {
    use rust_decimal::prelude::ToPrimitive;
    (tolerance * Decimal::from(10_000)).round().to_u32().unwrap_or(0)
}

#[async_trait]
impl SwapSubmitter for SwapGatewayClient {
    async fn submit_swap(&self, request: &SwapRequest) -> Result<SwapResponse, SwapError> {
        let decimals = get_token_info(&request.token_in)
            .map(|t| t.decimals)
            .unwrap_or(DEFAULT_DECIMALS);
        let in_amount = to_raw_amount(request.amount, decimals)
            .map_err(|e| SwapError::Rejected(e.to_string()))?;

        let body = GatewaySwapRequest {
            order_id: request.order_id,
            request_id: request.request_id,
            side: request.side,
            input_mint: &request.token_in,
            output_mint: &request.token_out,
            in_amount,
            quoted_price: request.quoted_price,
            slippage_bps: slippage_bps(request.slippage_tolerance),
            wallet: &self.wallet_public_key,
        };

        let url = format!("{}/swap", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Idempotency-Key", request.order_id.to_string())
            .json(&body)
            .send()
            .await
            .map_err(|e| SwapError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, text));
        }

        let parsed: SwapResponse = response
            .json()
            .await
            .map_err(|e| SwapError::Transient(format!("unreadable swap response: {}", e)))?;
        if parsed.status != SwapStatus::Failed && parsed.price <= Decimal::ZERO {
            return Err(SwapError::Transient(format!(
                "gateway reported price {} for {:?}",
                parsed.price, parsed.status
            )));
        }
        Ok(parsed)
    }
}
