//! Block-explorer client.
//!
//! The client is the only component that talks to the network. It is
//! responsible for:
//! - Accepting only https URLs on the explorer allow-list
//! - Pacing requests through the [`rate_limit::RateLimiter`]
//! - Retrying transient failures with bounded sleeps
//! - Rejecting malformed or suspicious response bodies
//! - Normalizing both list endpoints into [`types::TransferEnvelope`]
//!
//! Consumers depend on the [`TransferSource`] trait rather than the concrete
//! client, so reconciliation logic can be driven from an in-memory source.

pub mod cache;
pub mod rate_limit;
pub mod types;

use crate::utils::{mask_address, now_ms};
use async_trait::async_trait;
use cache::ResponseCache;
use rate_limit::RateLimiter;
use reqwest::StatusCode;
use reqwest::header::RETRY_AFTER;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use types::{ParsedTransfer, TransactionDetails, TransferEnvelope};

/// Explorer hosts the client will talk to. Anything else is rejected at
/// construction time.
pub const ALLOWED_API_HOSTS: [&str; 4] = [
    "apilist.tronscanapi.com",
    "api.trongrid.io",
    "api.tronscan.org",
    "nile.trongrid.io",
];

const MAX_ATTEMPTS: u32 = 3;
const LIST_LIMIT: usize = 50;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const TIMEOUT_RETRY_SLEEP: Duration = Duration::from_secs(5);
const FAILURE_RETRY_SLEEP: Duration = Duration::from_secs(10);
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Errors raised by the explorer client.
#[derive(Debug, Error)]
pub enum ExplorerError {
    /// The base URL failed allow-list validation.
    #[error("invalid explorer URL: {0}")]
    InvalidUrl(String),

    /// The request failed at the transport level.
    #[error("explorer request failed: {0}")]
    Network(#[from] reqwest::Error),

    /// TLS negotiation failed; never retried.
    #[error("explorer TLS failure: {0}")]
    Ssl(String),

    /// The response body was malformed or suspicious.
    #[error("explorer response rejected: {0}")]
    ApiRejected(String),

    /// The explorer kept answering 429 through every attempt.
    #[error("explorer rate limited, retry after {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },
}

/// The seam between reconciliation logic and the explorer.
#[async_trait]
pub trait TransferSource: Send + Sync {
    /// Native and TRC-20 transfers touching `address` since `since_ms`,
    /// merged and sorted newest first.
    async fn recent_transfers(
        &self,
        address: &str,
        since_ms: i64,
    ) -> Result<Vec<TransferEnvelope>, ExplorerError>;

    /// Per-transaction detail lookup; bypasses the list cache.
    async fn transaction_details(
        &self,
        transaction_id: &str,
    ) -> Result<Option<TransactionDetails>, ExplorerError>;

    /// Resolve an envelope to a canonical transfer. List data that embeds a
    /// payload resolves without a second call; bare envelopes fetch details.
    async fn parse_transfer(
        &self,
        envelope: &TransferEnvelope,
    ) -> Result<Option<ParsedTransfer>, ExplorerError> {
        if let Some(parsed) = types::parse_fast(envelope) {
            return Ok(Some(parsed));
        }
        match self.transaction_details(&envelope.hash).await? {
            Some(details) => Ok(types::parse_from_details(
                &envelope.hash,
                envelope.timestamp,
                &details,
            )),
            None => Ok(None),
        }
    }
}

pub struct ExplorerClient {
    api_url: String,
    http: reqwest::Client,
    limiter: RateLimiter,
    cache: ResponseCache,
}

impl ExplorerClient {
    pub fn new(
        api_url: &str,
        requests_per_minute: u32,
        cache_ttl: Duration,
    ) -> Result<Self, ExplorerError> {
        let api_url = validate_api_url(api_url)?;
        let http = reqwest::Client::builder()
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        info!(api_url = %api_url, "explorer client ready");
        Ok(Self {
            api_url,
            http,
            limiter: RateLimiter::new(requests_per_minute),
            cache: ResponseCache::new(cache_ttl),
        })
    }

    /// One rate-limited GET with bounded retries. Timeouts sleep 5 s before
    /// retrying, other transport failures 10 s; TLS failures surface
    /// immediately; 429 honors `Retry-After` between attempts.
    async fn get_json(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<Value, ExplorerError> {
        let url = format!("{}/{}", self.api_url, path);

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.limiter.acquire().await;

            let result = self
                .http
                .get(&url)
                .query(params)
                .timeout(REQUEST_TIMEOUT)
                .send()
                .await;

            match result {
                Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => {
                    self.limiter.record_429();
                    let retry_after_secs = response
                        .headers()
                        .get(RETRY_AFTER)
                        .and_then(|value| value.to_str().ok())
                        .and_then(|value| value.parse::<u64>().ok())
                        .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
                    if attempt < MAX_ATTEMPTS {
                        warn!(attempt, retry_after_secs, "explorer returned 429, honoring Retry-After");
                        tokio::time::sleep(Duration::from_secs(retry_after_secs)).await;
                        continue;
                    }
                    return Err(ExplorerError::RateLimited { retry_after_secs });
                }
                Ok(response) => {
                    if response.status().is_success() {
                        self.limiter.record_success();
                    }
                    let response = response.error_for_status()?;
                    return Ok(response.json::<Value>().await?);
                }
                Err(e) if e.is_timeout() => {
                    if attempt < MAX_ATTEMPTS {
                        warn!(attempt, "explorer request timed out, retrying");
                        tokio::time::sleep(TIMEOUT_RETRY_SLEEP).await;
                        continue;
                    }
                    return Err(ExplorerError::Network(e));
                }
                Err(e) if is_tls_error(&e) => {
                    return Err(ExplorerError::Ssl(e.to_string()));
                }
                Err(e) => {
                    if attempt < MAX_ATTEMPTS {
                        warn!(attempt, error = %e, "explorer request failed, retrying");
                        tokio::time::sleep(FAILURE_RETRY_SLEEP).await;
                        continue;
                    }
                    return Err(ExplorerError::Network(e));
                }
            }
        }
    }

    /// Native-coin transfers for an address, newest first. Cached.
    async fn fetch_native_transfers(
        &self,
        address: &str,
        limit: usize,
        start: usize,
    ) -> Result<Vec<TransferEnvelope>, ExplorerError> {
        let cache_key = format!("tx_{address}_{limit}_{start}");
        if let Some(hit) = self.cache.get(&cache_key) {
            return Ok(hit);
        }

        let params = [
            ("address", address.to_string()),
            ("limit", limit.min(LIST_LIMIT).to_string()),
            ("start", start.to_string()),
            ("sort", "-timestamp".to_string()),
        ];
        let value = self.get_json("transaction", &params).await?;
        require_clean_object(&value)?;

        let now = now_ms();
        let records = value
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let total = records.len();
        let envelopes: Vec<TransferEnvelope> = records
            .iter()
            .filter_map(|record| TransferEnvelope::from_native_record(record, now))
            .collect();
        info!(
            address = %mask_address(address),
            accepted = envelopes.len(),
            total,
            "fetched native transfers"
        );

        self.cache.put(cache_key, envelopes.clone());
        Ok(envelopes)
    }

    /// TRC-20 transfers for an address, normalized to the common envelope.
    /// Cached.
    async fn fetch_trc20_transfers(
        &self,
        address: &str,
        limit: usize,
        start: usize,
    ) -> Result<Vec<TransferEnvelope>, ExplorerError> {
        let cache_key = format!("trc20_{address}_{limit}_{start}");
        if let Some(hit) = self.cache.get(&cache_key) {
            return Ok(hit);
        }

        let params = [
            ("relatedAddress", address.to_string()),
            ("limit", limit.min(LIST_LIMIT).to_string()),
            ("start", start.to_string()),
            ("sort", "-timestamp".to_string()),
        ];
        let value = self.get_json("token_trc20/transfers", &params).await?;
        if types::contains_reserved_keys(&value) {
            return Err(ExplorerError::ApiRejected(
                "response contains reserved keys".to_string(),
            ));
        }

        let now = now_ms();
        let envelopes: Vec<TransferEnvelope> = trc20_body(&value)
            .iter()
            .filter_map(|record| TransferEnvelope::from_trc20_record(record, now))
            .collect();
        info!(
            address = %mask_address(address),
            accepted = envelopes.len(),
            "fetched TRC-20 transfers"
        );

        self.cache.put(cache_key, envelopes.clone());
        Ok(envelopes)
    }

    async fn fetch_details(
        &self,
        transaction_id: &str,
    ) -> Result<Option<TransactionDetails>, ExplorerError> {
        let params = [("hash", transaction_id.to_string())];
        let value = self.get_json("transaction-info", &params).await?;
        require_clean_object(&value)?;
        Ok(serde_json::from_value(value).ok())
    }
}

#[async_trait]
impl TransferSource for ExplorerClient {
    async fn recent_transfers(
        &self,
        address: &str,
        since_ms: i64,
    ) -> Result<Vec<TransferEnvelope>, ExplorerError> {
        let native = self.fetch_native_transfers(address, LIST_LIMIT, 0).await;
        let trc20 = self.fetch_trc20_transfers(address, LIST_LIMIT, 0).await;

        // One endpoint failing must not hide the other's transfers; only a
        // total outage surfaces as an error.
        let (native, trc20) = match (native, trc20) {
            (Err(native_err), Err(trc20_err)) => {
                warn!(error = %trc20_err, "TRC-20 transfer fetch failed");
                return Err(native_err);
            }
            (native, trc20) => (
                native.unwrap_or_else(|e| {
                    warn!(error = %e, "native transfer fetch failed");
                    Vec::new()
                }),
                trc20.unwrap_or_else(|e| {
                    warn!(error = %e, "TRC-20 transfer fetch failed");
                    Vec::new()
                }),
            ),
        };

        let mut merged: Vec<TransferEnvelope> = native
            .into_iter()
            .chain(trc20)
            .filter(|envelope| envelope.timestamp >= since_ms)
            .collect();
        merged.sort_by_key(|envelope| std::cmp::Reverse(envelope.timestamp));
        debug!(count = merged.len(), "merged recent transfers");
        Ok(merged)
    }

    async fn transaction_details(
        &self,
        transaction_id: &str,
    ) -> Result<Option<TransactionDetails>, ExplorerError> {
        self.fetch_details(transaction_id).await
    }
}

/// The allow-list gate: https, known host, port 443 if any.
fn validate_api_url(raw: &str) -> Result<String, ExplorerError> {
    let url = url::Url::parse(raw)
        .map_err(|e| ExplorerError::InvalidUrl(format!("{raw}: {e}")))?;

    if url.scheme() != "https" {
        return Err(ExplorerError::InvalidUrl(format!(
            "scheme must be https, got {}",
            url.scheme()
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| ExplorerError::InvalidUrl("missing host".to_string()))?;
    if !ALLOWED_API_HOSTS.contains(&host) {
        return Err(ExplorerError::InvalidUrl(format!(
            "host {host} is not on the explorer allow-list"
        )));
    }
    if let Some(port) = url.port() {
        if port != 443 {
            return Err(ExplorerError::InvalidUrl(format!(
                "suspicious port {port}"
            )));
        }
    }
    Ok(raw.trim_end_matches('/').to_string())
}

/// Top-level response hygiene: must be an object, free of reserved keys.
fn require_clean_object(value: &Value) -> Result<(), ExplorerError> {
    if !value.is_object() {
        return Err(ExplorerError::ApiRejected(
            "response is not a JSON object".to_string(),
        ));
    }
    if types::contains_reserved_keys(value) {
        return Err(ExplorerError::ApiRejected(
            "response contains reserved keys".to_string(),
        ));
    }
    Ok(())
}

/// The TRC-20 list body appears under `token_transfers`, `data`, or as the
/// top-level array depending on explorer version.
fn trc20_body(value: &Value) -> Vec<Value> {
    if let Some(items) = value.get("token_transfers").and_then(Value::as_array) {
        return items.clone();
    }
    if let Some(items) = value.get("data").and_then(Value::as_array) {
        return items.clone();
    }
    value.as_array().cloned().unwrap_or_default()
}

fn is_tls_error(error: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(error);
    while let Some(inner) = source {
        let text = inner.to_string().to_ascii_lowercase();
        if text.contains("tls") || text.contains("certificate") || text.contains("ssl") {
            return true;
        }
        source = inner.source();
    }
    false
}
