// ABOUTME: Expiry-aware bearer token cache shared by all authenticated transports.
// ABOUTME: Single-flight refresh behind an async mutex; exchange failures surface to the caller.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Remaining validity below which a cached token is considered stale.
pub const EXPIRY_MARGIN: Duration = Duration::from_secs(300);

/// Result of one credential exchange against the platform.
#[derive(Debug, Clone)]
pub struct ExchangedToken {
    pub access_token: String,
    pub expires_in: Duration,
}

/// Seam for the HTTP credential exchange, so the cache is testable without
/// a network.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn exchange(&self, app_key: &str, app_secret: &str) -> Result<ExchangedToken>;
}

/// Exchanges `{appKey, appSecret}` for `{accessToken, expireIn}` over HTTP.
pub struct HttpTokenExchange {
    client: reqwest::Client,
    api_base: String,
}

impl HttpTokenExchange {
    pub fn new(client: reqwest::Client, api_base: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into(),
        }
    }
}

#[async_trait]
impl TokenExchange for HttpTokenExchange {
    async fn exchange(&self, app_key: &str, app_secret: &str) -> Result<ExchangedToken> {
        let url = format!("{}/v1.0/oauth2/accessToken", self.api_base);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "appKey": app_key,
                "appSecret": app_secret,
            }))
            .send()
            .await
            .context("Token exchange request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Token exchange returned {}: {}", status, body);
        }

        let body: serde_json::Value = response
            .json()
            .await
            .context("Token exchange returned malformed JSON")?;
        let access_token = body
            .get("accessToken")
            .and_then(|v| v.as_str())
            .context("Token exchange response missing accessToken")?
            .to_string();
        let expires_in = body
            .get("expireIn")
            .and_then(|v| v.as_u64())
            .unwrap_or(7200);

        Ok(ExchangedToken {
            access_token,
            expires_in: Duration::from_secs(expires_in),
        })
    }
}

struct CachedToken {
    token: String,
    /// Already margin-adjusted: the token is served only while `Instant::now()`
    /// is before this point.
    valid_until: Instant,
}

/// Process-wide token cache, keyed by client id.
///
/// Concurrent callers serialize through one async mutex during refresh, which
/// prevents a stampede of duplicate exchanges when many inbound messages
/// arrive at once.
pub struct CredentialStore {
    exchange: Arc<dyn TokenExchange>,
    entries: Mutex<HashMap<String, CachedToken>>,
    margin: Duration,
}

impl CredentialStore {
    pub fn new(exchange: Arc<dyn TokenExchange>) -> Self {
        Self::with_margin(exchange, EXPIRY_MARGIN)
    }

    pub fn with_margin(exchange: Arc<dyn TokenExchange>, margin: Duration) -> Self {
        Self {
            exchange,
            entries: Mutex::new(HashMap::new()),
            margin,
        }
    }

    /// Return a token with at least the safety margin of remaining validity,
    /// refreshing synchronously when the cache misses or is near expiry.
    pub async fn get_token(&self, app_key: &str, app_secret: &str) -> Result<String> {
        let mut entries = self.entries.lock().await;

        if let Some(cached) = entries.get(app_key) {
            if Instant::now() < cached.valid_until {
                return Ok(cached.token.clone());
            }
        }

        let exchanged = self.exchange.exchange(app_key, app_secret).await?;
        let valid_until = Instant::now() + exchanged.expires_in.saturating_sub(self.margin);
        tracing::debug!(
            app_key = %app_key,
            expires_in_secs = exchanged.expires_in.as_secs(),
            "Refreshed access token"
        );
        entries.insert(
            app_key.to_string(),
            CachedToken {
                token: exchanged.access_token.clone(),
                valid_until,
            },
        );

        Ok(exchanged.access_token)
    }

    /// Drop the cached entry for one client id, forcing the next call to
    /// perform a fresh exchange.
    pub async fn clear(&self, app_key: &str) {
        self.entries.lock().await.remove(app_key);
    }
}

// =============================================================================
// Tests
// =============================================================================
