// ABOUTME: Bridge lifecycle that wires one stream client per enabled account and supervises them.
// ABOUTME: Also hosts the credential probe used by the CLI before going live.

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::card::HttpCardGateway;
use crate::config::{AccountConfig, AgentConfig, Config};
use crate::dispatch::HttpAgentDispatcher;
use crate::handler::{BotMessageHandler, ROBOT_MESSAGE_TOPIC};
use crate::media::HttpMediaFetcher;
use crate::outbound::{HttpPushGateway, ReplyHandleRegistry, Router};
use crate::session::SessionStore;
use crate::stream::StreamClient;
use crate::token::{CredentialStore, HttpTokenExchange, TokenExchange};

const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Top-level supervisor: one stream client per enabled account, all sharing
/// one HTTP client and one cancellation token.
pub struct Bridge {
    config: Config,
    cancel: CancellationToken,
}

impl Bridge {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run every enabled account until cancellation.
    pub async fn run(&self) -> Result<()> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        let mut tasks = Vec::new();
        for account in self.config.enabled_accounts() {
            let account = Arc::new(account.clone());
            tracing::info!(account = %account.name, client_id = %account.client_id, "Starting account");
            let client = wire_account(
                account.clone(),
                self.config.agent.clone(),
                http.clone(),
                self.cancel.clone(),
            );
            tasks.push(tokio::spawn(async move { client.run().await }));
        }
        if tasks.is_empty() {
            bail!("No enabled accounts to run");
        }

        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Account task panicked");
            }
        }
        Ok(())
    }
}

/// Build the full per-account stack and register its topic handler.
fn wire_account(
    account: Arc<AccountConfig>,
    agent: AgentConfig,
    http: reqwest::Client,
    cancel: CancellationToken,
) -> StreamClient {
    // Dispatcher gets its own client: agent turns run far longer than the
    // request timeout suitable for OpenAPI calls.
    let agent_http = reqwest::Client::new();

    let credentials = Arc::new(CredentialStore::new(Arc::new(HttpTokenExchange::new(
        http.clone(),
        account.api_base.clone(),
    ))));
    let registry = Arc::new(ReplyHandleRegistry::new());
    let router = Arc::new(Router::new(
        account.clone(),
        registry,
        credentials.clone(),
        Arc::new(HttpPushGateway::new(
            http.clone(),
            account.api_base.clone(),
            account.upload_base.clone(),
        )),
    ));
    let sessions = Arc::new(SessionStore::new(Duration::from_secs(
        account.session_timeout_secs,
    )));
    spawn_session_sweeper(sessions.clone(), cancel.clone());

    let handler = Arc::new(BotMessageHandler::new(
        account.clone(),
        router,
        sessions,
        Arc::new(HttpAgentDispatcher::new(agent_http, agent)),
        Arc::new(HttpCardGateway::new(http.clone(), account.api_base.clone())),
        Arc::new(HttpMediaFetcher::new(http.clone(), account.api_base.clone())),
        credentials,
    ));

    let mut client = StreamClient::new(account, http, cancel);
    client.register(ROBOT_MESSAGE_TOPIC, handler);
    client
}

fn spawn_session_sweeper(sessions: Arc<SessionStore>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SESSION_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {
                    sessions.sweep_expired().await;
                }
            }
        }
    });
}

/// Verify every enabled account's credentials without opening a stream.
pub async fn probe(config: &Config) -> Result<()> {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("Failed to build HTTP client")?;

    let mut failures = 0usize;
    for account in config.enabled_accounts() {
        let exchange = HttpTokenExchange::new(http.clone(), account.api_base.clone());
        let secret = match account.resolve_secret() {
            Ok(secret) => secret,
            Err(e) => {
                tracing::error!(account = %account.name, error = %e, "Secret unavailable");
                failures += 1;
                continue;
            }
        };
        match exchange.exchange(&account.client_id, &secret).await {
            Ok(token) => {
                tracing::info!(
                    account = %account.name,
                    expires_in_secs = token.expires_in.as_secs(),
                    "Credentials OK"
                );
            }
            Err(e) => {
                tracing::error!(account = %account.name, error = %e, "Credential check failed");
                failures += 1;
            }
        }
    }

    if failures > 0 {
        bail!("{} account(s) failed the credential probe", failures);
    }
    Ok(())
}
