// ABOUTME: Incremental card delivery: create, deliver, and stream updates into an AI card.
// ABOUTME: Throttles streaming writes and degrades to the text path when card creation fails.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::AccountConfig;
use crate::target::Target;
use crate::token::CredentialStore;

/// Card lifecycle status values understood by the platform template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CardStatus {
    Inputting,
    Finished,
    Failed,
}

impl CardStatus {
    fn as_str(self) -> &'static str {
        match self {
            CardStatus::Inputting => "inputting",
            CardStatus::Finished => "finished",
            CardStatus::Failed => "failed",
        }
    }
}

/// HTTP seam for the card instance and streaming endpoints.
#[async_trait]
pub trait CardGateway: Send + Sync {
    /// Create a card instance from a template.
    async fn create_instance(
        &self,
        token: &str,
        template_id: &str,
        out_track_id: &str,
        open_space_id: &str,
    ) -> Result<()>;

    /// Deliver the created instance into its conversation.
    async fn deliver(
        &self,
        token: &str,
        out_track_id: &str,
        open_space_id: &str,
        robot_code: &str,
        is_group: bool,
    ) -> Result<()>;

    /// Push one full-content streaming update into the card.
    async fn stream(
        &self,
        token: &str,
        out_track_id: &str,
        guid: &str,
        content: &str,
        finalize: bool,
        error: bool,
    ) -> Result<()>;

    /// Update instance-level card parameters (status flips).
    async fn update_instance(&self, token: &str, out_track_id: &str, params: &Value) -> Result<()>;
}

/// Production gateway against the card OpenAPI.
pub struct HttpCardGateway {
    client: reqwest::Client,
    api_base: String,
}

impl HttpCardGateway {
    pub fn new(client: reqwest::Client, api_base: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into(),
        }
    }

    async fn call(&self, token: &str, builder: reqwest::RequestBuilder, what: &str) -> Result<()> {
        let response = builder
            .header("x-acs-dingtalk-access-token", token)
            .send()
            .await
            .with_context(|| format!("Card {} request failed", what))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Card {} returned {}: {}", what, status, body);
        }
        Ok(())
    }
}

#[async_trait]
impl CardGateway for HttpCardGateway {
    async fn create_instance(
        &self,
        token: &str,
        template_id: &str,
        out_track_id: &str,
        open_space_id: &str,
    ) -> Result<()> {
        let url = format!("{}/v1.0/card/instances", self.api_base);
        let body = json!({
            "cardTemplateId": template_id,
            "outTrackId": out_track_id,
            "openSpaceId": open_space_id,
            "cardData": {"cardParamMap": {"content": "", "status": ""}},
        });
        self.call(token, self.client.post(&url).json(&body), "create")
            .await
    }

    async fn deliver(
        &self,
        token: &str,
        out_track_id: &str,
        open_space_id: &str,
        robot_code: &str,
        is_group: bool,
    ) -> Result<()> {
        let url = format!("{}/v1.0/card/instances/deliver", self.api_base);
        let mut body = json!({
            "outTrackId": out_track_id,
            "openSpaceId": open_space_id,
        });
        if is_group {
            body["imGroupOpenDeliverModel"] = json!({"robotCode": robot_code});
        } else {
            body["imRobotOpenDeliverModel"] = json!({"spaceType": "IM_ROBOT", "robotCode": robot_code});
        }
        self.call(token, self.client.post(&url).json(&body), "deliver")
            .await
    }

    async fn stream(
        &self,
        token: &str,
        out_track_id: &str,
        guid: &str,
        content: &str,
        finalize: bool,
        error: bool,
    ) -> Result<()> {
        let url = format!("{}/v1.0/card/streaming", self.api_base);
        let body = json!({
            "outTrackId": out_track_id,
            "guid": guid,
            "key": "content",
            "content": content,
            "isFull": true,
            "isFinalize": finalize,
            "isError": error,
        });
        self.call(token, self.client.put(&url).json(&body), "streaming")
            .await
    }

    async fn update_instance(&self, token: &str, out_track_id: &str, params: &Value) -> Result<()> {
        let url = format!("{}/v1.0/card/instances", self.api_base);
        let body = json!({
            "outTrackId": out_track_id,
            "cardData": {"cardParamMap": params},
        });
        self.call(token, self.client.put(&url).json(&body), "update")
            .await
    }
}

/// Conversation address of a card, in the platform's open-space notation.
fn open_space_id(target: &Target, sender_id: &str) -> Option<String> {
    match target {
        Target::Group(id) => Some(format!("dtv2.card//IM_GROUP.{}", id)),
        Target::User(_) => Some(format!("dtv2.card//IM_ROBOT.{}", sender_id)),
        Target::Webhook(_) => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Created,
    Streaming,
    Closed,
}

/// One live card being streamed into.
///
/// Owned by a single reply task; not shared. Each streaming write carries the
/// full accumulated content, so a dropped intermediate update loses nothing.
pub struct CardStream {
    gateway: Arc<dyn CardGateway>,
    credentials: Arc<CredentialStore>,
    account: Arc<AccountConfig>,
    out_track_id: String,
    buffer: String,
    state: StreamState,
    last_push: Option<Instant>,
    interval: Duration,
}

impl CardStream {
    /// Create and deliver a card instance for a conversation.
    ///
    /// Returns `None` when the card cannot be set up (webhook-only target,
    /// credential failure, or either card call failing); the caller is
    /// expected to fall back to plain message delivery.
    pub async fn open(
        gateway: Arc<dyn CardGateway>,
        credentials: Arc<CredentialStore>,
        account: Arc<AccountConfig>,
        target: &Target,
        sender_id: &str,
    ) -> Option<CardStream> {
        let space = open_space_id(target, sender_id)?;
        let out_track_id = Uuid::new_v4().to_string();

        let secret = match account.resolve_secret() {
            Ok(secret) => secret,
            Err(e) => {
                tracing::warn!(error = %e, "Card setup skipped: no usable credentials");
                return None;
            }
        };
        let token = match credentials.get_token(&account.client_id, &secret).await {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(error = %e, "Card setup skipped: token exchange failed");
                return None;
            }
        };

        if let Err(e) = gateway
            .create_instance(&token, &account.card_template_id, &out_track_id, &space)
            .await
        {
            tracing::warn!(error = %e, "Card instance creation failed");
            return None;
        }
        if let Err(e) = gateway
            .deliver(&token, &out_track_id, &space, &account.client_id, target.is_group())
            .await
        {
            tracing::warn!(error = %e, out_track_id = %out_track_id, "Card delivery failed");
            return None;
        }

        tracing::debug!(out_track_id = %out_track_id, space = %space, "Card opened");
        let interval = Duration::from_millis(account.card_update_interval_ms);
        Some(CardStream {
            gateway,
            credentials,
            account,
            out_track_id,
            buffer: String::new(),
            state: StreamState::Created,
            last_push: None,
            interval,
        })
    }

    async fn token(&self) -> Result<String> {
        let secret = self.account.resolve_secret()?;
        self.credentials
            .get_token(&self.account.client_id, &secret)
            .await
    }

    /// Append a content delta and push the accumulated content if the throttle
    /// window has elapsed. Push failures are logged; the content stays
    /// buffered for the next attempt.
    pub async fn append(&mut self, delta: &str) {
        if self.state == StreamState::Closed {
            tracing::warn!(out_track_id = %self.out_track_id, "Append after card close ignored");
            return;
        }
        self.buffer.push_str(delta);

        let due = match self.last_push {
            None => true,
            Some(at) => at.elapsed() >= self.interval,
        };
        if !due {
            return;
        }

        if self.state == StreamState::Created {
            // First visible content flips the template into its typing state.
            if let Ok(token) = self.token().await {
                if let Err(e) = self
                    .gateway
                    .update_instance(
                        &token,
                        &self.out_track_id,
                        &json!({"status": CardStatus::Inputting.as_str()}),
                    )
                    .await
                {
                    tracing::debug!(error = %e, "Card status flip failed");
                }
            }
            self.state = StreamState::Streaming;
        }

        self.push(false, false).await;
    }

    /// Final push: the caller's final content, finalize flag, finished status.
    /// The final content replaces whatever was streamed, so transfer markers
    /// and other machine-directed text never stay visible in the card.
    /// Errors are logged, not escalated; the reply text has its own fallback.
    pub async fn finish(&mut self, final_content: &str) {
        if self.state == StreamState::Closed {
            return;
        }
        self.buffer = final_content.to_string();
        self.push(true, false).await;
        self.set_status(CardStatus::Finished).await;
        self.state = StreamState::Closed;
        metrics::counter!("dingbridge_cards_finished_total").increment(1);
    }

    /// Mark the card failed. Swallows all errors: by the time this runs the
    /// conversation is already being told about the failure another way.
    pub async fn fail(&mut self, note: &str) {
        if self.state == StreamState::Closed {
            return;
        }
        if !note.is_empty() {
            if !self.buffer.is_empty() {
                self.buffer.push_str("\n\n");
            }
            self.buffer.push_str(note);
        }
        self.push(true, true).await;
        self.set_status(CardStatus::Failed).await;
        self.state = StreamState::Closed;
    }

    /// The accumulated reply content so far.
    pub fn content(&self) -> &str {
        &self.buffer
    }

    async fn push(&mut self, finalize: bool, error: bool) {
        let token = match self.token().await {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(error = %e, "Card push skipped: token unavailable");
                return;
            }
        };
        let guid = Uuid::new_v4().to_string();
        match self
            .gateway
            .stream(&token, &self.out_track_id, &guid, &self.buffer, finalize, error)
            .await
        {
            Ok(()) => {
                self.last_push = Some(Instant::now());
            }
            Err(e) => {
                tracing::warn!(error = %e, out_track_id = %self.out_track_id, "Card streaming push failed");
            }
        }
    }

    async fn set_status(&self, status: CardStatus) {
        let token = match self.token().await {
            Ok(token) => token,
            Err(_) => return,
        };
        if let Err(e) = self
            .gateway
            .update_instance(&token, &self.out_track_id, &json!({"status": status.as_str()}))
            .await
        {
            tracing::debug!(error = %e, status = status.as_str(), "Card status update failed");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
