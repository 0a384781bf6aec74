// ABOUTME: Bot-message topic handler: admission, session lookup, agent dispatch, reply delivery.
// ABOUTME: Owns its ack: exactly one per frame, failure only for undecodable payloads.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::card::{CardGateway, CardStream};
use crate::codec::Frame;
use crate::config::{AccountConfig, DmPolicy, GroupPolicy};
use crate::dispatch::{AgentDispatcher, AgentRequest};
use crate::inbound::{self, NormalizedMessage};
use crate::media::MediaFetcher;
use crate::outbound::{ReplyHandle, Router, SendError};
use crate::session::SessionStore;
use crate::stream::{AckHandle, TopicHandler};
use crate::target::Target;
use crate::text::extract_file_markers;
use crate::token::CredentialStore;

/// Callback topic carrying bot messages.
pub const ROBOT_MESSAGE_TOPIC: &str = "/v1.0/im/bot/messages/get";

const DELTA_CHANNEL_DEPTH: usize = 64;

/// Routing facts pulled from one callback payload.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub conversation_id: String,
    pub sender_id: String,
    pub is_group: bool,
    pub webhook: Option<ReplyHandle>,
}

/// Parse the conversation facts every later step depends on. This is the one
/// place a payload can hard-fail.
pub fn parse_context(payload: &Value) -> Result<MessageContext> {
    let conversation_id = payload
        .get("conversationId")
        .and_then(Value::as_str)
        .context("Payload missing conversationId")?
        .to_string();
    let sender_id = payload
        .get("senderStaffId")
        .or_else(|| payload.get("senderId"))
        .and_then(Value::as_str)
        .context("Payload missing sender id")?
        .to_string();
    let is_group = payload
        .get("conversationType")
        .and_then(Value::as_str)
        .map(|t| t == "2")
        .unwrap_or(false);

    let webhook = payload
        .get("sessionWebhook")
        .and_then(Value::as_str)
        .map(|url| ReplyHandle {
            url: url.to_string(),
            expires_at: payload
                .get("sessionWebhookExpiredTime")
                .and_then(Value::as_i64)
                .and_then(millis_to_datetime),
        });

    Ok(MessageContext {
        conversation_id,
        sender_id,
        is_group,
        webhook,
    })
}

fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

/// Admission verdict for one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allow,
    /// Drop without telling anyone (unsolicited group chatter, disabled scope).
    DropSilently,
    /// Drop but tell the sender why.
    DropWithNotice(String),
}

/// Pure admission policy check.
pub fn admit(account: &AccountConfig, ctx: &MessageContext, mentioned_bot: bool) -> Admission {
    if ctx.is_group {
        match account.group_policy {
            GroupPolicy::Disabled => return Admission::DropSilently,
            GroupPolicy::Open => {}
            GroupPolicy::Allowlist => {
                // Keyed by sender, like the DM allowlist: the same person is
                // trusted wherever they write from.
                if !account
                    .group_allow_from
                    .iter()
                    .any(|id| id == &ctx.sender_id)
                {
                    return Admission::DropSilently;
                }
            }
        }
        // Group messages reach the agent only when the bot is addressed.
        if !mentioned_bot {
            return Admission::DropSilently;
        }
        return Admission::Allow;
    }

    match account.dm_policy {
        DmPolicy::Open => Admission::Allow,
        DmPolicy::Allowlist => {
            if account.dm_allow_from.iter().any(|id| id == &ctx.sender_id) {
                Admission::Allow
            } else {
                Admission::DropSilently
            }
        }
        DmPolicy::Pairing => {
            if account.dm_allow_from.iter().any(|id| id == &ctx.sender_id) {
                Admission::Allow
            } else {
                Admission::DropWithNotice(format!(
                    "This bot is not paired with you yet. Ask an administrator to add your user id: {}",
                    ctx.sender_id
                ))
            }
        }
    }
}

/// Handles the bot message topic end to end.
pub struct BotMessageHandler {
    account: Arc<AccountConfig>,
    router: Arc<Router>,
    sessions: Arc<SessionStore>,
    dispatcher: Arc<dyn AgentDispatcher>,
    card_gateway: Arc<dyn CardGateway>,
    media: Arc<dyn MediaFetcher>,
    credentials: Arc<CredentialStore>,
}

impl BotMessageHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        account: Arc<AccountConfig>,
        router: Arc<Router>,
        sessions: Arc<SessionStore>,
        dispatcher: Arc<dyn AgentDispatcher>,
        card_gateway: Arc<dyn CardGateway>,
        media: Arc<dyn MediaFetcher>,
        credentials: Arc<CredentialStore>,
    ) -> Self {
        Self {
            account,
            router,
            sessions,
            dispatcher,
            card_gateway,
            media,
            credentials,
        }
    }

    /// Process one bot-message frame. Returns `Err` only for payloads that
    /// cannot be processed at all; policy drops and agent failures are
    /// handled internally and count as processed.
    pub async fn process(&self, frame: &Frame) -> Result<()> {
        let payload: Value =
            serde_json::from_str(&frame.data).context("Bot message payload is not JSON")?;
        let ctx = parse_context(&payload)?;

        // The reply handle arrives piggybacked on every message; cache it
        // before any policy decision so even dropped messages refresh it.
        if let Some(handle) = ctx.webhook.clone() {
            self.router
                .registry()
                .observe(&ctx.conversation_id, handle.clone())
                .await;
            // DM replies are addressed by sender id, so the handle must be
            // findable under that key as well.
            if !ctx.is_group {
                self.router
                    .registry()
                    .observe(&ctx.sender_id, handle)
                    .await;
            }
        }

        let message = inbound::normalize(&payload);
        let target = if ctx.is_group {
            Target::Group(ctx.conversation_id.clone())
        } else {
            Target::User(ctx.sender_id.clone())
        };

        match admit(&self.account, &ctx, message.mentioned_bot) {
            Admission::Allow => {}
            Admission::DropSilently => {
                tracing::debug!(
                    conversation = %ctx.conversation_id,
                    sender = %ctx.sender_id,
                    "Message dropped by admission policy"
                );
                metrics::counter!("dingbridge_messages_dropped_total").increment(1);
                return Ok(());
            }
            Admission::DropWithNotice(notice) => {
                if let Err(e) = self.router.send_text(&target, &notice).await {
                    tracing::warn!(error = %e, "Failed to deliver admission notice");
                }
                metrics::counter!("dingbridge_messages_dropped_total").increment(1);
                return Ok(());
            }
        }

        let identifier = SessionStore::identifier(
            self.account.session_scope,
            &ctx.conversation_id,
            &ctx.sender_id,
        );

        if self.account.is_reset_command(&message.text) {
            self.sessions.session_key(&identifier, true).await;
            if let Err(e) = self
                .router
                .send_text(&target, "Session reset. Starting fresh.")
                .await
            {
                tracing::warn!(error = %e, "Failed to confirm session reset");
            }
            return Ok(());
        }

        if message.text.is_empty() && message.media.is_empty() {
            return Ok(());
        }

        let (prompt, scratch) = self.compose_prompt(&ctx, &message).await;
        let session_key = self.sessions.session_key(&identifier, false).await;
        let request = AgentRequest {
            session_key,
            prompt,
            sender_id: ctx.sender_id.clone(),
            conversation_id: ctx.conversation_id.clone(),
        };

        tracing::info!(
            account = %self.account.name,
            conversation = %ctx.conversation_id,
            sender = %ctx.sender_id,
            group = ctx.is_group,
            "Dispatching message to agent"
        );
        metrics::counter!("dingbridge_messages_dispatched_total").increment(1);

        self.reply(&ctx, &target, &request).await;

        // Attachment scratch only lives for the turn.
        if let Some(dir) = scratch {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                tracing::debug!(error = %e, dir = %dir.display(), "Scratch cleanup failed");
            }
        }
        Ok(())
    }

    /// Build the agent prompt: normalized text plus notes for any attachments
    /// we managed to download. Download failures degrade to the placeholder
    /// already present in the text. Returns the per-turn scratch directory
    /// holding the downloads, which the caller removes after the turn.
    async fn compose_prompt(
        &self,
        ctx: &MessageContext,
        message: &NormalizedMessage,
    ) -> (String, Option<PathBuf>) {
        let mut prompt = message.text.clone();
        if message.media.is_empty() {
            return (prompt, None);
        }

        let token = match self.token().await {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping attachment downloads: no token");
                return (prompt, None);
            }
        };

        let scratch = std::env::temp_dir().join(format!("dingbridge-turn-{}", uuid::Uuid::new_v4()));
        if let Err(e) = tokio::fs::create_dir_all(&scratch).await {
            tracing::warn!(error = %e, "Skipping attachment downloads: no scratch dir");
            return (prompt, None);
        }

        for (idx, media_ref) in message.media.iter().enumerate() {
            match self
                .media
                .download(&token, &self.account.client_id, &media_ref.download_code)
                .await
            {
                Ok(downloaded) => {
                    let path = scratch.join(format!("{}-{}", idx, downloaded.file_name));
                    match tokio::fs::write(&path, &downloaded.data).await {
                        Ok(()) => {
                            prompt.push_str(&format!("\n[attachment: {}]", path.display()));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to persist attachment");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        sender = %ctx.sender_id,
                        "Attachment download failed"
                    );
                }
            }
        }
        (prompt, Some(scratch))
    }

    async fn token(&self) -> Result<String> {
        let secret = self.account.resolve_secret()?;
        self.credentials
            .get_token(&self.account.client_id, &secret)
            .await
    }

    /// Run the agent turn and deliver the reply, streaming into a card when
    /// enabled and possible, otherwise as ordinary messages.
    async fn reply(&self, ctx: &MessageContext, target: &Target, request: &AgentRequest) {
        let card = if self.account.card_streaming {
            CardStream::open(
                self.card_gateway.clone(),
                self.credentials.clone(),
                self.account.clone(),
                target,
                &ctx.sender_id,
            )
            .await
        } else {
            None
        };

        match card {
            Some(card) => self.reply_into_card(target, request, card).await,
            None => self.reply_as_messages(target, request).await,
        }
    }

    async fn reply_into_card(&self, target: &Target, request: &AgentRequest, mut card: CardStream) {
        let (tx, mut rx) = mpsc::channel::<String>(DELTA_CHANNEL_DEPTH);
        let consumer = tokio::spawn(async move {
            while let Some(delta) = rx.recv().await {
                card.append(&delta).await;
            }
            card
        });

        let result = self.dispatcher.dispatch(request, tx).await;
        let mut card = match consumer.await {
            Ok(card) => card,
            Err(e) => {
                tracing::error!(error = %e, "Card consumer task panicked");
                return;
            }
        };

        match result {
            Ok(full) => {
                // The marker text is machine-directed; the card shows the
                // reply without it, and the files go out as messages.
                let (text, markers) = extract_file_markers(&full);
                card.finish(&text).await;
                for marker in markers {
                    self.send_marker(target, &marker.path, marker.name.as_deref())
                        .await;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Agent dispatch failed");
                card.fail("The agent could not complete this request.").await;
            }
        }
    }

    async fn reply_as_messages(&self, target: &Target, request: &AgentRequest) {
        let (tx, mut rx) = mpsc::channel::<String>(DELTA_CHANNEL_DEPTH);
        // Deltas are unused on this path; drain them so the dispatcher never
        // blocks on a full channel.
        let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });

        let result = self.dispatcher.dispatch(request, tx).await;
        let _ = drain.await;

        let full = match result {
            Ok(full) => full,
            Err(e) => {
                tracing::error!(error = %e, "Agent dispatch failed");
                if let Err(e) = self
                    .router
                    .send_text(target, "The agent could not complete this request.")
                    .await
                {
                    tracing::warn!(error = %e, "Failed to deliver agent-failure notice");
                }
                return;
            }
        };

        let (text, markers) = extract_file_markers(&full);
        if !text.trim().is_empty() {
            match self.router.send_text(target, &text).await {
                Ok(receipt) => {
                    tracing::debug!(
                        conversation = %receipt.conversation_id,
                        correlation = %receipt.correlation_token,
                        "Reply delivered"
                    );
                }
                Err(SendError::NoReplyPath { conversation_id }) => {
                    tracing::warn!(conversation = %conversation_id, "No reply path for agent reply");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Reply delivery failed");
                }
            }
        }
        for marker in markers {
            self.send_marker(target, &marker.path, marker.name.as_deref())
                .await;
        }
    }

    async fn send_marker(&self, target: &Target, path: &str, name: Option<&str>) {
        if let Err(e) = self.router.send_media(target, path, name).await {
            tracing::warn!(error = %e, path = %path, "File delivery failed");
        }
    }
}

#[async_trait]
impl TopicHandler for BotMessageHandler {
    fn owns_ack(&self) -> bool {
        true
    }

    async fn handle(&self, frame: Frame, ack: Option<AckHandle>) -> Result<()> {
        let outcome = self.process(&frame).await;
        if let Some(ack) = ack {
            match &outcome {
                Ok(()) => ack.success("ok").await,
                Err(e) => ack.failure(&e.to_string()).await,
            }
        }
        outcome
    }
}

// =============================================================================
// Tests
// =============================================================================
