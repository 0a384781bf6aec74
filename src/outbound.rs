// ABOUTME: Reply-transport router choosing between cached reply handles and the push API.
// ABOUTME: Owns render-mode selection, chunked sends, and media upload with text fallback.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::{AccountConfig, RenderMode};
use crate::media::local_media_path;
use crate::target::Target;
use crate::text::{chunk_message, flatten_tables, needs_card_rendering};
use crate::token::CredentialStore;

/// The short-lived, per-conversation reply capability delivered inline with
/// every inbound message.
#[derive(Debug, Clone)]
pub struct ReplyHandle {
    pub url: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ReplyHandle {
    fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(at) => at <= Utc::now(),
            None => false,
        }
    }
}

/// Per-conversation cache of the most recently seen reply handle.
///
/// Best-effort by design: a conversation that has never produced an inbound
/// message has no cached handle, and proactive sends there must use the push
/// transport instead. Writes are last-write-wins per conversation id.
#[derive(Default)]
pub struct ReplyHandleRegistry {
    handles: RwLock<HashMap<String, ReplyHandle>>,
}

impl ReplyHandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the handle delivered with an inbound message. A newer handle
    /// always supersedes an older one for the same conversation.
    pub async fn observe(&self, conversation_id: &str, handle: ReplyHandle) {
        self.handles
            .write()
            .await
            .insert(conversation_id.to_string(), handle);
    }

    /// The current unexpired handle for a conversation, if any.
    pub async fn current(&self, conversation_id: &str) -> Option<ReplyHandle> {
        let handles = self.handles.read().await;
        handles
            .get(conversation_id)
            .filter(|h| !h.is_expired())
            .cloned()
    }
}

/// Errors from the router. A missing reply path is an expected, recoverable
/// condition the caller handles; everything else is an upstream failure.
#[derive(Debug)]
pub enum SendError {
    /// No cached reply handle and the push transport is unavailable.
    NoReplyPath { conversation_id: String },
    Upstream(anyhow::Error),
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::NoReplyPath { conversation_id } => {
                write!(f, "No reply path for conversation {}", conversation_id)
            }
            SendError::Upstream(e) => write!(f, "Send failed: {}", e),
        }
    }
}

impl std::error::Error for SendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SendError::Upstream(e) => e.source(),
            SendError::NoReplyPath { .. } => None,
        }
    }
}

impl From<anyhow::Error> for SendError {
    fn from(e: anyhow::Error) -> Self {
        SendError::Upstream(e)
    }
}

/// Normalized result of one outbound send, whatever transport carried it.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub conversation_id: String,
    pub correlation_token: String,
}

/// HTTP seam for the two outbound transports plus media upload.
#[async_trait]
pub trait PushGateway: Send + Sync {
    /// POST a message payload to a reply-handle URL. The bearer token is
    /// optional for this transport class.
    async fn post_webhook(&self, url: &str, bearer: Option<&str>, payload: &Value) -> Result<()>;

    /// One-to-one push. Returns the platform's correlation token.
    async fn push_user(
        &self,
        token: &str,
        robot_code: &str,
        user_id: &str,
        msg_key: &str,
        msg_param: &Value,
    ) -> Result<String>;

    /// Group push. Returns the platform's correlation token.
    async fn push_group(
        &self,
        token: &str,
        robot_code: &str,
        conversation_id: &str,
        msg_key: &str,
        msg_param: &Value,
    ) -> Result<String>;

    /// Binary multipart upload. Returns the opaque media reference.
    async fn upload_media(
        &self,
        token: &str,
        media_type: &str,
        file_name: &str,
        data: Vec<u8>,
    ) -> Result<String>;
}

/// Production gateway speaking to the platform's OpenAPI hosts.
pub struct HttpPushGateway {
    client: reqwest::Client,
    api_base: String,
    upload_base: String,
}

impl HttpPushGateway {
    pub fn new(
        client: reqwest::Client,
        api_base: impl Into<String>,
        upload_base: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_base: api_base.into(),
            upload_base: upload_base.into(),
        }
    }

    async fn push(&self, token: &str, url: String, body: Value) -> Result<String> {
        let response = self
            .client
            .post(&url)
            .header("x-acs-dingtalk-access-token", token)
            .json(&body)
            .send()
            .await
            .context("Push request failed")?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Push returned {}: {}", status, text);
        }
        let body: Value = response.json().await.context("Push response malformed")?;
        Ok(body
            .get("processQueryKey")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }
}

#[async_trait]
impl PushGateway for HttpPushGateway {
    async fn post_webhook(&self, url: &str, bearer: Option<&str>, payload: &Value) -> Result<()> {
        let mut request = self.client.post(url).json(payload);
        if let Some(token) = bearer {
            request = request.header("x-acs-dingtalk-access-token", token);
        }
        let response = request.send().await.context("Webhook post failed")?;
        let status = response.status();
        if !status.is_success() {
            bail!("Webhook returned {}", status);
        }
        let body: Value = response.json().await.unwrap_or(json!({}));
        if let Some(errcode) = body.get("errcode").and_then(Value::as_i64) {
            if errcode != 0 {
                bail!(
                    "Webhook rejected message: errcode={} errmsg={}",
                    errcode,
                    body.get("errmsg").and_then(Value::as_str).unwrap_or("")
                );
            }
        }
        Ok(())
    }

    async fn push_user(
        &self,
        token: &str,
        robot_code: &str,
        user_id: &str,
        msg_key: &str,
        msg_param: &Value,
    ) -> Result<String> {
        let url = format!("{}/v1.0/robot/oToMessages/batchSend", self.api_base);
        // msgParam is a JSON-encoded string on the wire.
        let body = json!({
            "robotCode": robot_code,
            "userIds": [user_id],
            "msgKey": msg_key,
            "msgParam": serde_json::to_string(msg_param)?,
        });
        self.push(token, url, body).await
    }

    async fn push_group(
        &self,
        token: &str,
        robot_code: &str,
        conversation_id: &str,
        msg_key: &str,
        msg_param: &Value,
    ) -> Result<String> {
        let url = format!("{}/v1.0/robot/groupMessages/send", self.api_base);
        let body = json!({
            "robotCode": robot_code,
            "openConversationId": conversation_id,
            "msgKey": msg_key,
            "msgParam": serde_json::to_string(msg_param)?,
        });
        self.push(token, url, body).await
    }

    async fn upload_media(
        &self,
        token: &str,
        media_type: &str,
        file_name: &str,
        data: Vec<u8>,
    ) -> Result<String> {
        let url = format!(
            "{}/media/upload?access_token={}&type={}",
            self.upload_base, token, media_type
        );
        let part = reqwest::multipart::Part::bytes(data).file_name(file_name.to_string());
        let form = reqwest::multipart::Form::new().part("media", part);
        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .context("Media upload failed")?;
        let status = response.status();
        if !status.is_success() {
            bail!("Media upload returned {}", status);
        }
        let body: Value = response.json().await.context("Upload response malformed")?;
        if body.get("errcode").and_then(Value::as_i64).unwrap_or(0) != 0 {
            bail!(
                "Media upload rejected: {}",
                body.get("errmsg").and_then(Value::as_str).unwrap_or("")
            );
        }
        body.get("media_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("Upload response missing media_id")
    }
}

/// How one outbound message is rendered, decided once per message.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Rendering {
    Plain(String),
    Card(String),
}

/// Routes outbound payloads onto the cached-handle or authenticated push
/// transport and normalizes the result shape.
pub struct Router {
    account: Arc<AccountConfig>,
    registry: Arc<ReplyHandleRegistry>,
    credentials: Arc<CredentialStore>,
    gateway: Arc<dyn PushGateway>,
}

impl Router {
    pub fn new(
        account: Arc<AccountConfig>,
        registry: Arc<ReplyHandleRegistry>,
        credentials: Arc<CredentialStore>,
        gateway: Arc<dyn PushGateway>,
    ) -> Self {
        Self {
            account,
            registry,
            credentials,
            gateway,
        }
    }

    pub fn registry(&self) -> &Arc<ReplyHandleRegistry> {
        &self.registry
    }

    async fn token(&self) -> Result<String> {
        let secret = self.account.resolve_secret()?;
        self.credentials
            .get_token(&self.account.client_id, &secret)
            .await
    }

    fn render(&self, text: &str) -> Rendering {
        match self.account.render_mode {
            RenderMode::Raw => Rendering::Plain(flatten_tables(text)),
            RenderMode::Card => Rendering::Card(text.to_string()),
            RenderMode::Auto => {
                if needs_card_rendering(text) {
                    Rendering::Card(text.to_string())
                } else {
                    Rendering::Plain(text.to_string())
                }
            }
        }
    }

    /// Send text to a target, choosing transport, rendering, and chunking.
    pub async fn send_text(&self, target: &Target, text: &str) -> Result<SendReceipt, SendError> {
        // Rendering is decided once per outbound message, not per chunk.
        let rendering = self.render(text);
        let (body, as_card) = match &rendering {
            Rendering::Plain(t) => (t.clone(), false),
            Rendering::Card(t) => (t.clone(), true),
        };
        let chunks = chunk_message(&body, self.account.chunk_limit);

        if let Some(handle_url) = self.webhook_for(target).await {
            // Best-effort bearer: this transport class accepts unauthenticated
            // posts, so a token failure is not a reason to fail the send.
            let bearer = self.token().await.ok();
            for chunk in &chunks {
                let payload = webhook_payload(chunk, as_card);
                self.gateway
                    .post_webhook(&handle_url, bearer.as_deref(), &payload)
                    .await
                    .map_err(SendError::Upstream)?;
            }
            return Ok(SendReceipt {
                conversation_id: target
                    .conversation_id()
                    .unwrap_or(handle_url.as_str())
                    .to_string(),
                correlation_token: Uuid::new_v4().to_string(),
            });
        }

        // Push transport.
        let conversation_id = match target.conversation_id() {
            Some(id) => id.to_string(),
            None => {
                // Webhook literal whose URL we failed to use above.
                return Err(SendError::Upstream(anyhow!("Webhook target unusable")));
            }
        };
        let token = match self.token().await {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(error = %e, conversation = %conversation_id, "No credentials for push transport");
                return Err(SendError::NoReplyPath { conversation_id });
            }
        };

        let mut correlation_token = String::new();
        for chunk in &chunks {
            let (msg_key, msg_param) = push_params(chunk, as_card);
            correlation_token = match target {
                Target::User(id) => {
                    self.gateway
                        .push_user(&token, &self.account.client_id, id, msg_key, &msg_param)
                        .await?
                }
                Target::Group(id) => {
                    self.gateway
                        .push_group(&token, &self.account.client_id, id, msg_key, &msg_param)
                        .await?
                }
                Target::Webhook(_) => unreachable!("webhook targets never reach the push path"),
            };
        }

        metrics::counter!("dingbridge_push_sends_total").increment(chunks.len() as u64);
        Ok(SendReceipt {
            conversation_id,
            correlation_token,
        })
    }

    /// Send a media reference: local paths upload first, remote URLs pass
    /// through, and any upload failure degrades to a plain-text link.
    pub async fn send_media(
        &self,
        target: &Target,
        reference: &str,
        file_name: Option<&str>,
    ) -> Result<SendReceipt, SendError> {
        if let Some(path) = local_media_path(reference) {
            match self.upload_local(&path, file_name).await {
                Ok(uploaded) => return self.send_uploaded(target, uploaded).await,
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "Media upload failed, falling back to link");
                    return self.send_text(target, reference).await;
                }
            }
        }

        // Remote reference: images go through as image messages, everything
        // else as a link.
        let mime = mime_guess::from_path(reference).first_or_octet_stream();
        if mime.type_() == mime_guess::mime::IMAGE {
            match self.send_remote_image(target, reference).await {
                Ok(receipt) => return Ok(receipt),
                Err(e) => {
                    tracing::warn!(error = %e, "Image send failed, falling back to link");
                }
            }
        }
        self.send_text(target, reference).await
    }

    async fn upload_local(
        &self,
        path: &std::path::Path,
        file_name: Option<&str>,
    ) -> Result<UploadedMedia> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read media file {}", path.display()))?;
        let name = file_name
            .map(str::to_string)
            .or_else(|| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "attachment".to_string());
        let mime = mime_guess::from_path(&name).first_or_octet_stream();
        let media_type = if mime.type_() == mime_guess::mime::IMAGE {
            "image"
        } else {
            "file"
        };

        let token = self.token().await?;
        let media_id = self
            .gateway
            .upload_media(&token, media_type, &name, data)
            .await?;
        Ok(UploadedMedia {
            media_id,
            file_name: name,
        })
    }

    async fn send_uploaded(
        &self,
        target: &Target,
        uploaded: UploadedMedia,
    ) -> Result<SendReceipt, SendError> {
        let conversation_id = match target.conversation_id() {
            Some(id) => id.to_string(),
            None => {
                // File messages only exist on the push transport; a bare
                // webhook target cannot carry one.
                return Err(SendError::Upstream(anyhow!(
                    "File delivery requires a user or group target"
                )));
            }
        };
        let token = match self.token().await {
            Ok(token) => token,
            Err(_) => return Err(SendError::NoReplyPath { conversation_id }),
        };

        let extension = std::path::Path::new(&uploaded.file_name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin")
            .to_string();
        let msg_param = json!({
            "mediaId": uploaded.media_id,
            "fileName": uploaded.file_name,
            "fileType": extension,
        });

        let correlation_token = match target {
            Target::User(id) => {
                self.gateway
                    .push_user(&token, &self.account.client_id, id, "sampleFile", &msg_param)
                    .await?
            }
            Target::Group(id) => {
                self.gateway
                    .push_group(&token, &self.account.client_id, id, "sampleFile", &msg_param)
                    .await?
            }
            Target::Webhook(_) => unreachable!("guarded above"),
        };

        Ok(SendReceipt {
            conversation_id,
            correlation_token,
        })
    }

    async fn send_remote_image(
        &self,
        target: &Target,
        url: &str,
    ) -> Result<SendReceipt, SendError> {
        if let Some(handle_url) = self.webhook_for(target).await {
            let bearer = self.token().await.ok();
            let payload = json!({
                "msgtype": "markdown",
                "markdown": {"title": "image", "text": format!("![image]({})", url)},
            });
            self.gateway
                .post_webhook(&handle_url, bearer.as_deref(), &payload)
                .await
                .map_err(SendError::Upstream)?;
            return Ok(SendReceipt {
                conversation_id: target.conversation_id().unwrap_or(url).to_string(),
                correlation_token: Uuid::new_v4().to_string(),
            });
        }

        let conversation_id = target
            .conversation_id()
            .map(str::to_string)
            .ok_or_else(|| SendError::Upstream(anyhow!("Webhook target unusable")))?;
        let token = match self.token().await {
            Ok(token) => token,
            Err(_) => return Err(SendError::NoReplyPath { conversation_id }),
        };
        let msg_param = json!({"photoURL": url});
        let correlation_token = match target {
            Target::User(id) => {
                self.gateway
                    .push_user(&token, &self.account.client_id, id, "sampleImageMsg", &msg_param)
                    .await?
            }
            Target::Group(id) => {
                self.gateway
                    .push_group(&token, &self.account.client_id, id, "sampleImageMsg", &msg_param)
                    .await?
            }
            Target::Webhook(_) => unreachable!("guarded above"),
        };
        Ok(SendReceipt {
            conversation_id,
            correlation_token,
        })
    }

    /// The bot message APIs offer no edit call. This fails loudly so a caller
    /// cannot mistake a dropped edit for a delivered one.
    pub async fn edit_text(
        &self,
        _target: &Target,
        _correlation_token: &str,
        _text: &str,
    ) -> Result<SendReceipt, SendError> {
        Err(SendError::Upstream(anyhow!(
            "Message editing is not supported by the bot API"
        )))
    }

    /// Reactions are likewise not part of the bot API surface.
    pub async fn react(
        &self,
        _target: &Target,
        _correlation_token: &str,
        _emoji: &str,
    ) -> Result<(), SendError> {
        Err(SendError::Upstream(anyhow!(
            "Reactions are not supported by the bot API"
        )))
    }

    /// Resolve the webhook URL for a target: a webhook literal wins, else the
    /// cached reply handle for the conversation.
    async fn webhook_for(&self, target: &Target) -> Option<String> {
        match target {
            Target::Webhook(url) => Some(url.clone()),
            Target::User(id) | Target::Group(id) => {
                self.registry.current(id).await.map(|h| h.url)
            }
        }
    }
}

struct UploadedMedia {
    media_id: String,
    file_name: String,
}

fn webhook_payload(chunk: &str, as_card: bool) -> Value {
    if as_card {
        json!({
            "msgtype": "actionCard",
            "actionCard": {"title": card_title(chunk), "text": chunk},
        })
    } else {
        json!({"msgtype": "text", "text": {"content": chunk}})
    }
}

fn push_params(chunk: &str, as_card: bool) -> (&'static str, Value) {
    if as_card {
        (
            "sampleMarkdown",
            json!({"title": card_title(chunk), "text": chunk}),
        )
    } else {
        ("sampleText", json!({"content": chunk}))
    }
}

fn card_title(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or("").trim_start_matches('#').trim();
    if first_line.is_empty() {
        return "Reply".to_string();
    }
    first_line.chars().take(60).collect()
}

// =============================================================================
// Tests
// =============================================================================
