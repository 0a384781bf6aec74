// ABOUTME: Stream gateway client: handshake, WebSocket session, ack plumbing, reconnect loop.
// ABOUTME: Frames are routed to registered topic handlers; every addressable frame is acked exactly once.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::codec::{self, AckOutcome, Frame, FrameType};
use crate::config::AccountConfig;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const OUTBOX_DEPTH: usize = 64;

/// A handler for one subscription topic.
///
/// Handlers returning `owns_ack() == false` are acked by the session loop:
/// success when `handle` returns `Ok`, failure otherwise. A handler that owns
/// its ack must send exactly one through the provided handle.
#[async_trait]
pub trait TopicHandler: Send + Sync {
    fn owns_ack(&self) -> bool {
        false
    }

    async fn handle(&self, frame: Frame, ack: Option<AckHandle>) -> Result<()>;
}

/// Single-use capability to acknowledge one frame on the live socket.
///
/// Consuming methods make a double ack unrepresentable. If the socket died in
/// the meantime the send is dropped silently; the gateway redelivers.
pub struct AckHandle {
    message_id: String,
    outbox: mpsc::Sender<String>,
}

impl AckHandle {
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub async fn success(self, note: &str) {
        self.send(AckOutcome::Success, note).await;
    }

    pub async fn failure(self, note: &str) {
        self.send(AckOutcome::Failure, note).await;
    }

    async fn send(self, outcome: AckOutcome, note: &str) {
        let raw = codec::encode_ack(&self.message_id, outcome, note);
        metrics::counter!("dingbridge_acks_total").increment(1);
        if self.outbox.send(raw).await.is_err() {
            tracing::debug!(message_id = %self.message_id, "Ack dropped: session already closed");
        }
    }
}

/// What the session loop should do with one decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// Hand to the registered topic handler.
    Dispatch,
    /// Ack success inline; nothing else to do.
    AckSuccess,
    /// Gateway asked us to move off this connection.
    CloseAndReconnect,
    /// Nothing addressable; drop.
    Ignore,
}

fn disposition(frame: &Frame, has_handler: bool) -> Disposition {
    match &frame.frame_type {
        FrameType::System if frame.topic == "disconnect" => Disposition::CloseAndReconnect,
        FrameType::Callback if has_handler => Disposition::Dispatch,
        // Unhandled but addressable frames are acked success so the gateway
        // does not redeliver them forever.
        _ if !frame.message_id.is_empty() => Disposition::AckSuccess,
        _ => Disposition::Ignore,
    }
}

/// Reconnect pacing: exponential backoff for handshake failures, a short
/// fixed delay for socket drops, reset after any successful session.
pub struct ReconnectPolicy {
    attempt: u32,
    base: Duration,
    cap: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            attempt: 0,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    pub fn handshake_failure_delay(&mut self) -> Duration {
        let delay = self
            .base
            .saturating_mul(1u32 << self.attempt.min(5))
            .min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn socket_drop_delay(&self) -> Duration {
        Duration::from_secs(3)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// How one WebSocket session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Cancelled,
    Dropped,
    RemoteDisconnect,
}

/// Connection endpoint issued by the gateway handshake.
#[derive(Debug, Clone)]
struct ConnectionTicket {
    endpoint: String,
    ticket: String,
}

/// One account's stream connection: handshake, session loop, reconnect.
pub struct StreamClient {
    account: Arc<AccountConfig>,
    http: reqwest::Client,
    handlers: HashMap<String, Arc<dyn TopicHandler>>,
    cancel: CancellationToken,
}

impl StreamClient {
    pub fn new(
        account: Arc<AccountConfig>,
        http: reqwest::Client,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            account,
            http,
            handlers: HashMap::new(),
            cancel,
        }
    }

    /// Register a handler for a callback topic. Must happen before `run`.
    pub fn register(&mut self, topic: impl Into<String>, handler: Arc<dyn TopicHandler>) {
        self.handlers.insert(topic.into(), handler);
    }

    /// Connect and serve until cancelled. Never returns `Ok` while the token
    /// is live; all failures feed the reconnect policy instead.
    pub async fn run(&self) {
        let mut policy = ReconnectPolicy::default();
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let ticket = match self.handshake().await {
                Ok(ticket) => ticket,
                Err(e) => {
                    let delay = policy.handshake_failure_delay();
                    tracing::warn!(
                        account = %self.account.name,
                        error = %e,
                        retry_in_secs = delay.as_secs(),
                        "Stream handshake failed"
                    );
                    if self.wait_or_cancel(delay).await {
                        return;
                    }
                    continue;
                }
            };

            match self.session(&ticket).await {
                Ok(SessionEnd::Cancelled) => return,
                Ok(SessionEnd::RemoteDisconnect) => {
                    policy.reset();
                    tracing::info!(account = %self.account.name, "Gateway requested reconnect");
                    metrics::counter!("dingbridge_reconnects_total").increment(1);
                    // Remote asked us to move; reconnect immediately.
                }
                Ok(SessionEnd::Dropped) => {
                    policy.reset();
                    let delay = policy.socket_drop_delay();
                    tracing::warn!(
                        account = %self.account.name,
                        retry_in_secs = delay.as_secs(),
                        "Stream connection dropped"
                    );
                    metrics::counter!("dingbridge_reconnects_total").increment(1);
                    if self.wait_or_cancel(delay).await {
                        return;
                    }
                }
                Err(e) => {
                    let delay = policy.socket_drop_delay();
                    tracing::warn!(account = %self.account.name, error = %e, "Stream session failed");
                    if self.wait_or_cancel(delay).await {
                        return;
                    }
                }
            }
        }
    }

    /// True when cancelled before the delay elapsed.
    async fn wait_or_cancel(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }

    /// POST the connection-open handshake and get back a WebSocket endpoint
    /// plus a one-time ticket.
    async fn handshake(&self) -> Result<ConnectionTicket> {
        let secret = self.account.resolve_secret()?;
        let subscriptions: Vec<Value> = self
            .handlers
            .keys()
            .map(|topic| json!({"type": "CALLBACK", "topic": topic}))
            .collect();
        let body = json!({
            "clientId": self.account.client_id,
            "clientSecret": secret,
            "subscriptions": subscriptions,
            "ua": concat!("dingbridge/", env!("CARGO_PKG_VERSION")),
            "localIp": local_ip(),
        });

        let url = format!("{}/v1.0/gateway/connections/open", self.account.api_base);
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("Connection-open request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Connection-open returned {}: {}", status, body);
        }
        let body: Value = response
            .json()
            .await
            .context("Connection-open returned malformed JSON")?;
        let endpoint = body
            .get("endpoint")
            .and_then(Value::as_str)
            .context("Connection-open response missing endpoint")?
            .to_string();
        let ticket = body
            .get("ticket")
            .and_then(Value::as_str)
            .context("Connection-open response missing ticket")?
            .to_string();
        Ok(ConnectionTicket { endpoint, ticket })
    }

    /// One WebSocket session: read frames, route them, write acks, ping.
    async fn session(&self, ticket: &ConnectionTicket) -> Result<SessionEnd> {
        let url = format!("{}?ticket={}", ticket.endpoint, ticket.ticket);
        let (ws, _) = tokio_tungstenite::connect_async(&url)
            .await
            .context("WebSocket connect failed")?;
        tracing::info!(account = %self.account.name, "Stream connected");

        let (mut sink, mut source) = ws.split();
        let (outbox_tx, mut outbox_rx) = mpsc::channel::<String>(OUTBOX_DEPTH);
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Cancelled);
                }
                Some(out) = outbox_rx.recv() => {
                    sink.send(Message::Text(out.into())).await.context("Ack write failed")?;
                }
                _ = ping.tick() => {
                    sink.send(Message::Ping(Vec::new().into())).await.context("Ping write failed")?;
                }
                incoming = source.next() => {
                    match incoming {
                        None => return Ok(SessionEnd::Dropped),
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "Stream read error");
                            return Ok(SessionEnd::Dropped);
                        }
                        Some(Ok(Message::Text(text))) => {
                            if self.on_text(text.as_str(), &outbox_tx).await {
                                // Drain any pending acks before closing.
                                while let Ok(out) = outbox_rx.try_recv() {
                                    let _ = sink.send(Message::Text(out.into())).await;
                                }
                                let _ = sink.send(Message::Close(None)).await;
                                return Ok(SessionEnd::RemoteDisconnect);
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            sink.send(Message::Pong(payload)).await.context("Pong write failed")?;
                        }
                        Some(Ok(Message::Close(_))) => return Ok(SessionEnd::Dropped),
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }

    /// Route one text frame. Returns true when the session must close.
    async fn on_text(&self, text: &str, outbox: &mpsc::Sender<String>) -> bool {
        let frame = match codec::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                // No messageId recoverable, so nothing to ack.
                tracing::warn!(error = %e, "Undecodable frame dropped");
                return false;
            }
        };
        metrics::counter!("dingbridge_frames_total").increment(1);

        let handler = self.handlers.get(&frame.topic).cloned();
        match disposition(&frame, handler.is_some()) {
            Disposition::Ignore => false,
            Disposition::AckSuccess => {
                let ack = AckHandle {
                    message_id: frame.message_id.clone(),
                    outbox: outbox.clone(),
                };
                ack.success("ok").await;
                false
            }
            Disposition::CloseAndReconnect => {
                if !frame.message_id.is_empty() {
                    let ack = AckHandle {
                        message_id: frame.message_id.clone(),
                        outbox: outbox.clone(),
                    };
                    ack.success("ok").await;
                }
                true
            }
            Disposition::Dispatch => {
                let handler = handler.unwrap_or_else(|| unreachable!("dispatch without handler"));
                // A frame without a messageId cannot be acked; the handler
                // still runs but gets no handle.
                let ack = if frame.message_id.is_empty() {
                    None
                } else {
                    Some(AckHandle {
                        message_id: frame.message_id.clone(),
                        outbox: outbox.clone(),
                    })
                };
                // Handlers run detached so a slow reply never stalls reads;
                // the gateway redelivers unacked frames after its own timeout.
                tokio::spawn(async move {
                    let message_id = frame.message_id.clone();
                    if handler.owns_ack() {
                        if let Err(e) = handler.handle(frame, ack).await {
                            tracing::error!(message_id = %message_id, error = %e, "Topic handler failed");
                        }
                    } else {
                        match handler.handle(frame, None).await {
                            Ok(()) => {
                                if let Some(ack) = ack {
                                    ack.success("ok").await;
                                }
                            }
                            Err(e) => {
                                tracing::error!(message_id = %message_id, error = %e, "Topic handler failed");
                                if let Some(ack) = ack {
                                    ack.failure(&e.to_string()).await;
                                }
                            }
                        }
                    }
                });
                false
            }
        }
    }
}

/// Best-effort local address for the handshake body. The gateway only wants
/// something identifying, not something routable.
fn local_ip() -> String {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

// =============================================================================
// Tests
// =============================================================================
