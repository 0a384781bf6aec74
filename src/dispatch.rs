// ABOUTME: Agent backend dispatch that streams reply deltas over SSE or falls back to one JSON body.
// ABOUTME: The trait seam keeps reply handling testable without a live backend.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::AgentConfig;

/// One inbound turn handed to the agent backend.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub session_key: String,
    pub prompt: String,
    pub sender_id: String,
    pub conversation_id: String,
}

/// Seam to the agent backend. Deltas are forwarded through `deltas` as they
/// arrive; the concatenated full reply is returned when the turn completes.
#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    async fn dispatch(&self, request: &AgentRequest, deltas: mpsc::Sender<String>)
        -> Result<String>;
}

/// Line-buffering accumulator for server-sent events. Feed raw chunks in,
/// get completed `data:` payloads out, regardless of where chunk boundaries
/// fall.
#[derive(Default)]
struct SseAccumulator {
    buf: String,
}

impl SseAccumulator {
    fn feed(&mut self, chunk: &str) -> Vec<String> {
        self.buf.push_str(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            let line = line.trim_end();
            if let Some(payload) = line.strip_prefix("data:") {
                events.push(payload.trim_start().to_string());
            }
        }
        events
    }
}

/// Pull the text delta out of one SSE data payload. Returns `None` for the
/// `[DONE]` sentinel and for payloads with no text.
fn extract_delta(payload: &str) -> Option<String> {
    if payload == "[DONE]" {
        return None;
    }
    let value: Value = serde_json::from_str(payload).ok()?;
    for key in ["delta", "content", "text"] {
        if let Some(text) = value.get(key).and_then(Value::as_str) {
            if !text.is_empty() {
                return Some(text.to_string());
            }
        }
    }
    None
}

/// HTTP dispatcher speaking to the configured agent endpoint.
pub struct HttpAgentDispatcher {
    client: reqwest::Client,
    config: AgentConfig,
}

impl HttpAgentDispatcher {
    pub fn new(client: reqwest::Client, config: AgentConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl AgentDispatcher for HttpAgentDispatcher {
    async fn dispatch(
        &self,
        request: &AgentRequest,
        deltas: mpsc::Sender<String>,
    ) -> Result<String> {
        let body = json!({
            "session": request.session_key,
            "message": request.prompt,
            "sender": request.sender_id,
            "conversation": request.conversation_id,
            "stream": true,
        });

        let mut builder = self
            .client
            .post(&self.config.endpoint)
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .header("Accept", "text/event-stream")
            .json(&body);
        if let Some(token) = &self.config.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.context("Agent request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Agent returned {}: {}", status, body);
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("text/event-stream") {
            let mut full = String::new();
            let mut accumulator = SseAccumulator::default();
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.context("Agent stream interrupted")?;
                for payload in accumulator.feed(&String::from_utf8_lossy(&chunk)) {
                    if let Some(delta) = extract_delta(&payload) {
                        full.push_str(&delta);
                        // A closed receiver means the reply task gave up;
                        // keep draining so `full` is still complete.
                        let _ = deltas.send(delta).await;
                    }
                }
            }
            return Ok(full);
        }

        // Non-streaming backend: one JSON body with the whole reply.
        let body: Value = response.json().await.context("Agent response malformed")?;
        let reply = body
            .get("reply")
            .or_else(|| body.get("text"))
            .or_else(|| body.get("content"))
            .and_then(Value::as_str)
            .context("Agent response missing reply text")?
            .to_string();
        let _ = deltas.send(reply.clone()).await;
        Ok(reply)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulator_handles_arbitrary_chunk_boundaries() {
        let mut acc = SseAccumulator::default();
        assert!(acc.feed("data: {\"del").is_empty());
        let events = acc.feed("ta\":\"hi\"}\n\ndata: [DONE]\n");
        assert_eq!(events, vec!["{\"delta\":\"hi\"}", "[DONE]"]);
    }

    #[test]
    fn test_accumulator_ignores_comment_and_event_lines() {
        let mut acc = SseAccumulator::default();
        let events = acc.feed(": keepalive\nevent: delta\ndata: {\"delta\":\"x\"}\n");
        assert_eq!(events, vec!["{\"delta\":\"x\"}"]);
    }

    #[test]
    fn test_extract_delta_variants() {
        assert_eq!(extract_delta("{\"delta\":\"a\"}"), Some("a".to_string()));
        assert_eq!(extract_delta("{\"content\":\"b\"}"), Some("b".to_string()));
        assert_eq!(extract_delta("{\"text\":\"c\"}"), Some("c".to_string()));
    }

    #[test]
    fn test_extract_delta_done_and_garbage() {
        assert_eq!(extract_delta("[DONE]"), None);
        assert_eq!(extract_delta("not json"), None);
        assert_eq!(extract_delta("{\"delta\":\"\"}"), None);
        assert_eq!(extract_delta("{\"other\":1}"), None);
    }
}
