// ABOUTME: End-to-end handler scenarios with fake gateways, no network and no live agent.
// ABOUTME: Covers admission, reply routing, session reset, card fallback, and file delivery.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use dingbridge::card::CardGateway;
use dingbridge::codec::{Frame, FrameType};
use dingbridge::config::AccountConfig;
use dingbridge::dispatch::{AgentDispatcher, AgentRequest};
use dingbridge::handler::BotMessageHandler;
use dingbridge::media::{DownloadedMedia, MediaFetcher};
use dingbridge::outbound::{PushGateway, ReplyHandleRegistry, Router};
use dingbridge::session::SessionStore;
use dingbridge::token::{CredentialStore, ExchangedToken, TokenExchange};

// =============================================================================
// Fakes
// =============================================================================

struct StaticExchange;

#[async_trait]
impl TokenExchange for StaticExchange {
    async fn exchange(&self, _: &str, _: &str) -> Result<ExchangedToken> {
        Ok(ExchangedToken {
            access_token: "tok".to_string(),
            expires_in: Duration::from_secs(7200),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Sent {
    Webhook { url: String, content: String },
    PushUser { user: String, msg_key: String },
    PushGroup { group: String, msg_key: String },
    Upload { file_name: String },
}

#[derive(Default)]
struct RecordingPushGateway {
    sent: Mutex<Vec<Sent>>,
}

impl RecordingPushGateway {
    fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl PushGateway for RecordingPushGateway {
    async fn post_webhook(&self, url: &str, _bearer: Option<&str>, payload: &Value) -> Result<()> {
        let content = payload
            .pointer("/text/content")
            .or_else(|| payload.pointer("/actionCard/text"))
            .or_else(|| payload.pointer("/markdown/text"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        self.sent.lock().unwrap().push(Sent::Webhook {
            url: url.to_string(),
            content,
        });
        Ok(())
    }

    async fn push_user(&self, _t: &str, _r: &str, user_id: &str, msg_key: &str, _p: &Value) -> Result<String> {
        self.sent.lock().unwrap().push(Sent::PushUser {
            user: user_id.to_string(),
            msg_key: msg_key.to_string(),
        });
        Ok("pqk".to_string())
    }

    async fn push_group(&self, _t: &str, _r: &str, conversation_id: &str, msg_key: &str, _p: &Value) -> Result<String> {
        self.sent.lock().unwrap().push(Sent::PushGroup {
            group: conversation_id.to_string(),
            msg_key: msg_key.to_string(),
        });
        Ok("pqk".to_string())
    }

    async fn upload_media(&self, _t: &str, _mt: &str, file_name: &str, _d: Vec<u8>) -> Result<String> {
        self.sent.lock().unwrap().push(Sent::Upload {
            file_name: file_name.to_string(),
        });
        Ok("media-1".to_string())
    }
}

/// Card gateway that refuses to create instances, forcing the text fallback.
struct BrokenCardGateway;

#[async_trait]
impl CardGateway for BrokenCardGateway {
    async fn create_instance(&self, _: &str, _: &str, _: &str, _: &str) -> Result<()> {
        bail!("card service down")
    }
    async fn deliver(&self, _: &str, _: &str, _: &str, _: &str, _: bool) -> Result<()> {
        bail!("card service down")
    }
    async fn stream(&self, _: &str, _: &str, _: &str, _: &str, _: bool, _: bool) -> Result<()> {
        bail!("card service down")
    }
    async fn update_instance(&self, _: &str, _: &str, _: &Value) -> Result<()> {
        bail!("card service down")
    }
}

/// Card gateway that accepts everything and records streamed content.
#[derive(Default)]
struct RecordingCardGateway {
    streams: Mutex<Vec<(String, bool)>>,
}

impl RecordingCardGateway {
    fn streams(&self) -> Vec<(String, bool)> {
        self.streams.lock().unwrap().clone()
    }
}

#[async_trait]
impl CardGateway for RecordingCardGateway {
    async fn create_instance(&self, _: &str, _: &str, _: &str, _: &str) -> Result<()> {
        Ok(())
    }
    async fn deliver(&self, _: &str, _: &str, _: &str, _: &str, _: bool) -> Result<()> {
        Ok(())
    }
    async fn stream(&self, _: &str, _: &str, _: &str, content: &str, finalize: bool, _: bool) -> Result<()> {
        self.streams
            .lock()
            .unwrap()
            .push((content.to_string(), finalize));
        Ok(())
    }
    async fn update_instance(&self, _: &str, _: &str, _: &Value) -> Result<()> {
        Ok(())
    }
}

struct FakeDispatcher {
    reply: String,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl FakeDispatcher {
    fn new(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.to_string(),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentDispatcher for FakeDispatcher {
    async fn dispatch(&self, request: &AgentRequest, deltas: mpsc::Sender<String>) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(request.prompt.clone());
        let _ = deltas.send(self.reply.clone()).await;
        Ok(self.reply.clone())
    }
}

struct NoMediaFetcher;

#[async_trait]
impl MediaFetcher for NoMediaFetcher {
    async fn download(&self, _: &str, _: &str, _: &str) -> Result<DownloadedMedia> {
        bail!("no media in these tests")
    }
}

/// Fetcher that hands back fixed bytes for any download code.
struct StaticMediaFetcher;

#[async_trait]
impl MediaFetcher for StaticMediaFetcher {
    async fn download(&self, _: &str, _: &str, _: &str) -> Result<DownloadedMedia> {
        Ok(DownloadedMedia {
            file_name: "pic.png".to_string(),
            mime_type: "image/png".to_string(),
            data: b"png bytes".to_vec(),
        })
    }
}

// =============================================================================
// Scaffolding
// =============================================================================

struct Harness {
    handler: BotMessageHandler,
    gateway: Arc<RecordingPushGateway>,
    dispatcher: Arc<FakeDispatcher>,
}

fn harness(account_extra: &str, reply: &str) -> Harness {
    harness_with(
        account_extra,
        reply,
        Arc::new(BrokenCardGateway),
        Arc::new(NoMediaFetcher),
    )
}

fn harness_with(
    account_extra: &str,
    reply: &str,
    card_gateway: Arc<dyn CardGateway>,
    media: Arc<dyn MediaFetcher>,
) -> Harness {
    let toml = format!(
        "name = \"t\"\nclient_id = \"robot\"\nclient_secret = \"s\"\n{}",
        account_extra
    );
    let account: Arc<AccountConfig> = Arc::new(toml::from_str(&toml).unwrap());
    let gateway = Arc::new(RecordingPushGateway::default());
    let credentials = Arc::new(CredentialStore::new(Arc::new(StaticExchange)));
    let router = Arc::new(Router::new(
        account.clone(),
        Arc::new(ReplyHandleRegistry::new()),
        credentials.clone(),
        gateway.clone(),
    ));
    let dispatcher = FakeDispatcher::new(reply);
    let handler = BotMessageHandler::new(
        account,
        router,
        Arc::new(SessionStore::new(Duration::from_secs(1800))),
        dispatcher.clone(),
        card_gateway,
        media,
        credentials,
    );
    Harness {
        handler,
        gateway,
        dispatcher,
    }
}

fn frame(payload: Value) -> Frame {
    Frame {
        frame_type: FrameType::Callback,
        topic: "/v1.0/im/bot/messages/get".to_string(),
        message_id: "m-1".to_string(),
        data: payload.to_string(),
        headers: HashMap::new(),
    }
}

fn dm_payload(text: &str) -> Value {
    json!({
        "conversationId": "cidDm",
        "conversationType": "1",
        "senderStaffId": "u1",
        "sessionWebhook": "https://gw/session-wh",
        "sessionWebhookExpiredTime": 4102444800000_i64,
        "msgtype": "text",
        "text": {"content": text},
    })
}

fn group_payload(text: &str, mentioned: bool) -> Value {
    json!({
        "conversationId": "cidGroup",
        "conversationType": "2",
        "senderStaffId": "u1",
        "isInAtList": mentioned,
        "sessionWebhook": "https://gw/group-wh",
        "sessionWebhookExpiredTime": 4102444800000_i64,
        "msgtype": "text",
        "text": {"content": text},
    })
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_dm_round_trip_replies_via_session_webhook() {
    let h = harness("", "hi there");

    h.handler.process(&frame(dm_payload("hello"))).await.unwrap();

    assert_eq!(h.dispatcher.calls.load(Ordering::SeqCst), 1);
    let sent = h.gateway.sent();
    assert_eq!(
        sent,
        vec![Sent::Webhook {
            url: "https://gw/session-wh".to_string(),
            content: "hi there".to_string(),
        }]
    );
}

#[tokio::test]
async fn test_group_message_without_mention_is_dropped() {
    let h = harness("", "should not appear");

    h.handler
        .process(&frame(group_payload("just chatting", false)))
        .await
        .unwrap();

    assert_eq!(h.dispatcher.calls.load(Ordering::SeqCst), 0);
    assert!(h.gateway.sent().is_empty());
}

#[tokio::test]
async fn test_group_mention_gets_a_reply() {
    let h = harness("", "pong");

    h.handler
        .process(&frame(group_payload("@bot ping", true)))
        .await
        .unwrap();

    assert_eq!(h.dispatcher.calls.load(Ordering::SeqCst), 1);
    let sent = h.gateway.sent();
    assert_eq!(
        sent,
        vec![Sent::Webhook {
            url: "https://gw/group-wh".to_string(),
            content: "pong".to_string(),
        }]
    );
}

#[tokio::test]
async fn test_dm_allowlist_blocks_strangers() {
    let h = harness("dm_policy = \"allowlist\"\ndm_allow_from = [\"someone-else\"]\n", "secret");

    h.handler.process(&frame(dm_payload("let me in"))).await.unwrap();

    assert_eq!(h.dispatcher.calls.load(Ordering::SeqCst), 0);
    assert!(h.gateway.sent().is_empty());
}

#[tokio::test]
async fn test_pairing_policy_sends_notice_without_dispatch() {
    let h = harness("dm_policy = \"pairing\"\n", "secret");

    h.handler.process(&frame(dm_payload("hello?"))).await.unwrap();

    assert_eq!(h.dispatcher.calls.load(Ordering::SeqCst), 0);
    let sent = h.gateway.sent();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        Sent::Webhook { content, .. } => assert!(content.contains("u1")),
        other => panic!("expected a notice, got {:?}", other),
    }
}

#[tokio::test]
async fn test_reset_command_confirms_without_dispatch() {
    let h = harness("", "should not appear");

    h.handler.process(&frame(dm_payload("/reset"))).await.unwrap();

    assert_eq!(h.dispatcher.calls.load(Ordering::SeqCst), 0);
    let sent = h.gateway.sent();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        Sent::Webhook { content, .. } => assert!(content.contains("reset")),
        other => panic!("expected a confirmation, got {:?}", other),
    }
}

#[tokio::test]
async fn test_empty_message_is_acked_without_dispatch() {
    let h = harness("", "should not appear");

    h.handler.process(&frame(dm_payload("   "))).await.unwrap();

    assert_eq!(h.dispatcher.calls.load(Ordering::SeqCst), 0);
    assert!(h.gateway.sent().is_empty());
}

#[tokio::test]
async fn test_card_failure_falls_back_to_plain_delivery() {
    // Card streaming on, but the card gateway is down: the reply must still
    // arrive as an ordinary message.
    let h = harness("card_streaming = true\n", "fallback reply");

    h.handler.process(&frame(dm_payload("hello"))).await.unwrap();

    assert_eq!(h.dispatcher.calls.load(Ordering::SeqCst), 1);
    let sent = h.gateway.sent();
    assert_eq!(
        sent,
        vec![Sent::Webhook {
            url: "https://gw/session-wh".to_string(),
            content: "fallback reply".to_string(),
        }]
    );
}

#[tokio::test]
async fn test_file_marker_uploads_and_sends_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    std::io::Write::write_all(&mut file, b"report bytes").unwrap();
    let path = file.path().to_string_lossy().to_string();

    let reply = format!(
        "Here is the report.\n[FILE]{{\"path\":\"{}\",\"name\":\"report.pdf\"}}[/FILE]",
        path
    );
    let h = harness("", &reply);

    h.handler.process(&frame(dm_payload("make a report"))).await.unwrap();

    let sent = h.gateway.sent();
    assert_eq!(
        sent[0],
        Sent::Webhook {
            url: "https://gw/session-wh".to_string(),
            content: "Here is the report.".to_string(),
        }
    );
    assert_eq!(sent[1], Sent::Upload { file_name: "report.pdf".to_string() });
    assert_eq!(
        sent[2],
        Sent::PushUser {
            user: "u1".to_string(),
            msg_key: "sampleFile".to_string(),
        }
    );
}

#[tokio::test]
async fn test_card_reply_finishes_without_marker_text() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    std::io::Write::write_all(&mut file, b"report bytes").unwrap();
    let path = file.path().to_string_lossy().to_string();

    let reply = format!(
        "Here is the file.\n[FILE]{{\"path\":\"{}\",\"name\":\"r.pdf\"}}[/FILE]",
        path
    );
    let cards = Arc::new(RecordingCardGateway::default());
    let h = harness_with(
        "card_streaming = true\n",
        &reply,
        cards.clone(),
        Arc::new(NoMediaFetcher),
    );

    h.handler.process(&frame(dm_payload("make a report"))).await.unwrap();

    // The final card content is the reply with the marker text removed.
    let streams = cards.streams();
    let (final_content, finalize) = streams.last().unwrap();
    assert!(*finalize);
    assert_eq!(final_content, "Here is the file.");
    // The referenced file still goes out as a message.
    let sent = h.gateway.sent();
    assert!(sent.contains(&Sent::Upload { file_name: "r.pdf".to_string() }));
    assert!(sent.contains(&Sent::PushUser {
        user: "u1".to_string(),
        msg_key: "sampleFile".to_string(),
    }));
}

#[tokio::test]
async fn test_attachment_scratch_is_removed_after_turn() {
    let h = harness_with(
        "",
        "I looked at the picture.",
        Arc::new(BrokenCardGateway),
        Arc::new(StaticMediaFetcher),
    );

    let payload = json!({
        "conversationId": "cidDm",
        "conversationType": "1",
        "senderStaffId": "u1",
        "sessionWebhook": "https://gw/session-wh",
        "msgtype": "picture",
        "content": {"downloadCode": "dc1"},
    });
    h.handler.process(&frame(payload)).await.unwrap();

    // The prompt carried the downloaded attachment path...
    let prompts = h.dispatcher.prompts();
    let prompt = prompts.last().unwrap();
    let start = prompt.find("[attachment: ").expect("prompt names the attachment") + "[attachment: ".len();
    let end = prompt[start..].find(']').unwrap() + start;
    let attachment = std::path::Path::new(&prompt[start..end]);
    // ...and by the time the turn finished, the scratch file was gone.
    assert!(!attachment.exists());
    assert!(!attachment.parent().unwrap().exists());
}

#[tokio::test]
async fn test_malformed_payload_is_an_error() {
    let h = harness("", "unused");
    let mut bad = frame(json!({}));
    bad.data = "not json".to_string();
    assert!(h.handler.process(&bad).await.is_err());
}
