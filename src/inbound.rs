// ABOUTME: Inbound message normalizer for robot callback payloads.
// ABOUTME: Classifies text / rich content / media payloads into one canonical shape.

use serde_json::Value;

/// Upper bound on download references collected from one message, to bound
/// worst-case download fan-out.
pub const MAX_MEDIA_REFS: usize = 10;

/// Placeholder substituted for media nodes inside rich content.
pub const IMAGE_PLACEHOLDER: &str = "[image]";

/// Kind of media attached to an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    File,
    Voice,
    Video,
}

/// One downloadable attachment reference from an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRef {
    pub download_code: String,
    pub kind: MediaKind,
    pub file_name: Option<String>,
}

/// Canonical shape of one inbound message after classification.
#[derive(Debug, Clone)]
pub struct NormalizedMessage {
    pub text: String,
    pub mentioned_bot: bool,
    pub media: Vec<MediaRef>,
}

/// Classify one raw callback payload.
///
/// Never fails: unknown message types degrade to a bracketed type-name
/// placeholder rather than erroring.
pub fn normalize(payload: &Value) -> NormalizedMessage {
    let mentioned_bot = detect_mention(payload);
    let msgtype = payload.get("msgtype").and_then(Value::as_str).unwrap_or("");

    let (text, media) = match msgtype {
        "text" => {
            let content = payload
                .pointer("/text/content")
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim()
                .to_string();
            (content, Vec::new())
        }
        "richText" => {
            let mut text = String::new();
            let mut media = Vec::new();
            if let Some(nodes) = payload.pointer("/content/richText") {
                walk_rich_nodes(nodes, &mut text, &mut media);
            }
            (text.trim().to_string(), media)
        }
        "picture" => single_media(payload, MediaKind::Image, IMAGE_PLACEHOLDER.to_string()),
        "file" => {
            let name = payload
                .pointer("/content/fileName")
                .and_then(Value::as_str)
                .map(str::to_string);
            let placeholder = match &name {
                Some(n) => format!("[file: {}]", n),
                None => "[file]".to_string(),
            };
            let (text, mut media) = single_media(payload, MediaKind::File, placeholder);
            if let Some(m) = media.first_mut() {
                m.file_name = name;
            }
            (text, media)
        }
        "audio" => {
            let mut placeholder = "[voice]".to_string();
            // Server-side speech-to-text transcript, when present.
            if let Some(transcript) = payload
                .pointer("/content/recognition")
                .and_then(Value::as_str)
            {
                if !transcript.trim().is_empty() {
                    placeholder.push(' ');
                    placeholder.push_str(transcript.trim());
                }
            }
            single_media(payload, MediaKind::Voice, placeholder)
        }
        "video" => single_media(payload, MediaKind::Video, "[video]".to_string()),
        other => {
            tracing::debug!(msgtype = %other, "Unknown inbound message type");
            (format!("[{}]", other), Vec::new())
        }
    };

    let text = if mentioned_bot {
        strip_leading_mention(&text)
    } else {
        text
    };

    NormalizedMessage {
        text,
        mentioned_bot,
        media,
    }
}

fn single_media(payload: &Value, kind: MediaKind, placeholder: String) -> (String, Vec<MediaRef>) {
    let media = payload
        .pointer("/content/downloadCode")
        .and_then(Value::as_str)
        .map(|code| {
            vec![MediaRef {
                download_code: code.to_string(),
                kind,
                file_name: None,
            }]
        })
        .unwrap_or_default();
    (placeholder, media)
}

/// Depth-first traversal of the rich content node tree. Text nodes are
/// concatenated in document order; media nodes become a placeholder in the
/// text stream plus a collected download reference (capped).
fn walk_rich_nodes(node: &Value, text: &mut String, media: &mut Vec<MediaRef>) {
    match node {
        Value::Array(items) => {
            for item in items {
                walk_rich_nodes(item, text, media);
            }
        }
        Value::Object(obj) => {
            if let Some(t) = obj.get("text").and_then(Value::as_str) {
                text.push_str(t);
            } else if let Some(code) = obj.get("downloadCode").and_then(Value::as_str) {
                text.push_str(IMAGE_PLACEHOLDER);
                if media.len() < MAX_MEDIA_REFS {
                    media.push(MediaRef {
                        download_code: code.to_string(),
                        kind: MediaKind::Image,
                        file_name: None,
                    });
                }
            } else {
                // Containers nest further node lists.
                for value in obj.values() {
                    if value.is_array() || value.is_object() {
                        walk_rich_nodes(value, text, media);
                    }
                }
            }
        }
        _ => {}
    }
}

fn detect_mention(payload: &Value) -> bool {
    if payload
        .get("isInAtList")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        return true;
    }
    payload
        .get("atUsers")
        .and_then(Value::as_array)
        .map(|users| !users.is_empty())
        .unwrap_or(false)
}

/// Strip exactly one leading `@name` mention token. Legitimate `@` characters
/// mid-sentence are left alone.
fn strip_leading_mention(text: &str) -> String {
    let trimmed = text.trim_start();
    if let Some(rest) = trimmed.strip_prefix('@') {
        if let Some(idx) = rest.find(char::is_whitespace) {
            return rest[idx..].trim_start().to_string();
        }
        // The whole message is just the mention token.
        return String::new();
    }
    text.to_string()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_text_is_trimmed() {
        let payload = json!({"msgtype": "text", "text": {"content": "  hi  "}});
        let msg = normalize(&payload);
        assert_eq!(msg.text, "hi");
        assert!(!msg.mentioned_bot);
        assert!(msg.media.is_empty());
    }

    #[test]
    fn test_rich_text_interleaved_media() {
        let payload = json!({
            "msgtype": "richText",
            "content": {"richText": [
                {"text": "Hello "},
                {"downloadCode": "dc1", "type": "picture"},
                {"text": ""},
                {"downloadCode": "dc2", "type": "picture"}
            ]}
        });
        let msg = normalize(&payload);
        assert_eq!(msg.text, format!("Hello {}{}", IMAGE_PLACEHOLDER, IMAGE_PLACEHOLDER));
        assert_eq!(msg.media.len(), 2);
        assert_eq!(msg.media[0].download_code, "dc1");
        assert_eq!(msg.media[1].download_code, "dc2");
    }

    #[test]
    fn test_rich_text_media_cap() {
        let nodes: Vec<_> = (0..15)
            .map(|i| json!({"downloadCode": format!("dc{}", i), "type": "picture"}))
            .collect();
        let payload = json!({"msgtype": "richText", "content": {"richText": nodes}});
        let msg = normalize(&payload);
        assert_eq!(msg.media.len(), MAX_MEDIA_REFS);
        assert_eq!(msg.media[0].download_code, "dc0");
        assert_eq!(msg.media[9].download_code, "dc9");
        // Placeholders still stand in for every node.
        assert_eq!(msg.text.matches(IMAGE_PLACEHOLDER).count(), 15);
    }

    #[test]
    fn test_rich_text_nested_containers() {
        let payload = json!({
            "msgtype": "richText",
            "content": {"richText": [
                {"paragraph": [{"text": "a"}, {"downloadCode": "dc1"}]},
                {"text": "b"}
            ]}
        });
        let msg = normalize(&payload);
        assert_eq!(msg.text, format!("a{}b", IMAGE_PLACEHOLDER));
        assert_eq!(msg.media.len(), 1);
    }

    #[test]
    fn test_picture_payload() {
        let payload = json!({"msgtype": "picture", "content": {"downloadCode": "p1"}});
        let msg = normalize(&payload);
        assert_eq!(msg.text, IMAGE_PLACEHOLDER);
        assert_eq!(msg.media, vec![MediaRef {
            download_code: "p1".to_string(),
            kind: MediaKind::Image,
            file_name: None,
        }]);
    }

    #[test]
    fn test_file_payload_carries_name() {
        let payload = json!({
            "msgtype": "file",
            "content": {"downloadCode": "f1", "fileName": "report.pdf"}
        });
        let msg = normalize(&payload);
        assert_eq!(msg.text, "[file: report.pdf]");
        assert_eq!(msg.media[0].kind, MediaKind::File);
        assert_eq!(msg.media[0].file_name.as_deref(), Some("report.pdf"));
    }

    #[test]
    fn test_audio_appends_transcript() {
        let payload = json!({
            "msgtype": "audio",
            "content": {"downloadCode": "a1", "recognition": "hello world"}
        });
        let msg = normalize(&payload);
        assert_eq!(msg.text, "[voice] hello world");
        assert_eq!(msg.media[0].kind, MediaKind::Voice);
    }

    #[test]
    fn test_unknown_type_degrades_to_placeholder() {
        let payload = json!({"msgtype": "hologram"});
        let msg = normalize(&payload);
        assert_eq!(msg.text, "[hologram]");
        assert!(msg.media.is_empty());
    }

    #[test]
    fn test_mention_flag_detection() {
        let payload = json!({
            "msgtype": "text",
            "isInAtList": true,
            "text": {"content": "@bot what time is it"}
        });
        let msg = normalize(&payload);
        assert!(msg.mentioned_bot);
        assert_eq!(msg.text, "what time is it");
    }

    #[test]
    fn test_mention_via_at_users_list() {
        let payload = json!({
            "msgtype": "text",
            "atUsers": [{"dingtalkId": "x"}],
            "text": {"content": "@bot hello"}
        });
        let msg = normalize(&payload);
        assert!(msg.mentioned_bot);
        assert_eq!(msg.text, "hello");
    }

    #[test]
    fn test_mid_sentence_at_is_preserved() {
        let payload = json!({
            "msgtype": "text",
            "isInAtList": true,
            "text": {"content": "@bot email me at foo@bar.com"}
        });
        let msg = normalize(&payload);
        assert_eq!(msg.text, "email me at foo@bar.com");
    }

    #[test]
    fn test_no_mention_keeps_text_verbatim() {
        let payload = json!({"msgtype": "text", "text": {"content": "@channel notice"}});
        let msg = normalize(&payload);
        assert!(!msg.mentioned_bot);
        assert_eq!(msg.text, "@channel notice");
    }

    #[test]
    fn test_mention_only_message_is_empty() {
        let payload = json!({
            "msgtype": "text",
            "isInAtList": true,
            "text": {"content": "@bot"}
        });
        let msg = normalize(&payload);
        assert_eq!(msg.text, "");
    }
}
