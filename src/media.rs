// ABOUTME: Media transfer helpers for inbound attachment download and local-path detection.
// ABOUTME: Downloads resolve a download code to a URL, then fetch the bytes.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;

/// One downloaded inbound attachment.
#[derive(Debug, Clone)]
pub struct DownloadedMedia {
    pub file_name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// Seam for resolving and fetching inbound attachments.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn download(
        &self,
        token: &str,
        robot_code: &str,
        download_code: &str,
    ) -> Result<DownloadedMedia>;
}

/// Resolves a download code through the robot file endpoint, then fetches the
/// returned URL.
pub struct HttpMediaFetcher {
    client: reqwest::Client,
    api_base: String,
}

impl HttpMediaFetcher {
    pub fn new(client: reqwest::Client, api_base: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into(),
        }
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn download(
        &self,
        token: &str,
        robot_code: &str,
        download_code: &str,
    ) -> Result<DownloadedMedia> {
        let url = format!("{}/v1.0/robot/messageFiles/download", self.api_base);
        let response = self
            .client
            .post(&url)
            .header("x-acs-dingtalk-access-token", token)
            .json(&serde_json::json!({
                "robotCode": robot_code,
                "downloadCode": download_code,
            }))
            .send()
            .await
            .context("Download-code resolution request failed")?;

        let status = response.status();
        if !status.is_success() {
            bail!("Download-code resolution returned {}", status);
        }

        let body: serde_json::Value = response
            .json()
            .await
            .context("Download-code resolution returned malformed JSON")?;
        let download_url = body
            .get("downloadUrl")
            .and_then(|v| v.as_str())
            .context("Download-code resolution missing downloadUrl")?
            .to_string();

        let file_response = self
            .client
            .get(&download_url)
            .send()
            .await
            .context("Attachment fetch failed")?;
        if !file_response.status().is_success() {
            bail!("Attachment fetch returned {}", file_response.status());
        }

        let file_name = url::Url::parse(&download_url)
            .ok()
            .and_then(|u| {
                u.path_segments()
                    .and_then(|mut segments| segments.next_back().map(str::to_string))
            })
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "attachment".to_string());
        let mime_type = mime_guess::from_path(&file_name)
            .first_or_octet_stream()
            .to_string();

        let data = file_response
            .bytes()
            .await
            .context("Attachment body read failed")?
            .to_vec();

        Ok(DownloadedMedia {
            file_name,
            mime_type,
            data,
        })
    }
}

/// Detect a local filesystem reference in an outbound media string.
///
/// Recognizes the `file://`, `MEDIA:` and `attachment://` marker prefixes,
/// plus bare absolute paths (Unix-style roots and Windows drive letters).
/// Path-convention detection is a best-effort heuristic, not a contract.
pub fn local_media_path(raw: &str) -> Option<PathBuf> {
    let raw = raw.trim();
    for prefix in ["file://", "MEDIA:", "attachment://"] {
        if let Some(rest) = raw.strip_prefix(prefix) {
            return Some(PathBuf::from(rest));
        }
    }
    if raw.starts_with('/') {
        return Some(PathBuf::from(raw));
    }
    // Windows drive letter, e.g. C:\ or C:/
    let mut chars = raw.chars();
    if let (Some(drive), Some(':'), Some(sep)) = (chars.next(), chars.next(), chars.next()) {
        if drive.is_ascii_alphabetic() && (sep == '\\' || sep == '/') {
            return Some(PathBuf::from(raw));
        }
    }
    None
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_prefixes() {
        assert_eq!(
            local_media_path("file:///tmp/a.png"),
            Some(PathBuf::from("/tmp/a.png"))
        );
        assert_eq!(
            local_media_path("MEDIA:/var/data/b.pdf"),
            Some(PathBuf::from("/var/data/b.pdf"))
        );
        assert_eq!(
            local_media_path("attachment:///Users/me/c.txt"),
            Some(PathBuf::from("/Users/me/c.txt"))
        );
    }

    #[test]
    fn test_bare_absolute_paths() {
        assert_eq!(local_media_path("/tmp/x.png"), Some(PathBuf::from("/tmp/x.png")));
        assert_eq!(
            local_media_path("C:\\work\\x.png"),
            Some(PathBuf::from("C:\\work\\x.png"))
        );
    }

    #[test]
    fn test_remote_urls_are_not_local() {
        assert_eq!(local_media_path("https://cdn.example.com/x.png"), None);
        assert_eq!(local_media_path("http://x/y.jpg"), None);
    }

    #[test]
    fn test_relative_and_plain_strings_are_not_local() {
        assert_eq!(local_media_path("x.png"), None);
        assert_eq!(local_media_path("some text"), None);
    }
}
