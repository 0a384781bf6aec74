// ABOUTME: Configuration parsing from a TOML file.
// ABOUTME: Per-account credential and policy bundles plus the agent backend endpoint.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::text::DEFAULT_CHUNK_LIMIT;

/// Top-level configuration: one agent backend, many bot accounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.accounts.is_empty() {
            bail!("No [[accounts]] configured");
        }
        for account in &self.accounts {
            if account.client_id.is_empty() {
                bail!("Account '{}' is missing client_id", account.name);
            }
            if account.client_secret.is_none() && account.client_secret_file.is_none() {
                bail!(
                    "Account '{}' needs client_secret or client_secret_file",
                    account.name
                );
            }
        }
        Ok(())
    }

    /// Accounts that should be monitored.
    pub fn enabled_accounts(&self) -> impl Iterator<Item = &AccountConfig> {
        self.accounts.iter().filter(|a| a.enabled)
    }
}

/// Agent backend reached over HTTP with SSE streaming responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_endpoint")]
    pub endpoint: String,
    /// Bearer token for the backend, if it requires one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default = "default_agent_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            endpoint: default_agent_endpoint(),
            token: None,
            timeout_secs: default_agent_timeout_secs(),
        }
    }
}

/// Admission policy for direct messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DmPolicy {
    Open,
    Pairing,
    Allowlist,
}

/// Admission policy for group conversations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupPolicy {
    Open,
    Allowlist,
    Disabled,
}

/// How outbound text is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    /// Always plain text; markdown tables are flattened.
    Raw,
    /// Always wrap in an interactive card so markdown renders.
    Card,
    /// Plain text unless the reply contains fenced code or a table.
    Auto,
}

/// Scope of one agent session key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionScope {
    /// One session per conversation (DM or group).
    Conversation,
    /// One session per sender, across conversations.
    Sender,
}

/// Per-tenant credential and policy bundle. Immutable snapshot per operation;
/// the bridge never mutates it.
#[derive(Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub name: String,
    /// App key / robot code on the platform.
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// File holding the secret, as an alternative to inlining it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_file: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_dm_policy")]
    pub dm_policy: DmPolicy,
    #[serde(default = "default_group_policy")]
    pub group_policy: GroupPolicy,
    #[serde(default)]
    pub dm_allow_from: Vec<String>,
    #[serde(default)]
    pub group_allow_from: Vec<String>,

    #[serde(default = "default_render_mode")]
    pub render_mode: RenderMode,
    #[serde(default = "default_chunk_limit")]
    pub chunk_limit: usize,

    #[serde(default = "default_session_scope")]
    pub session_scope: SessionScope,
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    #[serde(default = "default_reset_commands")]
    pub reset_commands: Vec<String>,

    /// Enable incremental card delivery of agent replies.
    #[serde(default)]
    pub card_streaming: bool,
    #[serde(default = "default_card_template_id")]
    pub card_template_id: String,
    /// Minimum interval between incremental card updates. Empirically tuned
    /// against platform rate limits; deliberately a tunable, not a constant.
    #[serde(default = "default_card_update_interval_ms")]
    pub card_update_interval_ms: u64,

    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Legacy OpenAPI host used only for media upload.
    #[serde(default = "default_upload_base")]
    pub upload_base: String,
}

impl AccountConfig {
    /// Resolve the client secret, reading the referenced file if configured.
    pub fn resolve_secret(&self) -> Result<String> {
        if let Some(secret) = &self.client_secret {
            return Ok(secret.clone());
        }
        if let Some(path) = &self.client_secret_file {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read secret file {}", path.display()))?;
            return Ok(raw.trim().to_string());
        }
        bail!("Account '{}' has no client secret configured", self.name)
    }

    /// Whether `text` matches one of the configured session-reset commands
    /// (case-insensitive, exact match after trim).
    pub fn is_reset_command(&self, text: &str) -> bool {
        let trimmed = text.trim();
        self.reset_commands
            .iter()
            .any(|cmd| cmd.eq_ignore_ascii_case(trimmed))
    }
}

// Custom Debug impl to redact the secret
impl std::fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountConfig")
            .field("name", &self.name)
            .field("client_id", &self.client_id)
            .field(
                "client_secret",
                &self.client_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("client_secret_file", &self.client_secret_file)
            .field("enabled", &self.enabled)
            .field("dm_policy", &self.dm_policy)
            .field("group_policy", &self.group_policy)
            .field("render_mode", &self.render_mode)
            .field("card_streaming", &self.card_streaming)
            .finish_non_exhaustive()
    }
}

fn default_true() -> bool {
    true
}

fn default_agent_endpoint() -> String {
    "http://127.0.0.1:18789/v1/chat".to_string()
}

fn default_agent_timeout_secs() -> u64 {
    300
}

fn default_dm_policy() -> DmPolicy {
    DmPolicy::Open
}

fn default_group_policy() -> GroupPolicy {
    GroupPolicy::Open
}

fn default_render_mode() -> RenderMode {
    RenderMode::Auto
}

fn default_chunk_limit() -> usize {
    DEFAULT_CHUNK_LIMIT
}

fn default_session_scope() -> SessionScope {
    SessionScope::Conversation
}

fn default_session_timeout_secs() -> u64 {
    1800 // 30 minutes idle
}

fn default_reset_commands() -> Vec<String> {
    vec!["/reset".to_string(), "/new".to_string()]
}

fn default_card_template_id() -> String {
    // Platform-provided streaming markdown card template.
    "382e4302-551d-4880-bf29-f33830d1e305.schema".to_string()
}

fn default_card_update_interval_ms() -> u64 {
    300
}

fn default_api_base() -> String {
    "https://api.dingtalk.com".to_string()
}

fn default_upload_base() -> String {
    "https://oapi.dingtalk.com".to_string()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn minimal_toml() -> &'static str {
        r#"
[[accounts]]
name = "main"
client_id = "ding-app-key"
client_secret = "shh"
"#
    }

    #[test]
    fn test_load_minimal_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(minimal_toml().as_bytes()).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.accounts.len(), 1);
        let account = &config.accounts[0];
        assert_eq!(account.client_id, "ding-app-key");
        assert!(account.enabled);
        assert_eq!(account.dm_policy, DmPolicy::Open);
        assert_eq!(account.render_mode, RenderMode::Auto);
        assert_eq!(account.chunk_limit, DEFAULT_CHUNK_LIMIT);
        assert_eq!(account.card_update_interval_ms, 300);
        assert!(!account.card_streaming);
    }

    #[test]
    fn test_load_rejects_missing_secret() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[[accounts]]\nname = \"x\"\nclient_id = \"k\"\n")
            .unwrap();
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_load_rejects_empty_accounts() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[agent]\nendpoint = \"http://x\"\n").unwrap();
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_secret_from_file() {
        let mut secret_file = tempfile::NamedTempFile::new().unwrap();
        secret_file.write_all(b"  topsecret\n").unwrap();
        let toml = format!(
            "[[accounts]]\nname = \"x\"\nclient_id = \"k\"\nclient_secret_file = \"{}\"\n",
            secret_file.path().display()
        );
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(toml.as_bytes()).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.accounts[0].resolve_secret().unwrap(), "topsecret");
    }

    #[test]
    fn test_policy_parsing() {
        let toml = r#"
[[accounts]]
name = "x"
client_id = "k"
client_secret = "s"
dm_policy = "allowlist"
group_policy = "disabled"
render_mode = "card"
session_scope = "sender"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let account = &config.accounts[0];
        assert_eq!(account.dm_policy, DmPolicy::Allowlist);
        assert_eq!(account.group_policy, GroupPolicy::Disabled);
        assert_eq!(account.render_mode, RenderMode::Card);
        assert_eq!(account.session_scope, SessionScope::Sender);
    }

    #[test]
    fn test_reset_command_matching() {
        let config: Config = toml::from_str(minimal_toml()).unwrap();
        let account = &config.accounts[0];
        assert!(account.is_reset_command("/reset"));
        assert!(account.is_reset_command("  /RESET  "));
        assert!(account.is_reset_command("/new"));
        assert!(!account.is_reset_command("/reset please"));
        assert!(!account.is_reset_command("reset"));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let config: Config = toml::from_str(minimal_toml()).unwrap();
        let debug = format!("{:?}", config.accounts[0]);
        assert!(!debug.contains("shh"));
        assert!(debug.contains("REDACTED"));
    }
}
