// ABOUTME: Agent session key store with idle timeout and forced renewal.
// ABOUTME: Keys are scoped per conversation or per sender and swept periodically.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::SessionScope;

struct SessionEntry {
    key: String,
    last_active: Instant,
}

/// In-memory session key store.
///
/// Writers are per-identifier last-write-wins; a fresh key always supersedes
/// an older one for the same identifier.
pub struct SessionStore {
    entries: RwLock<HashMap<String, SessionEntry>>,
    timeout: Duration,
}

impl SessionStore {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    /// The identifier a message's session is keyed by, per configured scope.
    pub fn identifier(scope: SessionScope, conversation_id: &str, sender_id: &str) -> String {
        match scope {
            SessionScope::Conversation => format!("conv:{}", conversation_id),
            SessionScope::Sender => format!("sender:{}", sender_id),
        }
    }

    /// Get the current session key for an identifier, creating one if absent
    /// or expired. `force_new` always mints a fresh key (session reset).
    pub async fn session_key(&self, identifier: &str, force_new: bool) -> String {
        let mut entries = self.entries.write().await;
        let now = Instant::now();

        if !force_new {
            if let Some(entry) = entries.get_mut(identifier) {
                if now.duration_since(entry.last_active) < self.timeout {
                    entry.last_active = now;
                    return entry.key.clone();
                }
            }
        }

        let key = Uuid::new_v4().to_string();
        entries.insert(
            identifier.to_string(),
            SessionEntry {
                key: key.clone(),
                last_active: now,
            },
        );
        key
    }

    /// Drop entries idle longer than the timeout. Returns how many were swept.
    pub async fn sweep_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| now.duration_since(entry.last_active) < self.timeout);
        let swept = before - entries.len();
        if swept > 0 {
            tracing::debug!(swept, remaining = entries.len(), "Swept expired sessions");
        }
        swept
    }
}

// =============================================================================
// Tests
// =============================================================================
