// ABOUTME: Outbound target parsing into a closed tagged union.
// ABOUTME: Replaces ad-hoc string-prefix checks with one parser and exhaustive matching.

/// Where an outbound message should go.
///
/// Every consumption site matches exhaustively on this, so an unhandled
/// string shape can never reach a transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A literal webhook URL (session webhook or any reply handle).
    Webhook(String),
    /// A one-to-one conversation with a user, by staff id.
    User(String),
    /// A group conversation, by open conversation id.
    Group(String),
}

impl Target {
    /// Parse a raw target string.
    ///
    /// Accepted shapes: `http(s)://...` webhook literals, `user:<id>`,
    /// `group:<id>`, and bare ids. Bare ids matching the platform's group
    /// conversation id prefix (`cid`) are treated as groups, everything
    /// else as a user id.
    pub fn parse(raw: &str) -> Target {
        let raw = raw.trim();
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return Target::Webhook(raw.to_string());
        }
        if let Some(id) = raw.strip_prefix("user:") {
            return Target::User(id.to_string());
        }
        if let Some(id) = raw.strip_prefix("group:") {
            return Target::Group(id.to_string());
        }
        if raw.starts_with("cid") {
            return Target::Group(raw.to_string());
        }
        Target::User(raw.to_string())
    }

    /// The conversation id used to key the reply-handle cache.
    ///
    /// Webhook literals have no conversation identity of their own.
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            Target::Webhook(_) => None,
            Target::User(id) | Target::Group(id) => Some(id),
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Target::Group(_))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_webhook_literal() {
        assert_eq!(
            Target::parse("https://oapi.example.com/robot/sendBySession?session=abc"),
            Target::Webhook("https://oapi.example.com/robot/sendBySession?session=abc".to_string())
        );
        assert!(matches!(Target::parse("http://x/wh"), Target::Webhook(_)));
    }

    #[test]
    fn test_parse_user_prefix() {
        assert_eq!(Target::parse("user:staff123"), Target::User("staff123".to_string()));
    }

    #[test]
    fn test_parse_group_prefix() {
        assert_eq!(Target::parse("group:cidAbC=="), Target::Group("cidAbC==".to_string()));
    }

    #[test]
    fn test_parse_bare_group_id_convention() {
        assert_eq!(Target::parse("cidXyZ123=="), Target::Group("cidXyZ123==".to_string()));
    }

    #[test]
    fn test_parse_bare_id_defaults_to_user() {
        assert_eq!(Target::parse("manager7"), Target::User("manager7".to_string()));
    }

    #[test]
    fn test_parse_trims_whitespace() {
        assert_eq!(Target::parse("  user:u1  "), Target::User("u1".to_string()));
    }

    #[test]
    fn test_conversation_id() {
        assert_eq!(Target::parse("user:u1").conversation_id(), Some("u1"));
        assert_eq!(Target::parse("cid99").conversation_id(), Some("cid99"));
        assert_eq!(Target::parse("https://x/wh").conversation_id(), None);
    }
}
