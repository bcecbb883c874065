//! Inbound envelope — the single message shape accepted at the runtime boundary.
//!
//! Channel adapters (stdin, chat bots, webhooks) convert whatever they receive
//! into an `Envelope` and call [`Envelope::validate`] once; everything past the
//! boundary can rely on the required fields being present.

use serde::{Deserialize, Serialize};
use crate::error::EnvelopeError;

/// A message received from a channel and addressed to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The channel this message arrived on (e.g. "cli", "telegram")
    pub channel: String,

    /// The chat/group/DM identifier within the channel
    pub chat_id: String,

    /// The text content
    pub content: String,

    /// Explicit session override; defaults to `<channel>:<chat_id>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Channel-specific metadata
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Envelope {
    pub fn new(channel: impl Into<String>, chat_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            session_id: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Check required fields.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.channel.trim().is_empty() {
            return Err(EnvelopeError::MissingField("channel"));
        }
        if self.chat_id.trim().is_empty() {
            return Err(EnvelopeError::MissingField("chat_id"));
        }
        if self.content.trim().is_empty() {
            return Err(EnvelopeError::EmptyContent);
        }
        Ok(())
    }

    /// The session this envelope is routed to.
    pub fn session_key(&self) -> String {
        match &self.session_id {
            Some(id) if !id.trim().is_empty() => id.clone(),
            _ => format!("{}:{}", self.channel, self.chat_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_defaults_to_channel_and_chat() {
        let env = Envelope::new("telegram", "42", "hello");
        assert_eq!(env.session_key(), "telegram:42");
        assert_eq!(env.with_session("work").session_key(), "work");
    }

    #[test]
    fn validate_rejects_missing_fields() {
        assert_eq!(
            Envelope::new("", "1", "hi").validate(),
            Err(EnvelopeError::MissingField("channel"))
        );
        assert_eq!(
            Envelope::new("cli", " ", "hi").validate(),
            Err(EnvelopeError::MissingField("chat_id"))
        );
        assert_eq!(Envelope::new("cli", "1", "  ").validate(), Err(EnvelopeError::EmptyContent));
        assert!(Envelope::new("cli", "1", "hi").validate().is_ok());
    }

    #[test]
    fn deserializes_without_optional_fields() {
        let env: Envelope =
            serde_json::from_str(r#"{"channel":"cli","chat_id":"local","content":"$tape.info"}"#).unwrap();
        assert!(env.session_id.is_none());
        assert!(env.metadata.is_empty());
    }
}
