//! Built-in model backends.
//!
//! Network clients are out of scope; the runtime only needs something behind
//! the [`Provider`] trait. [`EchoProvider`] makes the CLI usable offline.
//! `ScriptedProvider` and the response builders for tool calls drive
//! deterministic loop tests; they are compiled for this crate's tests and
//! behind the `test-util` feature.

use async_trait::async_trait;
use std::sync::Arc;
use tapeloop_config::AppConfig;
use tapeloop_core::error::ProviderError;
use tapeloop_core::message::{Message, Role};
use tapeloop_core::provider::{Provider, ProviderRequest, ProviderResponse, Usage};

/// Model name that selects [`EchoProvider`].
pub const ECHO_MODEL: &str = "echo";

/// Pick the provider named by `config.model`.
pub fn provider_for(config: &AppConfig) -> Result<Arc<dyn Provider>, ProviderError> {
    match config.model.as_str() {
        ECHO_MODEL => Ok(Arc::new(EchoProvider)),
        other => Err(ProviderError::NotConfigured(format!(
            "no client for model '{other}'; the built-in model is '{ECHO_MODEL}'"
        ))),
    }
}

/// Replies with the latest user turn, verbatim.
///
/// Since user turns are what the router hands to the model, typing
/// `$tape.info` after `$ ` makes the echo run it as an assistant action.
pub struct EchoProvider;

#[async_trait]
impl Provider for EchoProvider {
    fn name(&self) -> &str {
        ECHO_MODEL
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let content = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(text_response(&content, ECHO_MODEL))
    }
}

/// A plain text completion.
pub fn text_response(text: &str, model: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant(text),
        usage: Some(Usage {
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
        }),
        model: model.into(),
    }
}

#[cfg(any(test, feature = "test-util"))]
pub use scripted::{ScriptedProvider, tool_call, tool_call_response};

#[cfg(any(test, feature = "test-util"))]
mod scripted {
    use super::text_response;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tapeloop_core::error::ProviderError;
    use tapeloop_core::message::{Message, MessageToolCall};
    use tapeloop_core::provider::{Provider, ProviderRequest, ProviderResponse};
    use tokio::sync::Mutex;

    /// Returns canned responses in order, repeating the last one once exhausted.
    /// Every request is kept for inspection.
    pub struct ScriptedProvider {
        responses: Vec<ProviderResponse>,
        cursor: AtomicUsize,
        requests: Mutex<Vec<ProviderRequest>>,
    }

    impl ScriptedProvider {
        pub fn new(responses: Vec<ProviderResponse>) -> Self {
            Self {
                responses,
                cursor: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            }
        }

        /// One text reply per entry.
        pub fn texts<S: AsRef<str>>(texts: &[S]) -> Self {
            Self::new(texts.iter().map(|t| text_response(t.as_ref(), "scripted")).collect())
        }

        pub fn call_count(&self) -> usize {
            self.cursor.load(Ordering::SeqCst)
        }

        pub async fn requests(&self) -> Vec<ProviderRequest> {
            self.requests.lock().await.clone()
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            self.requests.lock().await.push(request);
            let index = self.cursor.fetch_add(1, Ordering::SeqCst);
            self.responses
                .get(index)
                .or_else(|| self.responses.last())
                .cloned()
                .ok_or_else(|| ProviderError::NotConfigured("scripted provider has no responses".into()))
        }
    }

    /// A completion that requests native tool calls.
    pub fn tool_call_response(calls: Vec<MessageToolCall>) -> ProviderResponse {
        ProviderResponse {
            message: Message::assistant("").with_tool_calls(calls),
            usage: None,
            model: "scripted".into(),
        }
    }

    /// A single native tool call with JSON arguments.
    pub fn tool_call(id: &str, name: &str, arguments: serde_json::Value) -> MessageToolCall {
        MessageToolCall {
            id: id.into(),
            name: name.into(),
            arguments: arguments.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_repeats_last_user_turn() {
        let request = ProviderRequest::new(
            ECHO_MODEL,
            vec![
                Message::system("prompt"),
                Message::user("first"),
                Message::assistant("reply"),
                Message::user("second"),
            ],
        );
        let response = EchoProvider.complete(request).await.unwrap();
        assert_eq!(response.message.content, "second");
        assert!(response.message.tool_calls.is_empty());
    }

    #[tokio::test]
    async fn scripted_repeats_last_response() {
        let provider = ScriptedProvider::texts(&["a", "b"]);
        let mut seen = Vec::new();
        for _ in 0..3 {
            let r = provider.complete(ProviderRequest::new("m", vec![])).await.unwrap();
            seen.push(r.message.content);
        }
        assert_eq!(seen, vec!["a", "b", "b"]);
        assert_eq!(provider.call_count(), 3);
        assert_eq!(provider.requests().await.len(), 3);
    }

    #[tokio::test]
    async fn empty_script_is_an_error() {
        let provider = ScriptedProvider::new(vec![]);
        let err = provider.complete(ProviderRequest::new("m", vec![])).await.unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured(_)));
    }

    #[test]
    fn unknown_model_is_not_configured() {
        let mut config = AppConfig::default();
        assert!(provider_for(&config).is_ok());
        config.model = "gpt-x".into();
        assert!(matches!(provider_for(&config), Err(ProviderError::NotConfigured(_))));
    }
}
