//! Error types for the tapeloop domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all tapeloop operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Tape errors ---
    #[error("Tape error: {0}")]
    Tape(#[from] TapeError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Boundary validation ---
    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("model_timeout: no response within {0}s")]
    Timeout(u64),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Error)]
pub enum TapeError {
    #[error("I/O error on tape {tape}: {source}")]
    Io {
        tape: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode tape entry: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Tape not found: {0}")]
    TapeNotFound(String),

    #[error("No fork recorded for tape {0} (already merged or never forked)")]
    ForkNotFound(String),

    #[error("Invalid tape entry: {0}")]
    InvalidEntry(String),
}

impl TapeError {
    pub fn io(tape: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            tape: tape.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("{reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("{tool_name} timed out after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Permission denied: {tool_name}: {reason}")]
    PermissionDenied { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error(transparent)]
    Tape(#[from] TapeError),
}

impl ToolError {
    pub fn failed(tool_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            tool_name: tool_name.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("envelope field `{0}` is required")]
    MissingField(&'static str),

    #[error("envelope content is empty")]
    EmptyContent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_displays_correctly() {
        let err = Error::Provider(ProviderError::ApiError {
            status_code: 429,
            message: "Too many requests".into(),
        });
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("Too many requests"));
    }

    #[test]
    fn timeout_uses_model_timeout_prefix() {
        let err = ProviderError::Timeout(30);
        assert_eq!(err.to_string(), "model_timeout: no response within 30s");
    }

    #[test]
    fn tool_error_displays_reason_only() {
        let err = ToolError::failed("bash", "exit status 2");
        assert_eq!(err.to_string(), "exit status 2");
    }

    #[test]
    fn tape_error_converts_into_top_level() {
        let err: Error = TapeError::ForkNotFound("main__abcd1234".into()).into();
        assert!(err.to_string().contains("main__abcd1234"));
    }
}
