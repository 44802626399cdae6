//! Error types for the mail forwarder.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the IMAP side.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Failed to connect to {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("Authentication failed for {user}: {reason}")]
    Auth { user: String, reason: String },

    #[error("Unexpected server response: {0}")]
    Protocol(String),

    #[error("Not connected")]
    NotConnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MailboxError {
    /// Bad credentials, as opposed to a network or protocol failure.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }
}

/// The whole message could not be decoded.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Malformed message: {0}")]
    Malformed(String),
}

/// Failure of the optional rewrite step. Never fatal.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("LLM call failed: {0}")]
    Llm(#[from] LlmError),

    #[error("LLM call timed out after {0:?}")]
    Timeout(Duration),

    #[error("LLM returned an empty response")]
    EmptyResponse,
}

/// Errors from the SMTP side.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Failed to connect to {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("SMTP authentication failed: {reason}")]
    Auth { reason: String },

    #[error("SMTP send failed: {reason}")]
    Send { reason: String },

    #[error("Failed to build message: {0}")]
    Build(String),
}

impl RelayError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mailbox_auth_is_distinguished() {
        let auth = MailboxError::Auth {
            user: "bot@example.com".into(),
            reason: "LOGIN rejected".into(),
        };
        let net = MailboxError::Connect {
            host: "imap.example.com".into(),
            reason: "refused".into(),
        };
        assert!(auth.is_auth());
        assert!(!net.is_auth());
    }

    #[test]
    fn transform_error_wraps_llm_error() {
        let err: TransformError = LlmError::AuthFailed {
            provider: "openai".into(),
        }
        .into();
        assert!(err.to_string().contains("openai"));
    }
}
