//! Error types for promoter-clients

use thiserror::Error;

/// Errors surfaced by the external system clients.
///
/// Transport failures and server-side (5xx / 429) responses are transient;
/// everything else is fatal and carries enough context to diagnose it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Network failure or request timeout before a response arrived
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-success HTTP response; the body is kept for diagnostics
    #[error("{method} {url} returned {status}: {body}")]
    Api {
        status: u16,
        method: String,
        url: String,
        body: String,
    },

    /// The addressed resource does not exist
    #[error("not found: {resource}")]
    NotFound { resource: String },

    /// The response body did not have the expected shape
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// Client is missing required configuration (URL, credentials)
    #[error("client not configured: {0}")]
    Config(String),
}

impl ClientError {
    /// Whether the caller may retry the same call.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Transport(_) => true,
            ClientError::Api { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Whether this is a "does not exist" outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound { .. })
            || matches!(self, ClientError::Api { status: 404, .. })
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ClientError::Decode(err.to_string())
        } else {
            ClientError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Decode(err.to_string())
    }
}
