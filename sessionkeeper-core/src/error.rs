//! Client error taxonomy.
//!
//! Every failure a caller can observe is normalized into [`ClientError`], which
//! always carries a human-readable message. The type is `Clone` so a single
//! refresh failure can be handed to every request queued behind it.

use thiserror::Error;

use crate::auth::CredentialStoreError;
use crate::http::TransportError;

/// Fallback message when the server sends an error without a message.
pub const SERVER_ERROR_MESSAGE: &str = "A server error occurred.";

/// Fallback message when no response was received.
pub const NETWORK_ERROR_MESSAGE: &str =
    "Unable to reach the server. Check your network connection.";

/// Fallback message when the request could not be built or sent at all.
pub const REQUEST_ERROR_MESSAGE: &str = "An error occurred while preparing the request.";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// The server rejected the credentials and the failure could not be recovered.
    #[error("{message}")]
    Unauthorized {
        code: Option<String>,
        message: String,
    },

    /// The server answered with a non-success status (or `success: false`).
    #[error("{message}")]
    Server {
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// No response was received (connection failure or timeout).
    #[error("{0}")]
    Network(String),

    /// The token refresh call itself failed; the session has been terminated.
    #[error("Token refresh failed: {0}")]
    RefreshFailed(Box<ClientError>),

    /// The response body could not be decoded.
    #[error("Invalid response: {0}")]
    Decode(String),

    /// The credential store could not be read or written.
    #[error("Credential storage error: {0}")]
    Storage(String),

    /// The request could not be constructed.
    #[error("{0}")]
    Request(String),

    /// Invalid client configuration.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// A request queued behind a refresh was abandoned before it could be replayed.
    #[error("Request was cancelled before the token refresh completed")]
    Cancelled,
}

impl ClientError {
    /// Whether this is an authorization failure that ended the session.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Unauthorized { .. } | Self::RefreshFailed(_))
    }

    /// Whether the server could not be reached.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// The failure that made the token refresh fail.
    pub fn refresh_cause(&self) -> Option<&ClientError> {
        match self {
            Self::RefreshFailed(cause) => Some(cause),
            _ => None,
        }
    }

    /// Server-provided error code, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Unauthorized { code, .. } | Self::Server { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Build(_) => Self::Request(REQUEST_ERROR_MESSAGE.to_string()),
            TransportError::Timeout | TransportError::Connect(_) => {
                Self::Network(NETWORK_ERROR_MESSAGE.to_string())
            }
        }
    }
}

impl From<CredentialStoreError> for ClientError {
    fn from(err: CredentialStoreError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}
