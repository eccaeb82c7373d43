//! Failure classification.

use reqwest::StatusCode;

use crate::config::ClientConfig;
use crate::error::ClientError;

use super::envelope::{error_body, error_message};
use super::request::RequestDescriptor;
use super::transport::{RawResponse, TransportError};

/// What a failed request means for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Expired access token on a request that may still be retried.
    RecoverableByRefresh,
    /// Authorization failure that no refresh will fix.
    TerminalAuth,
    /// Any other non-success response.
    Other,
    /// No response at all.
    NetworkUnreachable,
}

/// Decides whether a failure is eligible for token refresh.
#[derive(Debug, Clone)]
pub struct FailureClassifier {
    expiry_codes: Vec<String>,
    expiry_marker: Option<String>,
}

impl FailureClassifier {
    /// `expiry_marker` enables the message-text fallback; `None` turns it off.
    pub fn new(expiry_codes: Vec<String>, expiry_marker: Option<String>) -> Self {
        Self {
            expiry_codes,
            expiry_marker: expiry_marker
                .filter(|m| !m.is_empty())
                .map(|m| m.to_lowercase()),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            config.expiry_error_codes.clone(),
            config.expiry_message_marker.clone(),
        )
    }

    /// Classify the outcome of sending `request`.
    ///
    /// `outcome` must be a failure: either a transport error or a non-success response.
    pub fn classify(
        &self,
        request: &RequestDescriptor,
        outcome: Result<&RawResponse, &TransportError>,
    ) -> FailureClass {
        let response = match outcome {
            Ok(response) => response,
            Err(_) => return FailureClass::NetworkUnreachable,
        };

        if response.status != StatusCode::UNAUTHORIZED {
            return FailureClass::Other;
        }

        if request.is_retried() || request.is_auth_recovery_skipped() {
            return FailureClass::TerminalAuth;
        }

        if self.signals_expiry(&response.body) {
            FailureClass::RecoverableByRefresh
        } else {
            FailureClass::TerminalAuth
        }
    }

    /// Whether an error body reports an expired access token.
    pub fn signals_expiry(&self, body: &str) -> bool {
        let Some(error) = error_body(body) else {
            return false;
        };

        if let Some(code) = &error.code {
            if self.expiry_codes.iter().any(|c| c == code) {
                return true;
            }
        }

        // Unversioned servers only report expiry in the message text.
        match (&self.expiry_marker, &error.message) {
            (Some(marker), Some(message)) => message.to_lowercase().contains(marker.as_str()),
            _ => false,
        }
    }
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

/// Build the caller-facing error for a classified failure.
pub fn normalize_failure(outcome: Result<&RawResponse, &TransportError>) -> ClientError {
    match outcome {
        Err(err) => err.clone().into(),
        Ok(response) => {
            let code = error_body(&response.body).and_then(|e| e.code);
            let message = error_message(&response.body);
            if response.status == StatusCode::UNAUTHORIZED {
                ClientError::Unauthorized { code, message }
            } else {
                ClientError::Server {
                    status: response.status.as_u16(),
                    code,
                    message,
                }
            }
        }
    }
}
