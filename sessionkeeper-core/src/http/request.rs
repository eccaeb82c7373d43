//! Outbound request descriptors and the bearer-token interceptor.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::Method;
use serde::Serialize;

use crate::auth::{CredentialKey, CredentialStore};
use crate::error::ClientError;

/// Everything needed to (re)send a request.
///
/// Descriptors are plain data so the coordinator can hold on to them while a
/// refresh is pending and replay them afterwards.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: Method,
    /// Path relative to the client base URL, or an absolute URL.
    pub path: String,
    pub headers: HeaderMap,
    pub body: Option<serde_json::Value>,
    retried: bool,
    skip_auth_recovery: bool,
    sent_token: Option<String>,
    cycle_epoch: u64,
}

impl RequestDescriptor {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
            retried: false,
            skip_auth_recovery: false,
            sent_token: None,
            cycle_epoch: 0,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Attach a JSON body.
    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self, ClientError> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }

    /// Set an extra header.
    pub fn header(mut self, name: &str, value: &str) -> Result<Self, ClientError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ClientError::Request(format!("invalid header name {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ClientError::Request(format!("invalid header value: {e}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Mark the request as a public endpoint: a 401 is returned as-is, without
    /// refresh or session termination.
    pub fn skip_auth_recovery(mut self) -> Self {
        self.skip_auth_recovery = true;
        self
    }

    pub fn is_auth_recovery_skipped(&self) -> bool {
        self.skip_auth_recovery
    }

    /// Whether the single allowed retry has been used.
    pub fn is_retried(&self) -> bool {
        self.retried
    }

    /// Consume the single allowed retry.
    pub fn mark_retried(&mut self) {
        self.retried = true;
    }

    /// Access token this request was last sent with, if any.
    pub fn sent_token(&self) -> Option<&str> {
        self.sent_token.as_deref()
    }

    /// Set `Authorization: Bearer <token>` and remember the token.
    pub fn with_bearer(mut self, token: &str) -> Result<Self, ClientError> {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| ClientError::Request(format!("invalid access token: {e}")))?;
        self.headers.insert(AUTHORIZATION, value);
        self.sent_token = Some(token.to_string());
        Ok(self)
    }

    /// Refresh cycles the coordinator had completed when this request was sent.
    pub(crate) fn cycle_epoch(&self) -> u64 {
        self.cycle_epoch
    }

    pub(crate) fn set_cycle_epoch(&mut self, epoch: u64) {
        self.cycle_epoch = epoch;
    }
}

/// Attaches the stored access token to outbound requests.
#[derive(Clone)]
pub struct RequestInterceptor {
    store: std::sync::Arc<dyn CredentialStore>,
}

impl RequestInterceptor {
    pub fn new(store: std::sync::Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    /// Return the request with the current access token attached.
    ///
    /// Without a stored token the request is returned unmodified.
    pub async fn intercept(
        &self,
        request: RequestDescriptor,
    ) -> Result<RequestDescriptor, ClientError> {
        match self.store.get(CredentialKey::AccessToken).await? {
            Some(token) if !token.is_empty() => request.with_bearer(&token),
            _ => Ok(request),
        }
    }
}
