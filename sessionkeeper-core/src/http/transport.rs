//! Network transport seam.
//!
//! [`Transport`] sends one prepared [`RequestDescriptor`] and reports either the
//! response (any status) or the absence of one. [`HttpTransport`] is the
//! reqwest-backed implementation used in production.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::{Client, ClientBuilder, StatusCode};
use thiserror::Error;
use tracing::debug;
use url::Url;

use super::request::RequestDescriptor;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request could not be built: {0}")]
    Build(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_builder() {
            Self::Build(err.to_string())
        } else {
            Self::Connect(err.to_string())
        }
    }
}

/// A received response. Non-success statuses are still responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: StatusCode,
    pub body: String,
}

impl RawResponse {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &RequestDescriptor) -> Result<RawResponse, TransportError>;
}

/// reqwest-backed transport rooted at a base URL.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: Url,
}

impl HttpTransport {
    /// Build a transport with a fixed timeout applied to every call.
    pub fn new(
        base_url: &str,
        timeout: Duration,
        user_agent: &str,
    ) -> Result<Self, TransportError> {
        let base_url = parse_base_url(base_url)?;
        let client = ClientBuilder::new()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve a descriptor path against the base URL.
    pub fn resolve(&self, path: &str) -> Result<Url, TransportError> {
        if path.starts_with("http://") || path.starts_with("https://") {
            return Url::parse(path).map_err(|e| TransportError::Build(e.to_string()));
        }
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| TransportError::Build(e.to_string()))
    }
}

/// Parse a base URL so that relative joins keep its path prefix.
fn parse_base_url(base_url: &str) -> Result<Url, TransportError> {
    let mut normalized = base_url.trim().to_string();
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    Url::parse(&normalized).map_err(|e| TransportError::Build(format!("invalid base URL: {e}")))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &RequestDescriptor) -> Result<RawResponse, TransportError> {
        let url = self.resolve(&request.path)?;
        debug!(method = %request.method, url = %url, "Sending request");

        let mut headers = request.headers.clone();
        if !headers.contains_key(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }

        let mut builder = self
            .client
            .request(request.method.clone(), url)
            .headers(headers);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        debug!(status = status.as_u16(), "Received response");

        Ok(RawResponse { status, body })
    }
}
