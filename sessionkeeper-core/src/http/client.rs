//! The application-facing API client.

use std::sync::Arc;

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::auth::{CredentialStore, LoggingSessionListener, SessionListener, SessionTerminator};
use crate::config::ClientConfig;
use crate::error::ClientError;

use super::classify::FailureClassifier;
use super::coordinator::RefreshCoordinator;
use super::envelope::unwrap_data;
use super::request::RequestDescriptor;
use super::transport::{HttpTransport, RawResponse, Transport};

/// Authenticated API client.
///
/// Every request carries the stored access token and transparently survives
/// token expiry. Clones share credentials and refresh state.
#[derive(Clone)]
pub struct ApiClient {
    coordinator: RefreshCoordinator,
    store: Arc<dyn CredentialStore>,
}

impl ApiClient {
    /// Create a new client builder
    pub fn builder() -> ApiClientBuilder {
        ApiClientBuilder::default()
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    pub fn terminator(&self) -> &SessionTerminator {
        self.coordinator.terminator()
    }

    /// Send a prepared request and return the raw successful response.
    pub async fn send(&self, request: RequestDescriptor) -> Result<RawResponse, ClientError> {
        self.coordinator.execute(request).await
    }

    /// Send a prepared request and decode the envelope's `data`.
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestDescriptor,
    ) -> Result<T, ClientError> {
        let response = self.send(request).await?;
        unwrap_data(&response)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        self.send_json(RequestDescriptor::get(path)).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        self.send_json(RequestDescriptor::delete(path)).await
    }

    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, ClientError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.with_body(Method::POST, path, body).await
    }

    pub async fn put<B, T>(&self, path: &str, body: &B) -> Result<T, ClientError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.with_body(Method::PUT, path, body).await
    }

    pub async fn patch<B, T>(&self, path: &str, body: &B) -> Result<T, ClientError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.with_body(Method::PATCH, path, body).await
    }

    async fn with_body<B, T>(&self, method: Method, path: &str, body: &B) -> Result<T, ClientError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = RequestDescriptor::new(method, path).json(body)?;
        self.send_json(request).await
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ApiClient`]
#[derive(Default)]
pub struct ApiClientBuilder {
    config: Option<ClientConfig>,
    store: Option<Arc<dyn CredentialStore>>,
    listener: Option<Arc<dyn SessionListener>>,
    transport: Option<Arc<dyn Transport>>,
}

impl ApiClientBuilder {
    /// Use this configuration instead of the defaults
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the credential store (required)
    pub fn store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the listener notified when the session ends
    pub fn listener(mut self, listener: Arc<dyn SessionListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Replace the HTTP transport
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Build the client
    pub fn build(self) -> Result<ApiClient, ClientError> {
        let store = self
            .store
            .ok_or_else(|| ClientError::Configuration("credential store is required".into()))?;

        let mut config = self.config.unwrap_or_default();
        config.validate();

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(
                HttpTransport::new(&config.base_url, config.timeout(), &config.user_agent)
                    .map_err(|e| ClientError::Configuration(e.to_string()))?,
            ),
        };

        let listener: Arc<dyn SessionListener> = match self.listener {
            Some(listener) => listener,
            None => Arc::new(LoggingSessionListener),
        };
        let terminator =
            SessionTerminator::new(Arc::clone(&store), listener, config.login_route.clone());

        let coordinator = RefreshCoordinator::new(
            transport,
            Arc::clone(&store),
            FailureClassifier::from_config(&config),
            terminator,
            config.refresh_path.clone(),
        );

        Ok(ApiClient { coordinator, store })
    }
}
