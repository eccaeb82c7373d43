//! HTTP layer: request descriptors, transport, failure classification and the
//! token refresh coordinator.

mod classify;
mod client;
mod coordinator;
mod envelope;
mod request;
mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use classify::{normalize_failure, FailureClass, FailureClassifier};
pub use client::{ApiClient, ApiClientBuilder};
pub use coordinator::{RefreshCoordinator, RefreshPhase};
pub use envelope::{error_body, error_message, unwrap_data, ApiEnvelope, ApiErrorBody};
pub use request::{RequestDescriptor, RequestInterceptor};
pub use transport::{HttpTransport, RawResponse, Transport, TransportError};
