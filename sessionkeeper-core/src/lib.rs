//! Sessionkeeper Core Library
//!
//! An authenticated API client that keeps a user's session alive. It includes:
//!
//! - Bearer-token injection for every outbound request
//! - Coordinated refresh of expired access tokens (one refresh in flight,
//!   concurrent failures queued and replayed)
//! - Session termination when credentials can no longer be recovered
//! - Credential storage (SQLite or in-memory) and device identity
//! - Login / logout / registration calls
//! - Configuration management persisted in SQLite

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod http;

// Re-exports for convenience
pub use config::ClientConfig;
pub use db::Database;
pub use error::ClientError;

// Re-export auth
pub use auth::{
    AuthApi, CredentialKey, CredentialStore, CredentialStoreError, LoggingSessionListener,
    MemoryCredentialStore, SessionListener, SessionTerminator, SqliteCredentialStore,
    TokenResponse, UserInfo,
};

// Re-export HTTP client
pub use http::{
    ApiClient, ApiClientBuilder, HttpTransport, RawResponse, RefreshCoordinator, RefreshPhase,
    RequestDescriptor, Transport, TransportError,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
