//! Authentication module.
//!
//! This module provides:
//! - Credential storage (in-memory and SQLite)
//! - Device identity provisioning
//! - Session termination and the session-ended listener
//! - Login / logout / registration calls

pub mod api;
pub mod device;
pub mod session;
pub mod storage;
pub mod types;

pub use api::AuthApi;
pub use device::{ensure_device_id, generate_device_id};
pub use session::{LoggingSessionListener, SessionListener, SessionTerminator};
pub use storage::{
    CredentialKey, CredentialStore, CredentialStoreError, MemoryCredentialStore,
    SqliteCredentialStore,
};
pub use types::{
    CredentialPair, EmailVerificationResponse, LoginRequest, RefreshRequest, RegisterRequest,
    TokenResponse, UserInfo,
};
