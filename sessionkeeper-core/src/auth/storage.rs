//! Credential storage.
//!
//! The core only ever talks to a [`CredentialStore`]: an async get/set/delete
//! interface over four well-known keys. Two implementations ship with the crate,
//! an in-memory map and a SQLite-backed store that survives restarts.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;

use crate::db::Database;

#[derive(Debug, Error)]
pub enum CredentialStoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Credential store lock poisoned")]
    Poisoned,
}

impl<T> From<PoisonError<T>> for CredentialStoreError {
    fn from(_: PoisonError<T>) -> Self {
        Self::Poisoned
    }
}

/// Keys understood by a credential store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKey {
    AccessToken,
    RefreshToken,
    UserInfo,
    DeviceId,
}

impl CredentialKey {
    /// Storage name of the key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AccessToken => "accessToken",
            Self::RefreshToken => "refreshToken",
            Self::UserInfo => "userInfo",
            Self::DeviceId => "deviceId",
        }
    }

    /// Keys removed when a session ends. The device id survives.
    pub fn session_keys() -> &'static [CredentialKey] {
        &[Self::AccessToken, Self::RefreshToken, Self::UserInfo]
    }
}

impl std::fmt::Display for CredentialKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable key-value access to the current credentials.
///
/// Every call is a suspension point; implementations must not assume they are
/// called from a single task.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, key: CredentialKey) -> Result<Option<String>, CredentialStoreError>;

    async fn set(&self, key: CredentialKey, value: &str) -> Result<(), CredentialStoreError>;

    async fn delete(&self, key: CredentialKey) -> Result<(), CredentialStoreError>;
}

// =============================================================================
// In-memory store
// =============================================================================

/// Process-local credential store, mostly useful for tests and short-lived tools.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    values: Mutex<HashMap<CredentialKey, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with the given entries.
    pub fn with_entries<I, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (CredentialKey, V)>,
        V: Into<String>,
    {
        let values = entries.into_iter().map(|(k, v)| (k, v.into())).collect();
        Self {
            values: Mutex::new(values),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, key: CredentialKey) -> Result<Option<String>, CredentialStoreError> {
        Ok(self.values.lock()?.get(&key).cloned())
    }

    async fn set(&self, key: CredentialKey, value: &str) -> Result<(), CredentialStoreError> {
        self.values.lock()?.insert(key, value.to_string());
        Ok(())
    }

    async fn delete(&self, key: CredentialKey) -> Result<(), CredentialStoreError> {
        self.values.lock()?.remove(&key);
        Ok(())
    }
}

// =============================================================================
// SQLite store
// =============================================================================

/// Credential store persisted in the `credentials` table.
pub struct SqliteCredentialStore {
    db: Mutex<Database>,
}

impl SqliteCredentialStore {
    /// Wrap an already-migrated database.
    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    /// Open (and migrate) the database at the default location.
    pub fn open_default() -> anyhow::Result<Self> {
        let db = Database::open()?;
        db.migrate()?;
        Ok(Self::new(db))
    }

    /// When `key` was last written.
    pub fn updated_at(
        &self,
        key: CredentialKey,
    ) -> Result<Option<chrono::DateTime<chrono::Utc>>, CredentialStoreError> {
        let db = self.db.lock()?;
        Ok(db.credential_updated_at(key.as_str())?)
    }
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn get(&self, key: CredentialKey) -> Result<Option<String>, CredentialStoreError> {
        let db = self.db.lock()?;
        Ok(db.get_credential(key.as_str())?)
    }

    async fn set(&self, key: CredentialKey, value: &str) -> Result<(), CredentialStoreError> {
        let db = self.db.lock()?;
        db.set_credential(key.as_str(), value)?;
        tracing::debug!(key = %key, "Credential stored");
        Ok(())
    }

    async fn delete(&self, key: CredentialKey) -> Result<(), CredentialStoreError> {
        let db = self.db.lock()?;
        db.delete_credential(key.as_str())?;
        tracing::debug!(key = %key, "Credential deleted");
        Ok(())
    }
}
