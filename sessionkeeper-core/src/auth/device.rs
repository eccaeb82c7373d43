//! Per-installation device identity.

use tracing::info;
use uuid::Uuid;

use super::storage::{CredentialKey, CredentialStore, CredentialStoreError};

/// Generate a fresh device identifier.
pub fn generate_device_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Return the stored device id, generating and persisting one on first use.
///
/// The id is never rotated here; session termination leaves it in place.
pub async fn ensure_device_id(store: &dyn CredentialStore) -> Result<String, CredentialStoreError> {
    if let Some(existing) = store.get(CredentialKey::DeviceId).await? {
        if !existing.is_empty() {
            return Ok(existing);
        }
    }

    let device_id = generate_device_id();
    store.set(CredentialKey::DeviceId, &device_id).await?;
    info!(device_id = %device_id, "Generated new device id");
    Ok(device_id)
}
