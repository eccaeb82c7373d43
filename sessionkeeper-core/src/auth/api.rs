//! Credential lifecycle calls: login, logout, registration and email verification.
//!
//! These sit on top of [`ApiClient`]. Login, registration and the verification
//! endpoints are public, so their 401s are surfaced as-is and never trigger a
//! refresh.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};
use url::form_urlencoded;

use crate::error::ClientError;
use crate::http::{ApiClient, RequestDescriptor};

use super::device::ensure_device_id;
use super::storage::{CredentialKey, CredentialStore};
use super::types::{
    EmailVerificationResponse, LoginRequest, RegisterRequest, TokenResponse, UserInfo,
};

const EMAIL_CHECK_PATH: &str = "/v1/auth/verification/email/check";
const SEND_CODE_PATH: &str = "/v1/auth/verification/email/send-code";
const VERIFY_CODE_PATH: &str = "/v1/auth/verification/email/verify-code";
const REGISTER_PATH: &str = "/v1/auth/register";
const LOGIN_PATH: &str = "/v1/auth/login";
const LOGOUT_PATH: &str = "/v1/auth/logout";
const LOGOUT_ALL_PATH: &str = "/v1/auth/logout-all";

#[derive(Clone, Debug)]
pub struct AuthApi {
    client: ApiClient,
}

impl AuthApi {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    fn store(&self) -> &Arc<dyn CredentialStore> {
        self.client.store()
    }

    /// Whether `email` is still free to register.
    pub async fn check_email_availability(&self, email: &str) -> Result<bool, ClientError> {
        let query: String = form_urlencoded::Serializer::new(String::new())
            .append_pair("email", email)
            .finish();
        let request =
            RequestDescriptor::get(format!("{EMAIL_CHECK_PATH}?{query}")).skip_auth_recovery();
        self.client.send_json(request).await
    }

    pub async fn send_verification_code(&self, email: &str) -> Result<(), ClientError> {
        let request = RequestDescriptor::post(SEND_CODE_PATH)
            .json(&json!({ "email": email }))?
            .skip_auth_recovery();
        self.client.send_json(request).await
    }

    pub async fn verify_email_code(
        &self,
        email: &str,
        verification_code: &str,
    ) -> Result<EmailVerificationResponse, ClientError> {
        let request = RequestDescriptor::post(VERIFY_CODE_PATH)
            .json(&json!({ "email": email, "verificationCode": verification_code }))?
            .skip_auth_recovery();
        self.client.send_json(request).await
    }

    /// Create an account. Returns the new user id.
    pub async fn register(&self, registration: &RegisterRequest) -> Result<i64, ClientError> {
        let request = RequestDescriptor::post(REGISTER_PATH)
            .json(registration)?
            .skip_auth_recovery();
        let user_id: i64 = self.client.send_json(request).await?;
        info!(user_id, email = %registration.email, "Account registered");
        Ok(user_id)
    }

    /// Sign in and persist the issued credentials.
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        fcm_token: Option<&str>,
    ) -> Result<TokenResponse, ClientError> {
        let device_id = ensure_device_id(self.store().as_ref()).await?;

        let request = RequestDescriptor::post(LOGIN_PATH)
            .json(&LoginRequest {
                email,
                password,
                device_id: &device_id,
                fcm_token,
            })?
            .skip_auth_recovery();
        let tokens: TokenResponse = self.client.send_json(request).await?;

        self.save_tokens(&tokens).await?;
        info!(email = %email, device_id = %device_id, "Logged in");
        Ok(tokens)
    }

    async fn save_tokens(&self, tokens: &TokenResponse) -> Result<(), ClientError> {
        let store = self.store();
        store
            .set(CredentialKey::AccessToken, &tokens.access_token)
            .await?;
        store
            .set(CredentialKey::RefreshToken, &tokens.refresh_token)
            .await?;
        match &tokens.user_info {
            Some(user) => {
                store
                    .set(CredentialKey::UserInfo, &serde_json::to_string(user)?)
                    .await?
            }
            None => store.delete(CredentialKey::UserInfo).await?,
        }
        Ok(())
    }

    /// End the session on this device.
    ///
    /// With `call_api` the server is told first; a failing call is logged and the
    /// local session is cleared regardless.
    pub async fn logout(&self, call_api: bool) -> Result<(), ClientError> {
        if call_api {
            let device_id = self.store().get(CredentialKey::DeviceId).await?;
            let request =
                RequestDescriptor::post(LOGOUT_PATH).json(&json!({ "deviceId": device_id }))?;
            if let Err(e) = self.client.send(request).await {
                warn!(error = %e, "Logout call failed, clearing local session anyway");
                if e.is_auth_failure() {
                    // The session was already terminated while handling the failure.
                    return Ok(());
                }
            }
        }

        self.client.terminator().terminate().await;
        Ok(())
    }

    /// Revoke every session of the user, then end the local one.
    pub async fn logout_all(&self) -> Result<(), ClientError> {
        if let Err(e) = self.client.send(RequestDescriptor::post(LOGOUT_ALL_PATH)).await {
            warn!(error = %e, "Logout-all call failed");
            return Err(e);
        }

        info!("Logged out of all devices");
        self.client.terminator().terminate().await;
        Ok(())
    }

    /// Whether both tokens are stored.
    pub async fn is_authenticated(&self) -> Result<bool, ClientError> {
        let access = self.store().get(CredentialKey::AccessToken).await?;
        let refresh = self.store().get(CredentialKey::RefreshToken).await?;
        Ok(access.is_some_and(|t| !t.is_empty()) && refresh.is_some_and(|t| !t.is_empty()))
    }

    /// Restore the signed-in user from storage.
    ///
    /// Returns `None` when there is no complete session. A cached profile that
    /// can no longer be read ends the session.
    pub async fn current_user(&self) -> Result<Option<UserInfo>, ClientError> {
        if !self.is_authenticated().await? {
            return Ok(None);
        }

        let Some(raw) = self.store().get(CredentialKey::UserInfo).await? else {
            return Ok(None);
        };

        match serde_json::from_str::<UserInfo>(&raw) {
            Ok(user) => Ok(Some(user)),
            Err(e) => {
                warn!(error = %e, "Stored user info is unreadable, ending session");
                self.client.terminator().terminate().await;
                Ok(None)
            }
        }
    }
}
