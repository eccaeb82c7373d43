//! Client configuration for sessionkeeper.
//!
//! Configuration is persisted to the SQLite database as JSON and can be
//! overridden from the environment.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings key the configuration is stored under.
const SETTINGS_KEY: &str = "client_config";

/// Environment variable overriding the API base URL.
pub const ENV_BASE_URL: &str = "SESSIONKEEPER_API_BASE_URL";

/// Environment variable overriding the request timeout (seconds).
pub const ENV_TIMEOUT_SECS: &str = "SESSIONKEEPER_API_TIMEOUT_SECS";

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_REFRESH_PATH: &str = "/v1/auth/refresh-token";
pub const DEFAULT_LOGIN_ROUTE: &str = "/login";

/// Error code the server uses for an expired access token.
pub const EXPIRED_TOKEN_CODE: &str = "A004";

/// Client configuration - persisted to database as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL every request path is resolved against.
    pub base_url: String,

    /// Upper bound for every outbound call, refresh included.
    pub timeout_secs: u64,

    /// Path of the token refresh endpoint.
    pub refresh_path: String,

    /// Route handed to the session listener when a session ends.
    pub login_route: String,

    /// Error codes meaning "access token expired".
    pub expiry_error_codes: Vec<String>,

    /// Text fallback for servers that only signal expiry in the message.
    /// `None` disables the fallback.
    pub expiry_message_marker: Option<String>,

    /// User agent sent with every request.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            login_route: DEFAULT_LOGIN_ROUTE.to_string(),
            expiry_error_codes: vec![EXPIRED_TOKEN_CODE.to_string()],
            expiry_message_marker: Some("expired".to_string()),
            user_agent: format!("sessionkeeper/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ClientConfig {
    /// Load configuration from database, using defaults for missing values.
    ///
    /// If the configuration doesn't exist or can't be parsed, returns defaults.
    pub fn load(db: &crate::db::Database) -> Self {
        let mut config = Self::default();

        if let Ok(Some(json)) = db.get_setting(SETTINGS_KEY) {
            match serde_json::from_str::<ClientConfig>(&json) {
                Ok(loaded) => config = loaded,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to parse client config, using defaults");
                }
            }
        }

        config
    }

    /// Save configuration to database.
    pub fn save(&self, db: &crate::db::Database) -> anyhow::Result<()> {
        let json = serde_json::to_string(self)?;
        db.set_setting(SETTINGS_KEY, &json)?;
        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(base_url) = lookup(ENV_BASE_URL).filter(|v| !v.trim().is_empty()) {
            self.base_url = base_url.trim().to_string();
        }

        if let Some(raw) = lookup(ENV_TIMEOUT_SECS) {
            match raw.trim().parse::<u64>() {
                Ok(secs) => self.timeout_secs = secs,
                Err(e) => {
                    tracing::warn!(value = %raw, error = %e, "Ignoring invalid timeout override");
                }
            }
        }
    }

    /// Validate and clamp settings to valid ranges.
    pub fn validate(&mut self) {
        self.timeout_secs = self.timeout_secs.clamp(1, 300);

        if self.base_url.trim().is_empty() {
            self.base_url = DEFAULT_BASE_URL.to_string();
        }

        if !self.refresh_path.starts_with('/') && !self.refresh_path.starts_with("http") {
            self.refresh_path = format!("/{}", self.refresh_path);
        }

        if self.login_route.is_empty() {
            self.login_route = DEFAULT_LOGIN_ROUTE.to_string();
        }

        self.expiry_error_codes.retain(|c| !c.trim().is_empty());
    }

    /// The request timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// =============================================================================
// Tests
// =============================================================================
