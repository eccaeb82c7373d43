//! Session termination.

use std::sync::Arc;

use tracing::{info, warn};

use super::storage::{CredentialKey, CredentialStore};

/// Receives the signal that the user has to authenticate again.
pub trait SessionListener: Send + Sync {
    /// Called once per termination with the route the application should show next.
    fn session_ended(&self, redirect_to: &str);
}

impl<F> SessionListener for F
where
    F: Fn(&str) + Send + Sync,
{
    fn session_ended(&self, redirect_to: &str) {
        self(redirect_to)
    }
}

/// Listener that only logs; used when the application doesn't register one.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSessionListener;

impl SessionListener for LoggingSessionListener {
    fn session_ended(&self, redirect_to: &str) {
        info!(redirect_to = %redirect_to, "Session ended, re-authentication required");
    }
}

/// Clears session credentials and notifies the application.
#[derive(Clone)]
pub struct SessionTerminator {
    store: Arc<dyn CredentialStore>,
    listener: Arc<dyn SessionListener>,
    login_route: String,
}

impl SessionTerminator {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        listener: Arc<dyn SessionListener>,
        login_route: impl Into<String>,
    ) -> Self {
        Self {
            store,
            listener,
            login_route: login_route.into(),
        }
    }

    /// Route passed to the listener.
    pub fn login_route(&self) -> &str {
        &self.login_route
    }

    /// Delete the session credentials and signal the listener.
    ///
    /// Store failures are logged and don't stop the remaining deletes or the
    /// notification. The device id is left untouched.
    pub async fn terminate(&self) {
        for key in CredentialKey::session_keys() {
            if let Err(e) = self.store.delete(*key).await {
                warn!(
                    key = %key,
                    error = %e,
                    "Failed to clear credential during session termination"
                );
            }
        }

        info!(redirect_to = %self.login_route, "Session terminated");
        self.listener.session_ended(&self.login_route);
    }
}

impl std::fmt::Debug for SessionTerminator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTerminator")
            .field("login_route", &self.login_route)
            .finish_non_exhaustive()
    }
}
