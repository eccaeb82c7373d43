//! In-process test doubles for the HTTP layer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::sync::Notify;

use crate::auth::SessionListener;
use crate::config::DEFAULT_REFRESH_PATH;

use super::request::RequestDescriptor;
use super::transport::{RawResponse, Transport, TransportError};

/// How the fake refresh endpoint answers.
#[derive(Debug, Clone)]
pub enum RefreshBehavior {
    Succeed { access: String, refresh: String },
    NetworkError,
    Reject,
}

fn failure(status: StatusCode, code: &str, message: &str) -> RawResponse {
    RawResponse::new(
        status,
        json!({"success": false, "data": null, "error": {"code": code, "message": message}})
            .to_string(),
    )
}

/// A fake API server.
///
/// Business endpoints accept exactly one access token and answer
/// `{"data": {"token": ..., "path": ...}}`. Any other bearer token is reported
/// as expired (`A004`), a missing one as `A001`. `/v1/fail` always answers 500.
pub struct FakeServer {
    valid_token: String,
    refresh: RefreshBehavior,
    refresh_yields: usize,
    gate: Option<Notify>,
    never_accepting: bool,
    rejection: Mutex<Option<(String, String)>>,
    refresh_calls: AtomicUsize,
    business_calls: AtomicUsize,
    business_log: Mutex<Vec<(String, Option<String>)>>,
    refresh_bodies: Mutex<Vec<Value>>,
}

impl FakeServer {
    /// Accept `access`; the refresh endpoint rotates to (`access`, `refresh`).
    pub fn rotating_to(access: &str, refresh: &str) -> Self {
        Self {
            valid_token: access.to_string(),
            refresh: RefreshBehavior::Succeed {
                access: access.to_string(),
                refresh: refresh.to_string(),
            },
            refresh_yields: 0,
            gate: None,
            never_accepting: false,
            rejection: Mutex::new(None),
            refresh_calls: AtomicUsize::new(0),
            business_calls: AtomicUsize::new(0),
            business_log: Mutex::new(Vec::new()),
            refresh_bodies: Mutex::new(Vec::new()),
        }
    }

    pub fn accepting(access: &str) -> Self {
        Self::rotating_to(access, "R-next")
    }

    pub fn with_refresh(mut self, behavior: RefreshBehavior) -> Self {
        self.refresh = behavior;
        self
    }

    /// Suspend the refresh call this many times before answering.
    pub fn with_refresh_yields(mut self, yields: usize) -> Self {
        self.refresh_yields = yields;
        self
    }

    /// Hold the refresh call until [`FakeServer::open_gate`].
    pub fn gated(mut self) -> Self {
        self.gate = Some(Notify::new());
        self
    }

    /// Report every business call as expired, whatever the token.
    pub fn never_accepting(mut self) -> Self {
        self.never_accepting = true;
        self
    }

    /// Answer every business call with a 401 carrying `code`.
    pub fn reject_with_code(&self, code: &str, message: &str) {
        *self.rejection.lock().unwrap() = Some((code.to_string(), message.to_string()));
    }

    pub fn open_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.notify_one();
        }
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn business_calls(&self) -> usize {
        self.business_calls.load(Ordering::SeqCst)
    }

    /// Paths of the business calls that carried `token`, in arrival order.
    pub fn paths_sent_with(&self, token: &str) -> Vec<String> {
        self.business_log
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, sent)| sent.as_deref() == Some(token))
            .map(|(path, _)| path.clone())
            .collect()
    }

    pub fn refresh_bodies(&self) -> Vec<Value> {
        self.refresh_bodies.lock().unwrap().clone()
    }

    async fn refresh(&self, request: &RequestDescriptor) -> Result<RawResponse, TransportError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.refresh_bodies
            .lock()
            .unwrap()
            .push(request.body.clone().unwrap_or(Value::Null));

        for _ in 0..self.refresh_yields {
            tokio::task::yield_now().await;
        }
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        match &self.refresh {
            RefreshBehavior::Succeed { access, refresh } => Ok(RawResponse::new(
                StatusCode::OK,
                json!({
                    "success": true,
                    "data": {"accessToken": access, "refreshToken": refresh, "expiresIn": 3600}
                })
                .to_string(),
            )),
            RefreshBehavior::NetworkError => {
                Err(TransportError::Connect("connection reset".into()))
            }
            RefreshBehavior::Reject => Ok(failure(
                StatusCode::UNAUTHORIZED,
                "A005",
                "Refresh token expired",
            )),
        }
    }

    fn business(&self, request: &RequestDescriptor) -> RawResponse {
        self.business_calls.fetch_add(1, Ordering::SeqCst);
        let token = request
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        self.business_log
            .lock()
            .unwrap()
            .push((request.path.clone(), token.map(str::to_string)));

        if request.path == "/v1/fail" {
            return failure(StatusCode::INTERNAL_SERVER_ERROR, "S001", "Internal error");
        }
        if let Some((code, message)) = self.rejection.lock().unwrap().clone() {
            return failure(StatusCode::UNAUTHORIZED, &code, &message);
        }

        match token {
            None => failure(StatusCode::UNAUTHORIZED, "A001", "Authentication required"),
            Some(token) if token == self.valid_token && !self.never_accepting => RawResponse::new(
                StatusCode::OK,
                json!({"success": true, "data": {"token": token, "path": request.path}})
                    .to_string(),
            ),
            Some(_) => failure(StatusCode::UNAUTHORIZED, "A004", "Access token expired"),
        }
    }
}

#[async_trait]
impl Transport for FakeServer {
    async fn send(&self, request: &RequestDescriptor) -> Result<RawResponse, TransportError> {
        if request.path == DEFAULT_REFRESH_PATH {
            self.refresh(request).await
        } else {
            Ok(self.business(request))
        }
    }
}

/// Session listener that remembers every redirect.
#[derive(Debug, Default)]
pub struct RecordingListener {
    routes: Mutex<Vec<String>>,
}

impl RecordingListener {
    pub fn count(&self) -> usize {
        self.routes.lock().unwrap().len()
    }

    pub fn routes(&self) -> Vec<String> {
        self.routes.lock().unwrap().clone()
    }
}

impl SessionListener for RecordingListener {
    fn session_ended(&self, redirect_to: &str) {
        self.routes.lock().unwrap().push(redirect_to.to_string());
    }
}
