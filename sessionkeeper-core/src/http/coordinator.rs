//! Coordinated access-token refresh.
//!
//! [`RefreshCoordinator`] sends every request, and when one fails because the
//! access token expired it makes sure exactly one refresh call is in flight.
//! Requests failing the same way while that refresh is pending are parked in a
//! FIFO queue, each with its own completion handle, and replayed with the new
//! token once the refresh lands. If the refresh fails the queue is flushed with
//! the failure and the session is terminated.
//!
//! The `Idle -> Refreshing` check-and-set happens inside a synchronous critical
//! section, so two tasks can never both start a cycle. The `Refreshing -> Idle`
//! transition is owned by a [`RefreshCycle`] guard and happens exactly once per
//! cycle, including when the leading future is dropped mid-refresh.
//!
//! Every completed cycle bumps an epoch and records its outcome. Requests carry
//! the epoch they were sent under, so a request whose failure is handled only
//! after a cycle already ended reuses that cycle's outcome instead of starting
//! another one.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::auth::{
    ensure_device_id, CredentialKey, CredentialPair, CredentialStore, CredentialStoreError,
    RefreshRequest, SessionTerminator, TokenResponse,
};
use crate::error::ClientError;

use super::classify::{normalize_failure, FailureClass, FailureClassifier};
use super::envelope::unwrap_data;
use super::request::{RequestDescriptor, RequestInterceptor};
use super::transport::{RawResponse, Transport, TransportError};

type Reply = Result<RawResponse, ClientError>;

/// Observable phase of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshPhase {
    #[default]
    Idle,
    Refreshing,
}

/// A request waiting for the in-flight refresh.
struct PendingRequest {
    request: RequestDescriptor,
    reply: oneshot::Sender<Reply>,
}

/// How the last completed cycle ended.
#[derive(Clone)]
enum CycleOutcome {
    Refreshed(String),
    Failed(ClientError),
}

#[derive(Default)]
struct RefreshState {
    phase: RefreshPhase,
    pending: VecDeque<PendingRequest>,
    epoch: u64,
    last_outcome: Option<CycleOutcome>,
}

fn lock_state(state: &Mutex<RefreshState>) -> MutexGuard<'_, RefreshState> {
    // The state is only ever mutated by whole-statement updates, so a poisoned
    // lock still holds a consistent value.
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ownership of one refresh cycle.
///
/// Dropping the guard without calling [`RefreshCycle::finish`] returns the
/// coordinator to idle and rejects everything queued as cancelled.
struct RefreshCycle {
    state: Arc<Mutex<RefreshState>>,
    finished: bool,
}

impl RefreshCycle {
    /// End the cycle: record `outcome`, go back to idle and take the queue,
    /// atomically.
    fn finish(mut self, outcome: CycleOutcome) -> VecDeque<PendingRequest> {
        self.finished = true;
        let mut state = lock_state(&self.state);
        state.epoch += 1;
        state.last_outcome = Some(outcome);
        Self::close(&mut state)
    }

    fn close(state: &mut RefreshState) -> VecDeque<PendingRequest> {
        state.phase = RefreshPhase::Idle;
        std::mem::take(&mut state.pending)
    }
}

impl Drop for RefreshCycle {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let pending = Self::close(&mut lock_state(&self.state));
        warn!(queued = pending.len(), "Refresh cycle abandoned");
        for record in pending {
            let _ = record.reply.send(Err(ClientError::Cancelled));
        }
    }
}

/// Outcome of sending a request once.
enum Attempt {
    Settled(Reply),
    Expired {
        request: RequestDescriptor,
        error: ClientError,
    },
}

/// What an expired request does next.
enum Admission {
    /// Start a refresh cycle.
    Lead(RefreshCycle, RequestDescriptor),
    /// Wait for the cycle already in flight.
    Queued(oneshot::Receiver<Reply>),
    /// A refresh already replaced the token this request used.
    Replay(RequestDescriptor, String),
    /// The cycle that handled this token already failed.
    Rejected(ClientError),
}

enum RefreshFailure {
    MissingRefreshToken,
    Failed(ClientError),
}

impl From<ClientError> for RefreshFailure {
    fn from(err: ClientError) -> Self {
        Self::Failed(err)
    }
}

impl From<CredentialStoreError> for RefreshFailure {
    fn from(err: CredentialStoreError) -> Self {
        Self::Failed(err.into())
    }
}

impl From<TransportError> for RefreshFailure {
    fn from(err: TransportError) -> Self {
        Self::Failed(err.into())
    }
}

fn reject_all(pending: VecDeque<PendingRequest>, error: &ClientError) {
    for record in pending {
        let _ = record.reply.send(Err(error.clone()));
    }
}

/// Sends requests and recovers from expired access tokens.
///
/// Cloning is cheap and every clone shares the same refresh state, so one
/// coordinator should be built per client instance.
#[derive(Clone)]
pub struct RefreshCoordinator {
    transport: Arc<dyn Transport>,
    store: Arc<dyn CredentialStore>,
    interceptor: RequestInterceptor,
    classifier: FailureClassifier,
    terminator: SessionTerminator,
    refresh_path: String,
    state: Arc<Mutex<RefreshState>>,
}

impl RefreshCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn CredentialStore>,
        classifier: FailureClassifier,
        terminator: SessionTerminator,
        refresh_path: impl Into<String>,
    ) -> Self {
        Self {
            interceptor: RequestInterceptor::new(Arc::clone(&store)),
            transport,
            store,
            classifier,
            terminator,
            refresh_path: refresh_path.into(),
            state: Arc::new(Mutex::new(RefreshState::default())),
        }
    }

    pub fn phase(&self) -> RefreshPhase {
        lock_state(&self.state).phase
    }

    /// Number of requests waiting for the current refresh.
    pub fn pending_len(&self) -> usize {
        lock_state(&self.state).pending.len()
    }

    pub fn terminator(&self) -> &SessionTerminator {
        &self.terminator
    }

    /// Send a request with the current access token, refreshing it if it expired.
    ///
    /// Returns the successful response; every failure is normalized into a
    /// [`ClientError`].
    pub async fn execute(&self, mut request: RequestDescriptor) -> Reply {
        // Taken before the token is read, so a cycle finishing in between is noticed.
        request.set_cycle_epoch(lock_state(&self.state).epoch);
        let request = self.interceptor.intercept(request).await?;
        match self.attempt(request).await {
            Attempt::Settled(reply) => reply,
            Attempt::Expired { request, error } => self.recover(request, error).await,
        }
    }

    /// Send once and classify the result.
    async fn attempt(&self, request: RequestDescriptor) -> Attempt {
        let outcome = self.transport.send(&request).await;
        if matches!(&outcome, Ok(response) if response.is_success()) {
            return Attempt::Settled(outcome.map_err(ClientError::from));
        }

        let class = self.classifier.classify(&request, outcome.as_ref());
        let error = normalize_failure(outcome.as_ref());

        match class {
            FailureClass::RecoverableByRefresh => Attempt::Expired { request, error },
            FailureClass::TerminalAuth => {
                if !request.is_auth_recovery_skipped() && self.phase() == RefreshPhase::Idle {
                    warn!(
                        method = %request.method,
                        path = %request.path,
                        error = %error,
                        "Unrecoverable authorization failure"
                    );
                    self.terminator.terminate().await;
                }
                Attempt::Settled(Err(error))
            }
            FailureClass::Other | FailureClass::NetworkUnreachable => {
                debug!(
                    method = %request.method,
                    path = %request.path,
                    error = %error,
                    "Request failed"
                );
                Attempt::Settled(Err(error))
            }
        }
    }

    async fn recover(&self, mut request: RequestDescriptor, error: ClientError) -> Reply {
        let current = self
            .store
            .get(CredentialKey::AccessToken)
            .await?
            .filter(|token| !token.is_empty());

        request.mark_retried();

        match self.admit(request, current) {
            Admission::Replay(request, token) => {
                debug!(path = %request.path, "Token already refreshed, replaying");
                self.replay(request, &token).await
            }
            Admission::Rejected(error) => {
                debug!("Refresh for this token already failed");
                Err(error)
            }
            Admission::Queued(reply) => {
                debug!("Refresh in progress, request queued");
                reply.await.unwrap_or_else(|_| Err(ClientError::Cancelled))
            }
            Admission::Lead(cycle, request) => self.lead_refresh(cycle, request, error).await,
        }
    }

    /// Decide, without suspending, whether this request starts a cycle, joins the
    /// running one, or reuses the outcome of one that already ended.
    ///
    /// `current` is the stored access token, which catches tokens rotated
    /// outside this coordinator.
    fn admit(&self, request: RequestDescriptor, current: Option<String>) -> Admission {
        let mut state = lock_state(&self.state);

        if state.phase == RefreshPhase::Refreshing {
            let (reply, receiver) = oneshot::channel();
            state.pending.push_back(PendingRequest { request, reply });
            return Admission::Queued(receiver);
        }

        if request.cycle_epoch() != state.epoch {
            match &state.last_outcome {
                Some(CycleOutcome::Refreshed(token)) => {
                    return Admission::Replay(request, token.clone())
                }
                Some(CycleOutcome::Failed(error)) => return Admission::Rejected(error.clone()),
                None => {}
            }
        }

        if let Some(current) = current {
            if request.sent_token() != Some(current.as_str()) {
                return Admission::Replay(request, current);
            }
        }

        state.phase = RefreshPhase::Refreshing;
        drop(state);

        let cycle = RefreshCycle {
            state: Arc::clone(&self.state),
            finished: false,
        };
        Admission::Lead(cycle, request)
    }

    async fn lead_refresh(
        &self,
        cycle: RefreshCycle,
        request: RequestDescriptor,
        original: ClientError,
    ) -> Reply {
        info!(method = %request.method, path = %request.path, "Access token expired, refreshing");

        match self.refresh_credentials().await {
            Ok(pair) => {
                let pending = cycle.finish(CycleOutcome::Refreshed(pair.access_token.clone()));
                info!(queued = pending.len(), expires_in = ?pair.expires_in, "Token refreshed");
                for record in pending {
                    self.spawn_replay(record, pair.access_token.clone());
                }
                self.replay(request, &pair.access_token).await
            }
            Err(RefreshFailure::MissingRefreshToken) => {
                warn!("No refresh token stored, ending session");
                self.terminator.terminate().await;
                reject_all(cycle.finish(CycleOutcome::Failed(original.clone())), &original);
                Err(original)
            }
            Err(RefreshFailure::Failed(cause)) => {
                error!(error = %cause, "Token refresh failed, ending session");
                self.terminator.terminate().await;
                let error = ClientError::RefreshFailed(Box::new(cause));
                reject_all(cycle.finish(CycleOutcome::Failed(error.clone())), &error);
                Err(error)
            }
        }
    }

    /// Call the refresh endpoint and persist the rotated pair.
    async fn refresh_credentials(&self) -> Result<CredentialPair, RefreshFailure> {
        let refresh_token = match self.store.get(CredentialKey::RefreshToken).await? {
            Some(token) if !token.is_empty() => token,
            _ => return Err(RefreshFailure::MissingRefreshToken),
        };
        let device_id = ensure_device_id(self.store.as_ref()).await?;

        let request = RequestDescriptor::post(self.refresh_path.as_str()).json(&RefreshRequest {
            refresh_token: &refresh_token,
            device_id: &device_id,
        })?;

        let response = self.transport.send(&request).await?;
        if !response.is_success() {
            return Err(normalize_failure(Ok(&response)).into());
        }

        let tokens: TokenResponse = unwrap_data(&response)?;
        if tokens.access_token.is_empty() || tokens.refresh_token.is_empty() {
            return Err(ClientError::Decode("refresh response is missing tokens".into()).into());
        }

        self.store
            .set(CredentialKey::AccessToken, &tokens.access_token)
            .await?;
        self.store
            .set(CredentialKey::RefreshToken, &tokens.refresh_token)
            .await?;
        if let Some(user) = &tokens.user_info {
            let json = serde_json::to_string(user).map_err(ClientError::from)?;
            self.store.set(CredentialKey::UserInfo, &json).await?;
        }

        Ok(tokens.credential_pair())
    }

    /// Resend an already-retried request with `token`.
    async fn replay(&self, request: RequestDescriptor, token: &str) -> Reply {
        let request = request.with_bearer(token)?;
        match self.attempt(request).await {
            Attempt::Settled(reply) => reply,
            // Retried requests always classify as terminal.
            Attempt::Expired { error, .. } => Err(error),
        }
    }

    fn spawn_replay(&self, record: PendingRequest, token: String) {
        if record.reply.is_closed() {
            debug!(path = %record.request.path, "Queued caller went away, skipping replay");
            return;
        }

        let coordinator = self.clone();
        tokio::spawn(async move {
            let PendingRequest { request, reply } = record;
            let result = coordinator.replay(request, &token).await;
            let _ = reply.send(result);
        });
    }
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("refresh_path", &self.refresh_path)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryCredentialStore;
    use crate::http::testing::{FakeServer, RecordingListener, RefreshBehavior};
    use async_trait::async_trait;
    use futures::future::join_all;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready};

    struct Harness {
        server: Arc<FakeServer>,
        store: Arc<MemoryCredentialStore>,
        listener: Arc<RecordingListener>,
        coordinator: RefreshCoordinator,
    }

    fn harness(server: FakeServer, store: MemoryCredentialStore) -> Harness {
        let server = Arc::new(server);
        let store = Arc::new(store);
        let listener = Arc::new(RecordingListener::default());
        let terminator = SessionTerminator::new(store.clone(), listener.clone(), "/login");
        let coordinator = RefreshCoordinator::new(
            server.clone(),
            store.clone(),
            FailureClassifier::default(),
            terminator,
            "/v1/auth/refresh-token",
        );
        Harness {
            server,
            store,
            listener,
            coordinator,
        }
    }

    fn signed_in() -> MemoryCredentialStore {
        MemoryCredentialStore::with_entries([
            (CredentialKey::AccessToken, "T1"),
            (CredentialKey::RefreshToken, "R1"),
            (CredentialKey::UserInfo, r#"{"id":1,"email":"a@b.c","name":"Kim"}"#),
            (CredentialKey::DeviceId, "device-1"),
        ])
    }

    fn token_of(reply: &RawResponse) -> String {
        let body: serde_json::Value = serde_json::from_str(&reply.body).unwrap();
        body["data"]["token"].as_str().unwrap().to_string()
    }

    // -------------------------------------------------------------------------
    // Single request
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_valid_token_passes_through() {
        let h = harness(FakeServer::accepting("T1"), signed_in());

        let reply = h
            .coordinator
            .execute(RequestDescriptor::get("/v1/profile"))
            .await
            .unwrap();

        assert_eq!(token_of(&reply), "T1");
        assert_eq!(h.server.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed_and_replayed() {
        let h = harness(FakeServer::rotating_to("T2", "R2"), signed_in());

        let reply = h
            .coordinator
            .execute(RequestDescriptor::get("/v1/profile"))
            .await
            .unwrap();

        assert_eq!(token_of(&reply), "T2");
        assert_eq!(h.server.refresh_calls(), 1);
        assert_eq!(
            h.server.refresh_bodies(),
            vec![serde_json::json!({"refreshToken": "R1", "deviceId": "device-1"})]
        );
        assert_eq!(
            h.store.get(CredentialKey::AccessToken).await.unwrap(),
            Some("T2".to_string())
        );
        assert_eq!(
            h.store.get(CredentialKey::RefreshToken).await.unwrap(),
            Some("R2".to_string())
        );
        assert_eq!(h.coordinator.phase(), RefreshPhase::Idle);
        assert_eq!(h.listener.count(), 0);
    }

    #[tokio::test]
    async fn test_refresh_generates_device_id_when_missing() {
        let store = MemoryCredentialStore::with_entries([
            (CredentialKey::AccessToken, "T1"),
            (CredentialKey::RefreshToken, "R1"),
        ]);
        let h = harness(FakeServer::rotating_to("T2", "R2"), store);

        h.coordinator
            .execute(RequestDescriptor::get("/v1/profile"))
            .await
            .unwrap();

        let device_id = h.store.get(CredentialKey::DeviceId).await.unwrap().unwrap();
        assert_eq!(h.server.refresh_bodies()[0]["deviceId"], device_id);
    }

    #[tokio::test]
    async fn test_missing_refresh_token_terminates_without_refresh_call() {
        let store = MemoryCredentialStore::with_entries([
            (CredentialKey::AccessToken, "T1"),
            (CredentialKey::DeviceId, "device-1"),
        ]);
        let h = harness(FakeServer::rotating_to("T2", "R2"), store);

        let err = h
            .coordinator
            .execute(RequestDescriptor::get("/v1/profile"))
            .await
            .unwrap_err();

        assert_eq!(h.server.refresh_calls(), 0);
        assert!(matches!(
            err,
            ClientError::Unauthorized { ref code, .. } if code.as_deref() == Some("A004")
        ));
        assert_eq!(h.listener.routes(), vec!["/login".to_string()]);
        assert!(h.store.get(CredentialKey::AccessToken).await.unwrap().is_none());
        assert_eq!(h.coordinator.phase(), RefreshPhase::Idle);
    }

    #[tokio::test]
    async fn test_replayed_request_is_not_retried_again() {
        // The server keeps rejecting even the fresh token as expired.
        let h = harness(
            FakeServer::rotating_to("T2", "R2").never_accepting(),
            signed_in(),
        );

        let err = h
            .coordinator
            .execute(RequestDescriptor::get("/v1/profile"))
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Unauthorized { .. }));
        assert_eq!(h.server.refresh_calls(), 1);
        assert_eq!(h.server.business_calls(), 2);
        // Unrecovered auth failure ends the session.
        assert_eq!(h.listener.count(), 1);
    }

    #[tokio::test]
    async fn test_terminal_auth_failure_terminates_session() {
        let h = harness(FakeServer::accepting("T9"), signed_in());
        h.server.reject_with_code("A001", "Invalid token signature");

        let err = h
            .coordinator
            .execute(RequestDescriptor::get("/v1/profile"))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ClientError::Unauthorized {
                code: Some("A001".into()),
                message: "Invalid token signature".into()
            }
        );
        assert_eq!(h.server.refresh_calls(), 0);
        assert_eq!(h.listener.count(), 1);
        assert_eq!(
            h.store.get(CredentialKey::DeviceId).await.unwrap(),
            Some("device-1".to_string())
        );
    }

    #[tokio::test]
    async fn test_public_endpoint_unauthorized_is_surfaced_verbatim() {
        let h = harness(FakeServer::rotating_to("T2", "R2"), signed_in());

        let err = h
            .coordinator
            .execute(RequestDescriptor::post("/v1/profile").skip_auth_recovery())
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Unauthorized { .. }));
        assert_eq!(h.server.refresh_calls(), 0);
        assert_eq!(h.listener.count(), 0);
        assert!(h.store.get(CredentialKey::AccessToken).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_server_error_leaves_credentials_alone() {
        let h = harness(FakeServer::accepting("T1"), signed_in());

        let err = h
            .coordinator
            .execute(RequestDescriptor::get("/v1/fail"))
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Server { status: 500, .. }));
        assert_eq!(h.listener.count(), 0);
        assert!(h.store.get(CredentialKey::RefreshToken).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_token_is_replayed_without_new_refresh() {
        let h = harness(FakeServer::accepting("T2"), signed_in());

        // Sent with T1, but the store already holds T2 from an earlier refresh.
        h.store.set(CredentialKey::AccessToken, "T2").await.unwrap();
        let request = RequestDescriptor::get("/v1/profile").with_bearer("T1").unwrap();

        let reply = match h.coordinator.attempt(request).await {
            Attempt::Expired { request, error } => h.coordinator.recover(request, error).await,
            Attempt::Settled(_) => panic!("expected an expired-token failure"),
        };

        assert_eq!(token_of(&reply.unwrap()), "T2");
        assert_eq!(h.server.refresh_calls(), 0);
    }

    // -------------------------------------------------------------------------
    // Concurrent requests
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_concurrent_expired_requests_share_one_refresh() {
        let h = harness(
            FakeServer::rotating_to("T2", "R2").with_refresh_yields(3),
            signed_in(),
        );

        let requests = (0..8).map(|i| {
            h.coordinator
                .execute(RequestDescriptor::get(format!("/v1/items/{i}")))
        });
        let replies = join_all(requests).await;

        assert_eq!(h.server.refresh_calls(), 1);
        for reply in replies {
            assert_eq!(token_of(&reply.unwrap()), "T2");
        }
        assert_eq!(h.coordinator.pending_len(), 0);
        assert_eq!(h.coordinator.phase(), RefreshPhase::Idle);
    }

    #[tokio::test]
    async fn test_second_request_queues_while_refresh_is_pending() {
        let h = harness(FakeServer::rotating_to("T2", "R2").gated(), signed_in());

        let mut a = tokio_test::task::spawn(h.coordinator.execute(RequestDescriptor::get("/v1/a")));
        assert_pending!(a.poll());
        assert_eq!(h.coordinator.phase(), RefreshPhase::Refreshing);
        assert_eq!(h.server.refresh_calls(), 1);

        let mut b = tokio_test::task::spawn(h.coordinator.execute(RequestDescriptor::get("/v1/b")));
        assert_pending!(b.poll());
        assert_eq!(h.coordinator.pending_len(), 1);

        h.server.open_gate();
        assert!(a.is_woken());
        let a_reply = assert_ready!(a.poll()).unwrap();
        assert_eq!(token_of(&a_reply), "T2");
        assert_eq!(h.coordinator.phase(), RefreshPhase::Idle);

        // B is replayed on a spawned task; let it run.
        for _ in 0..16 {
            if b.is_woken() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let b_reply = assert_ready!(b.poll()).unwrap();
        assert_eq!(token_of(&b_reply), "T2");
        assert_eq!(h.server.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_queued_requests_replay_in_arrival_order() {
        let h = harness(FakeServer::rotating_to("T2", "R2").gated(), signed_in());

        let mut a = tokio_test::task::spawn(h.coordinator.execute(RequestDescriptor::get("/v1/a")));
        assert_pending!(a.poll());

        let mut queued: Vec<_> = ["/v1/b", "/v1/c", "/v1/d"]
            .into_iter()
            .map(|path| {
                let mut task =
                    tokio_test::task::spawn(h.coordinator.execute(RequestDescriptor::get(path)));
                assert_pending!(task.poll());
                task
            })
            .collect();
        assert_eq!(h.coordinator.pending_len(), 3);

        h.server.open_gate();
        assert_ready!(a.poll()).unwrap();

        for _ in 0..16 {
            if queued.iter().all(|task| task.is_woken()) {
                break;
            }
            tokio::task::yield_now().await;
        }
        for task in &mut queued {
            let reply = assert_ready!(task.poll()).unwrap();
            assert_eq!(token_of(&reply), "T2");
        }

        assert_eq!(
            h.server.paths_sent_with("T2"),
            vec!["/v1/a", "/v1/b", "/v1/c", "/v1/d"]
        );
        assert_eq!(h.server.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_refresh_network_failure_rejects_queue_and_clears_session() {
        let h = harness(
            FakeServer::rotating_to("T2", "R2")
                .with_refresh(RefreshBehavior::NetworkError)
                .with_refresh_yields(3),
            signed_in(),
        );

        let requests = (0..4).map(|i| {
            h.coordinator
                .execute(RequestDescriptor::get(format!("/v1/items/{i}")))
        });
        let replies = join_all(requests).await;

        assert_eq!(h.server.refresh_calls(), 1);
        for reply in replies {
            let err = reply.unwrap_err();
            assert!(err.refresh_cause().is_some_and(ClientError::is_network), "{err:?}");
        }
        assert_eq!(h.listener.count(), 1);
        for key in CredentialKey::session_keys() {
            assert!(h.store.get(*key).await.unwrap().is_none(), "{key} survived");
        }
        assert_eq!(
            h.store.get(CredentialKey::DeviceId).await.unwrap(),
            Some("device-1".to_string())
        );
    }

    #[tokio::test]
    async fn test_refresh_rejected_by_server() {
        let h = harness(
            FakeServer::rotating_to("T2", "R2").with_refresh(RefreshBehavior::Reject),
            signed_in(),
        );

        let err = h
            .coordinator
            .execute(RequestDescriptor::get("/v1/profile"))
            .await
            .unwrap_err();

        let cause = err.refresh_cause().unwrap();
        assert_eq!(cause.code(), Some("A005"));
        assert_eq!(h.listener.count(), 1);
        assert_eq!(h.coordinator.phase(), RefreshPhase::Idle);
    }

    #[tokio::test]
    async fn test_abandoned_cycle_cancels_queued_requests() {
        let h = harness(FakeServer::rotating_to("T2", "R2").gated(), signed_in());

        let mut a = tokio_test::task::spawn(h.coordinator.execute(RequestDescriptor::get("/v1/a")));
        assert_pending!(a.poll());
        let mut b = tokio_test::task::spawn(h.coordinator.execute(RequestDescriptor::get("/v1/b")));
        assert_pending!(b.poll());

        drop(a);

        assert_eq!(h.coordinator.phase(), RefreshPhase::Idle);
        assert!(b.is_woken());
        assert_eq!(assert_ready!(b.poll()), Err(ClientError::Cancelled));
    }

    // -------------------------------------------------------------------------
    // Slow credential storage
    // -------------------------------------------------------------------------

    /// Suspends after every access-token read, so concurrent requests all
    /// observe the token before any of them can act on it.
    struct SlowStore {
        inner: MemoryCredentialStore,
    }

    #[async_trait]
    impl CredentialStore for SlowStore {
        async fn get(&self, key: CredentialKey) -> Result<Option<String>, CredentialStoreError> {
            let value = self.inner.get(key).await?;
            if key == CredentialKey::AccessToken {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Ok(value)
        }

        async fn set(&self, key: CredentialKey, value: &str) -> Result<(), CredentialStoreError> {
            self.inner.set(key, value).await
        }

        async fn delete(&self, key: CredentialKey) -> Result<(), CredentialStoreError> {
            self.inner.delete(key).await
        }
    }

    fn slow_coordinator(
        server: Arc<FakeServer>,
        listener: Arc<RecordingListener>,
    ) -> RefreshCoordinator {
        let store = Arc::new(SlowStore { inner: signed_in() });
        let terminator = SessionTerminator::new(store.clone(), listener, "/login");
        RefreshCoordinator::new(
            server,
            store,
            FailureClassifier::default(),
            terminator,
            "/v1/auth/refresh-token",
        )
    }

    #[tokio::test]
    async fn test_failure_handled_after_refresh_completed_reuses_new_token() {
        let server = Arc::new(FakeServer::rotating_to("T2", "R2"));
        let listener = Arc::new(RecordingListener::default());
        let coordinator = slow_coordinator(server.clone(), listener.clone());

        let replies = join_all([
            coordinator.execute(RequestDescriptor::get("/v1/a")),
            coordinator.execute(RequestDescriptor::get("/v1/b")),
        ])
        .await;

        assert_eq!(server.refresh_calls(), 1);
        assert_eq!(
            server.refresh_bodies(),
            vec![serde_json::json!({"refreshToken": "R1", "deviceId": "device-1"})]
        );
        for reply in replies {
            assert_eq!(token_of(&reply.unwrap()), "T2");
        }
        assert_eq!(listener.count(), 0);
    }

    #[tokio::test]
    async fn test_failure_handled_after_refresh_failed_terminates_once() {
        let server = Arc::new(
            FakeServer::rotating_to("T2", "R2").with_refresh(RefreshBehavior::NetworkError),
        );
        let listener = Arc::new(RecordingListener::default());
        let coordinator = slow_coordinator(server.clone(), listener.clone());

        let replies = join_all([
            coordinator.execute(RequestDescriptor::get("/v1/a")),
            coordinator.execute(RequestDescriptor::get("/v1/b")),
        ])
        .await;

        assert_eq!(server.refresh_calls(), 1);
        for reply in replies {
            let err = reply.unwrap_err();
            assert!(err.refresh_cause().is_some_and(ClientError::is_network), "{err:?}");
        }
        assert_eq!(listener.count(), 1);
        assert_eq!(coordinator.phase(), RefreshPhase::Idle);
    }
}
