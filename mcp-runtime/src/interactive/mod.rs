//! Human-in-the-loop coordination.
//!
//! A [`SessionCoordinator`] suspends a tool call, serves a session page on an
//! ephemeral local listener, delivers its URL (browser or push notification)
//! and waits for the human's decision. Only one wait is ever pending; a new
//! request completes the previous one as cancelled first.

pub mod bind;
pub mod delivery;
pub mod error;
pub mod pending;
mod push;
mod routes;
pub mod sessions;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cloudkit_core::{
    AccountInfo, BindError, CancelReason, EnvCandidate, ErrorContext, InteractiveResult,
    ResultKind, SessionError,
};
use serde_json::{Value, json};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::InteractiveConfig;
use crate::platform::EnvironmentSource;
use bind::bind_first_available;
use delivery::{Delivery, DeliveryOutcome};
use pending::PendingSlot;
use sessions::{LiveChannel, SessionPayload, SessionStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Starting,
    Listening,
    WaitingForResolution,
    Stopping,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Starting,
    Listening,
    Stopping,
}

struct RunningServer {
    port: u16,
    stop_push: watch::Sender<bool>,
    stop_http: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct Inner {
    config: InteractiveConfig,
    delivery: Delivery,
    sessions: Arc<SessionStore>,
    pending: PendingSlot,
    server: tokio::sync::Mutex<Option<RunningServer>>,
    phase: Mutex<Phase>,
    active: AtomicUsize,
    collaborators: Mutex<HashMap<String, Arc<dyn EnvironmentSource>>>,
}

/// Owns the local interaction listener, the session registry and the single
/// pending-resolution slot. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SessionCoordinator {
    inner: Arc<Inner>,
}

impl SessionCoordinator {
    pub fn new(config: InteractiveConfig, delivery: Delivery) -> Self {
        let sessions = Arc::new(SessionStore::new(config.session_ttl));
        Self {
            inner: Arc::new(Inner {
                config,
                delivery,
                sessions,
                pending: PendingSlot::new(),
                server: tokio::sync::Mutex::new(None),
                phase: Mutex::new(Phase::Idle),
                active: AtomicUsize::new(0),
                collaborators: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &InteractiveConfig {
        &self.inner.config
    }

    pub fn delivery(&self) -> &Delivery {
        &self.inner.delivery
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.inner.sessions
    }

    pub fn state(&self) -> CoordinatorState {
        match *self.inner.phase.lock().unwrap_or_else(|e| e.into_inner()) {
            Phase::Idle => CoordinatorState::Idle,
            Phase::Starting => CoordinatorState::Starting,
            Phase::Stopping => CoordinatorState::Stopping,
            Phase::Listening if self.inner.pending.is_pending() => {
                CoordinatorState::WaitingForResolution
            }
            Phase::Listening => CoordinatorState::Listening,
        }
    }

    /// Session id of the wait currently pending, if any.
    pub fn pending_session_id(&self) -> Option<String> {
        self.inner.pending.session_id()
    }

    /// Bound port while listening.
    pub async fn port(&self) -> Option<u16> {
        self.inner.server.lock().await.as_ref().map(|server| server.port)
    }

    /// Bind the listener (idempotent) and return its port.
    pub async fn start(&self) -> Result<u16, BindError> {
        let mut server = self.inner.server.lock().await;
        if let Some(running) = server.as_ref() {
            return Ok(running.port);
        }

        self.set_phase(Phase::Starting);
        let (listener, port) =
            match bind_first_available(self.inner.config.host, &self.inner.config.ports).await {
                Ok(bound) => bound,
                Err(err) => {
                    self.set_phase(Phase::Idle);
                    tracing::error!(error = %err, "interactive server could not bind");
                    return Err(err);
                }
            };

        let (stop_push, push_rx) = watch::channel(false);
        let (stop_http, http_rx) = oneshot::channel::<()>();
        let app = routes::router(self.clone(), push_rx, port);
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = http_rx.await;
            });
            if let Err(err) = serve.await {
                tracing::error!(error = %err, "interactive server terminated with error");
            }
        });

        *server = Some(RunningServer {
            port,
            stop_push,
            stop_http,
            task,
        });
        self.set_phase(Phase::Listening);
        tracing::info!(port, "interactive server listening");
        Ok(port)
    }

    /// Shut down the push channels, then the HTTP listener, leaving the
    /// coordinator unbound and ready to start again.
    pub async fn stop(&self) {
        self.stop_inner(false).await;
    }

    async fn stop_inner(&self, only_if_idle: bool) {
        let mut server = self.inner.server.lock().await;
        if only_if_idle && self.inner.active.load(Ordering::SeqCst) > 0 {
            return;
        }
        let Some(running) = server.take() else {
            return;
        };

        self.set_phase(Phase::Stopping);
        let _ = running.stop_push.send(true);
        let closed = self.inner.sessions.close_channels();
        let _ = running.stop_http.send(());

        let mut task = running.task;
        match tokio::time::timeout(self.inner.config.stop_timeout, &mut task).await {
            Ok(_) => {
                tracing::info!(port = running.port, closed_channels = closed, "interactive server stopped");
            }
            Err(_) => {
                tracing::warn!(
                    port = running.port,
                    timeout_ms = self.inner.config.stop_timeout.as_millis() as u64,
                    "graceful shutdown timed out; forcing interactive server down"
                );
                task.abort();
            }
        }
        self.set_phase(Phase::Idle);
    }

    /// Ask the human to pick (or set up) an environment.
    ///
    /// Rejects only when no port can be bound. Timeouts and cancellation come
    /// back as a cancelled result.
    pub async fn collect_environment_selection(
        &self,
        candidates: Vec<EnvCandidate>,
        account: Option<AccountInfo>,
        error_context: Option<ErrorContext>,
        collaborator: Option<Arc<dyn EnvironmentSource>>,
    ) -> Result<InteractiveResult, BindError> {
        let payload = SessionPayload::EnvSetup {
            candidates,
            account,
            error_context,
            has_collaborator: collaborator.is_some(),
        };
        let timeouts = self.inner.config.timeouts;
        self.run_interaction(
            ResultKind::EnvironmentSelection,
            payload,
            collaborator,
            move |outcome| Some(timeouts.for_outcome(outcome)),
        )
        .await
    }

    /// Ask a free-form question. No internal timeout; callers bound it if needed.
    pub async fn request_clarification(
        &self,
        message: impl Into<String>,
        options: Vec<String>,
    ) -> Result<InteractiveResult, BindError> {
        let payload = SessionPayload::Clarification {
            prompt_kind: ResultKind::Clarification,
            message: message.into(),
            options,
            risk: None,
            details: None,
        };
        self.run_interaction(ResultKind::Clarification, payload, None, |_| None)
            .await
    }

    /// Ask the human to approve a risky operation. No internal timeout.
    pub async fn request_confirmation(
        &self,
        message: impl Into<String>,
        risk: Option<String>,
        details: Option<Value>,
    ) -> Result<InteractiveResult, BindError> {
        let payload = SessionPayload::Clarification {
            prompt_kind: ResultKind::Confirmation,
            message: message.into(),
            options: vec!["confirm".to_string(), "reject".to_string()],
            risk,
            details,
        };
        self.run_interaction(ResultKind::Confirmation, payload, None, |_| None)
            .await
    }

    /// Deliver an arbitrary URL through the configured delivery mode.
    pub fn open_url(&self, url: &str) -> DeliveryOutcome {
        self.inner.delivery.deliver(url)
    }

    async fn run_interaction(
        &self,
        kind: ResultKind,
        payload: SessionPayload,
        collaborator: Option<Arc<dyn EnvironmentSource>>,
        wait_limit: impl FnOnce(DeliveryOutcome) -> Option<Duration>,
    ) -> Result<InteractiveResult, BindError> {
        let session_id = Uuid::now_v7().to_string();
        let mut guard = InteractionGuard::enter(self.clone(), &session_id);

        // Supersede first, so the previous caller is completed before this wait exists.
        let rx = self.inner.pending.install(&session_id, kind);

        let port = match self.start().await {
            Ok(port) => port,
            Err(err) => {
                self.inner
                    .pending
                    .cancel_if_owned(&session_id, CancelReason::UserCancelled);
                guard.finish().await;
                return Err(err);
            }
        };

        let view = payload.view();
        self.inner.sessions.insert(&session_id, payload);
        self.inner.sessions.schedule_purge(&session_id);
        if let Some(collaborator) = collaborator {
            self.collaborators().insert(session_id.clone(), collaborator);
        }

        let url = format!(
            "http://{}/{view}/{session_id}",
            SocketAddr::new(self.inner.config.host, port)
        );
        let outcome = self.inner.delivery.deliver(&url);
        let limit = wait_limit(outcome);
        tracing::info!(
            session_id = %session_id,
            kind = kind.as_str(),
            %url,
            delivery = outcome.as_str(),
            wait_secs = limit.map(|d| d.as_secs()),
            "waiting for interactive resolution"
        );

        let result = match limit {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => InteractiveResult::cancelled(kind),
                Err(_) => {
                    self.inner
                        .pending
                        .cancel_if_owned(&session_id, CancelReason::TimedOut);
                    InteractiveResult::cancelled(kind)
                }
            },
            None => rx
                .await
                .unwrap_or_else(|_| InteractiveResult::cancelled(kind)),
        };

        guard.finish().await;
        tracing::info!(
            session_id = %session_id,
            kind = kind.as_str(),
            cancelled = result.cancelled,
            switch_requested = result.switch_requested,
            "interactive resolution finished"
        );
        Ok(result)
    }

    // Inbound actions. None of these fail when nobody is waiting; they log and
    // report `false` instead.

    pub fn submit(&self, kind: Option<ResultKind>, data: Value, session_hint: Option<&str>) -> bool {
        if !self.accepts(session_hint, "submit") {
            return false;
        }
        self.inner
            .pending
            .resolve_with(|expected| {
                if let Some(sent) = kind.filter(|sent| *sent != expected) {
                    tracing::warn!(
                        sent = sent.as_str(),
                        expected = expected.as_str(),
                        "submitted type does not match the pending wait; keeping the pending kind"
                    );
                }
                InteractiveResult::submitted(expected, data)
            })
            .is_some()
    }

    pub fn cancel(&self, session_hint: Option<&str>) -> bool {
        if !self.accepts(session_hint, "cancel") {
            return false;
        }
        self.inner.pending.cancel(CancelReason::UserCancelled).is_some()
    }

    pub fn request_switch(&self, session_hint: Option<&str>) -> bool {
        if !self.accepts(session_hint, "switch") {
            return false;
        }
        let resolved = self
            .inner
            .pending
            .resolve_with(InteractiveResult::switch_account);
        if let Some(session_id) = &resolved {
            tracing::info!(session_id = %session_id, "account switch requested");
        }
        resolved.is_some()
    }

    /// Mark a session for retry and refresh its candidates without resolving.
    pub async fn retry_init(&self, session_id: &str) -> Result<(), SessionError> {
        self.inner.sessions.mark_retry(session_id)?;
        tracing::info!(session_id = %session_id, "session marked for retry");
        if self.collaborator(session_id).is_some() {
            if let Err(err) = self.refresh_env_list(session_id).await {
                tracing::warn!(session_id = %session_id, error = %err, "retry refresh failed");
            }
        }
        Ok(())
    }

    /// Re-query the session's collaborator and push the fresh candidate list
    /// over the live channel. Returns the number of candidates pushed.
    pub async fn refresh_env_list(&self, session_id: &str) -> Result<usize, RefreshError> {
        let collaborator = self
            .collaborator(session_id)
            .ok_or_else(|| RefreshError::NoCollaborator(session_id.to_string()))?;
        let envs = collaborator
            .list_environments()
            .await
            .map_err(|err| RefreshError::Collaborator(err.to_string()))?;
        let count = envs.len();
        self.inner
            .sessions
            .update_candidates(session_id, envs.clone())?;
        let message = json!({
            "type": "envListUpdated",
            "sessionId": session_id,
            "envs": envs,
        });
        if !self.inner.sessions.push(session_id, message.to_string()) {
            tracing::debug!(session_id = %session_id, "no live channel for refreshed env list");
        }
        Ok(count)
    }

    pub fn register_channel(&self, session_id: &str, channel: LiveChannel) -> Result<(), SessionError> {
        self.inner.sessions.bind_channel(session_id, channel)?;
        tracing::debug!(session_id = %session_id, "live channel registered");
        Ok(())
    }

    fn accepts(&self, session_hint: Option<&str>, action: &'static str) -> bool {
        match (self.inner.pending.session_id(), session_hint) {
            (None, hint) => {
                tracing::warn!(
                    session_id = hint.unwrap_or("-"),
                    action,
                    "no pending interaction; action ignored"
                );
                false
            }
            (Some(current), Some(hint)) if current != hint => {
                tracing::warn!(
                    session_id = hint,
                    pending_session_id = %current,
                    action,
                    "action targets a stale session; ignored"
                );
                false
            }
            _ => true,
        }
    }

    fn collaborator(&self, session_id: &str) -> Option<Arc<dyn EnvironmentSource>> {
        self.collaborators().get(session_id).cloned()
    }

    fn collaborators(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<dyn EnvironmentSource>>> {
        self.inner
            .collaborators
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn set_phase(&self, phase: Phase) {
        *self.inner.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("session '{0}' has no environment source")]
    NoCollaborator(String),
    #[error("environment source failed: {0}")]
    Collaborator(String),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Tracks one in-progress interaction. The listener is stopped once the last
/// interaction finishes; dropping without `finish` (caller cancelled) still
/// releases the pending slot and schedules the stop.
struct InteractionGuard {
    coordinator: SessionCoordinator,
    session_id: String,
    finished: bool,
}

impl InteractionGuard {
    fn enter(coordinator: SessionCoordinator, session_id: &str) -> Self {
        coordinator.inner.active.fetch_add(1, Ordering::SeqCst);
        Self {
            coordinator,
            session_id: session_id.to_string(),
            finished: false,
        }
    }

    fn release(&mut self) -> bool {
        self.finished = true;
        self.coordinator.collaborators().remove(&self.session_id);
        self.coordinator.inner.active.fetch_sub(1, Ordering::SeqCst) == 1
    }

    async fn finish(&mut self) {
        if self.release() {
            self.coordinator.stop_inner(true).await;
        }
    }
}

impl Drop for InteractionGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.coordinator
            .inner
            .pending
            .cancel_if_owned(&self.session_id, CancelReason::UserCancelled);
        if self.release() {
            let coordinator = self.coordinator.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { coordinator.stop_inner(true).await });
            }
        }
    }
}
