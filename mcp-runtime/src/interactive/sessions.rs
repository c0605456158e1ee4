use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cloudkit_core::{AccountInfo, EnvCandidate, ErrorContext, ResultKind, SessionError};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

/// Data a session page renders. Templates are not part of this crate.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "view", rename_all = "camelCase")]
pub enum SessionPayload {
    #[serde(rename_all = "camelCase")]
    EnvSetup {
        candidates: Vec<EnvCandidate>,
        #[serde(skip_serializing_if = "Option::is_none")]
        account: Option<AccountInfo>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_context: Option<ErrorContext>,
        has_collaborator: bool,
    },
    #[serde(rename_all = "camelCase")]
    Clarification {
        prompt_kind: ResultKind,
        message: String,
        options: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        risk: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
}

impl SessionPayload {
    pub fn view(&self) -> &'static str {
        match self {
            SessionPayload::EnvSetup { .. } => "env-setup",
            SessionPayload::Clarification { .. } => "clarification",
        }
    }
}

/// Push channel bound to a session by a `registerSession` message.
#[derive(Debug, Clone)]
pub struct LiveChannel {
    pub connection_id: Uuid,
    pub tx: mpsc::UnboundedSender<String>,
}

#[derive(Debug)]
struct Session {
    created_at: Instant,
    created_at_utc: DateTime<Utc>,
    payload: SessionPayload,
    live_channel: Option<LiveChannel>,
    retry_requested: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_in_secs: u64,
    pub live: bool,
    pub retry_requested: bool,
    pub payload: SessionPayload,
}

/// Session registry with a fixed time-to-live.
///
/// Expiry is enforced on every lookup; the scheduled purge only reclaims memory.
pub struct SessionStore {
    ttl: Duration,
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn insert(&self, session_id: &str, payload: SessionPayload) {
        let mut sessions = self.lock();
        sessions.insert(
            session_id.to_string(),
            Session {
                created_at: Instant::now(),
                created_at_utc: Utc::now(),
                payload,
                live_channel: None,
                retry_requested: false,
            },
        );
    }

    /// Remove the session once its TTL elapses, consumed or not.
    pub fn schedule_purge(self: &Arc<Self>, session_id: &str) {
        let store = Arc::downgrade(self);
        let session_id = session_id.to_string();
        let ttl = self.ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(store) = store.upgrade() {
                if store.remove(&session_id) {
                    tracing::debug!(session_id = %session_id, "interactive session expired");
                }
            }
        });
    }

    pub fn snapshot(&self, session_id: &str) -> Result<SessionSnapshot, SessionError> {
        let mut sessions = self.lock();
        let session = live_session(&mut sessions, session_id, self.ttl)?;
        let elapsed = session.created_at.elapsed();
        Ok(SessionSnapshot {
            session_id: session_id.to_string(),
            created_at: session.created_at_utc,
            expires_in_secs: self.ttl.saturating_sub(elapsed).as_secs(),
            live: session.live_channel.is_some(),
            retry_requested: session.retry_requested,
            payload: session.payload.clone(),
        })
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.snapshot(session_id).is_ok()
    }

    pub fn bind_channel(&self, session_id: &str, channel: LiveChannel) -> Result<(), SessionError> {
        let mut sessions = self.lock();
        let session = live_session(&mut sessions, session_id, self.ttl)?;
        session.live_channel = Some(channel);
        Ok(())
    }

    pub fn session_for_connection(&self, connection_id: Uuid) -> Option<String> {
        let sessions = self.lock();
        sessions.iter().find_map(|(id, session)| {
            let bound = session
                .live_channel
                .as_ref()
                .is_some_and(|channel| channel.connection_id == connection_id);
            (bound && session.created_at.elapsed() < self.ttl).then(|| id.clone())
        })
    }

    pub fn detach_connection(&self, connection_id: Uuid) {
        let mut sessions = self.lock();
        for session in sessions.values_mut() {
            if session
                .live_channel
                .as_ref()
                .is_some_and(|channel| channel.connection_id == connection_id)
            {
                session.live_channel = None;
            }
        }
    }

    pub fn update_candidates(
        &self,
        session_id: &str,
        next: Vec<EnvCandidate>,
    ) -> Result<(), SessionError> {
        let mut sessions = self.lock();
        let session = live_session(&mut sessions, session_id, self.ttl)?;
        match &mut session.payload {
            SessionPayload::EnvSetup { candidates, .. } => {
                *candidates = next;
                Ok(())
            }
            SessionPayload::Clarification { .. } => Err(SessionError::WrongKind {
                session_id: session_id.to_string(),
                expected: "env-setup",
            }),
        }
    }

    pub fn mark_retry(&self, session_id: &str) -> Result<(), SessionError> {
        let mut sessions = self.lock();
        let session = live_session(&mut sessions, session_id, self.ttl)?;
        session.retry_requested = true;
        Ok(())
    }

    /// Send a text frame over the session's live channel, if one is bound.
    pub fn push(&self, session_id: &str, message: String) -> bool {
        let sessions = self.lock();
        sessions
            .get(session_id)
            .and_then(|session| session.live_channel.as_ref())
            .is_some_and(|channel| channel.tx.send(message).is_ok())
    }

    pub fn remove(&self, session_id: &str) -> bool {
        self.lock().remove(session_id).is_some()
    }

    /// Drop every live channel sender so their socket tasks wind down.
    pub fn close_channels(&self) -> usize {
        let mut sessions = self.lock();
        sessions
            .values_mut()
            .filter_map(|session| session.live_channel.take())
            .count()
    }

    pub fn len(&self) -> usize {
        let mut sessions = self.lock();
        sessions.retain(|_, session| session.created_at.elapsed() < self.ttl);
        sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn live_session<'a>(
    sessions: &'a mut HashMap<String, Session>,
    session_id: &str,
    ttl: Duration,
) -> Result<&'a mut Session, SessionError> {
    let expired = sessions
        .get(session_id)
        .is_some_and(|session| session.created_at.elapsed() >= ttl);
    if expired {
        sessions.remove(session_id);
    }
    sessions
        .get_mut(session_id)
        .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
}
