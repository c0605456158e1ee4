use std::sync::Mutex;

use cloudkit_core::{CancelReason, InteractiveResult, ResultKind};
use tokio::sync::oneshot;

struct Pending {
    session_id: String,
    kind: ResultKind,
    tx: oneshot::Sender<InteractiveResult>,
}

/// The single outstanding interactive wait of a coordinator.
///
/// At most one sender lives in the slot. Installing a new one takes the old
/// one out under the same lock and completes it as cancelled.
#[derive(Default)]
pub struct PendingSlot {
    inner: Mutex<Option<Pending>>,
}

impl PendingSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, session_id: &str, kind: ResultKind) -> oneshot::Receiver<InteractiveResult> {
        let (tx, rx) = oneshot::channel();
        let previous = {
            let mut slot = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            slot.replace(Pending {
                session_id: session_id.to_string(),
                kind,
                tx,
            })
        };
        if let Some(previous) = previous {
            tracing::warn!(
                session_id = %previous.session_id,
                superseded_by = %session_id,
                reason = CancelReason::Superseded.as_str(),
                "pending interaction superseded; resolving as cancelled"
            );
            let _ = previous.tx.send(InteractiveResult::cancelled(previous.kind));
        }
        rx
    }

    /// Complete the pending wait with a result built from its expected kind.
    /// Returns the resolved session id, or `None` when nobody was waiting.
    pub fn resolve_with(
        &self,
        build: impl FnOnce(ResultKind) -> InteractiveResult,
    ) -> Option<String> {
        let pending = self.take()?;
        let result = build(pending.kind);
        if pending.tx.send(result).is_err() {
            tracing::debug!(
                session_id = %pending.session_id,
                "pending receiver already dropped"
            );
        }
        Some(pending.session_id)
    }

    pub fn cancel(&self, reason: CancelReason) -> Option<String> {
        let session_id = self.resolve_with(InteractiveResult::cancelled)?;
        tracing::info!(
            session_id = %session_id,
            reason = reason.as_str(),
            "pending interaction cancelled"
        );
        Some(session_id)
    }

    /// Cancel the pending wait only if it still belongs to `session_id`.
    pub fn cancel_if_owned(&self, session_id: &str, reason: CancelReason) -> bool {
        let pending = {
            let mut slot = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            match slot.as_ref() {
                Some(current) if current.session_id == session_id => slot.take(),
                _ => None,
            }
        };
        let Some(pending) = pending else {
            return false;
        };
        tracing::info!(
            session_id = %session_id,
            reason = reason.as_str(),
            "pending interaction cancelled"
        );
        let _ = pending.tx.send(InteractiveResult::cancelled(pending.kind));
        true
    }

    pub fn session_id(&self) -> Option<String> {
        let slot = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_ref().map(|pending| pending.session_id.clone())
    }

    pub fn is_pending(&self) -> bool {
        let slot = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        slot.is_some()
    }

    fn take(&self) -> Option<Pending> {
        let mut slot = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        slot.take()
    }
}
