use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Structured error body returned by the local interaction endpoints.
/// Carries enough detail for the page (or an agent) to tell what went wrong.
#[derive(Debug, Serialize)]
pub struct ApiError {
    /// Machine-readable error code (e.g. "session_not_found")
    pub error: String,
    /// Human/agent-readable description of what went wrong
    pub message: String,
    /// Which field caused the error (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// The value that was received (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received: Option<serde_json::Value>,
    /// Request ID for tracing and debugging
    pub request_id: String,
    /// Hint about what the correct usage looks like
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docs_hint: Option<String>,
}

/// Error codes used by the local endpoints and tool envelopes
pub mod codes {
    pub const VALIDATION_FAILED: &str = "validation_failed";
    pub const SESSION_NOT_FOUND: &str = "session_not_found";
    pub const SESSION_KIND_MISMATCH: &str = "session_kind_mismatch";
    pub const INTERNAL_ERROR: &str = "internal_error";
    pub const BIND_FAILED: &str = "interactive_bind_failed";
    pub const ENV_RESOLVE_TIMEOUT: &str = "env_resolve_timeout";
    pub const ENV_RESOLVE_FAILED: &str = "env_resolve_failed";
}

/// One failed bind attempt.
#[derive(Debug, Clone)]
pub struct BindAttempt {
    pub port: u16,
    pub reason: String,
}

/// Every candidate port was tried and none could be bound.
#[derive(Debug, Clone, Error)]
#[error("no interactive port available after trying {}", describe_attempts(.attempts))]
pub struct BindError {
    pub attempts: Vec<BindAttempt>,
}

impl BindError {
    pub fn attempted_ports(&self) -> Vec<u16> {
        self.attempts.iter().map(|attempt| attempt.port).collect()
    }
}

fn describe_attempts(attempts: &[BindAttempt]) -> String {
    if attempts.is_empty() {
        return "no candidates".to_string();
    }
    attempts
        .iter()
        .map(|attempt| format!("{} ({})", attempt.port, attempt.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Failure of an environment id resolution. Cloned to every joined waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("environment resolution timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("environment resolution failed: {0}")]
    Fetch(String),
}

impl ResolveError {
    pub fn code(&self) -> &'static str {
        match self {
            ResolveError::Timeout(_) => codes::ENV_RESOLVE_TIMEOUT,
            ResolveError::Fetch(_) => codes::ENV_RESOLVE_FAILED,
        }
    }
}

/// Unknown, expired or mismatched session ids. Handled at the HTTP edge.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session '{0}' not found or expired")]
    NotFound(String),
    #[error("session '{session_id}' is not a {expected} session")]
    WrongKind {
        session_id: String,
        expected: &'static str,
    },
}

/// Why a pending wait was completed as cancelled. Only ever logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    UserCancelled,
    TimedOut,
    Superseded,
}

impl CancelReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CancelReason::UserCancelled => "user_cancelled",
            CancelReason::TimedOut => "timed_out",
            CancelReason::Superseded => "superseded",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_error_lists_every_attempt_in_order() {
        let err = BindError {
            attempts: vec![
                BindAttempt {
                    port: 3721,
                    reason: "address in use".to_string(),
                },
                BindAttempt {
                    port: 3722,
                    reason: "permission denied".to_string(),
                },
            ],
        };
        assert_eq!(err.attempted_ports(), vec![3721, 3722]);
        let message = err.to_string();
        assert!(message.contains("3721 (address in use), 3722 (permission denied)"));
    }

    #[test]
    fn resolve_error_codes_distinguish_timeout_from_fetch() {
        assert_eq!(
            ResolveError::Timeout(Duration::from_secs(600)).code(),
            codes::ENV_RESOLVE_TIMEOUT
        );
        assert_eq!(
            ResolveError::Fetch("boom".to_string()).code(),
            codes::ENV_RESOLVE_FAILED
        );
        assert_eq!(
            ResolveError::Timeout(Duration::from_secs(600)).to_string(),
            "environment resolution timed out after 600s"
        );
    }
}
