use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use cloudkit_core::SessionError;
use cloudkit_core::error::{self, ApiError};

/// Errors of the local interaction endpoints, rendered as structured JSON.
#[derive(Debug)]
pub enum HttpError {
    /// Malformed request body or parameters (400)
    Validation {
        message: String,
        field: Option<String>,
        received: Option<serde_json::Value>,
    },
    /// Unknown, expired or mismatched session id (404 / 400)
    Session(SessionError),
    /// Internal error (500)
    Internal(String),
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let request_id = uuid::Uuid::now_v7().to_string();

        let (status, api_error) = match self {
            HttpError::Validation {
                message,
                field,
                received,
            } => (
                StatusCode::BAD_REQUEST,
                ApiError {
                    error: error::codes::VALIDATION_FAILED.to_string(),
                    message,
                    field,
                    received,
                    request_id,
                    docs_hint: None,
                },
            ),
            HttpError::Session(err) => {
                tracing::info!(error = %err, "interactive session lookup rejected");
                let (status, code) = match &err {
                    SessionError::NotFound(_) => {
                        (StatusCode::NOT_FOUND, error::codes::SESSION_NOT_FOUND)
                    }
                    SessionError::WrongKind { .. } => {
                        (StatusCode::BAD_REQUEST, error::codes::SESSION_KIND_MISMATCH)
                    }
                };
                (
                    status,
                    ApiError {
                        error: code.to_string(),
                        message: err.to_string(),
                        field: Some("sessionId".to_string()),
                        received: None,
                        request_id,
                        docs_hint: Some(
                            "Sessions expire five minutes after they are opened. \
                             Ask the assistant to start the interaction again."
                                .to_string(),
                        ),
                    },
                )
            }
            HttpError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiError {
                        error: error::codes::INTERNAL_ERROR.to_string(),
                        message: "An internal error occurred".to_string(),
                        field: None,
                        received: None,
                        request_id,
                        docs_hint: None,
                    },
                )
            }
        };

        (status, Json(api_error)).into_response()
    }
}

impl From<SessionError> for HttpError {
    fn from(err: SessionError) -> Self {
        HttpError::Session(err)
    }
}
