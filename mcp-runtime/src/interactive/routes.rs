use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use cloudkit_core::{ResultKind, SessionError};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use super::SessionCoordinator;
use super::error::HttpError;
use super::push;
use super::sessions::SessionSnapshot;

#[derive(Clone)]
pub(super) struct RouteState {
    pub coordinator: SessionCoordinator,
    pub shutdown: watch::Receiver<bool>,
    pub port: u16,
}

pub(super) fn router(
    coordinator: SessionCoordinator,
    shutdown: watch::Receiver<bool>,
    port: u16,
) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/env-setup/{session_id}", get(env_setup_page))
        .route("/clarification/{session_id}", get(clarification_page))
        .route("/api/submit", post(submit))
        .route("/api/cancel", post(cancel))
        .route("/api/switch", post(switch))
        .route("/api/retry-init", post(retry_init))
        .route("/api/open-url", post(open_url))
        .route("/ws", get(push::upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(RouteState {
            coordinator,
            shutdown,
            port,
        })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitRequest {
    #[serde(rename = "type")]
    kind: Option<ResultKind>,
    #[serde(default)]
    data: Value,
    session_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActionRequest {
    session_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenUrlRequest {
    url: Option<String>,
}

async fn health(State(state): State<RouteState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "port": state.port,
        "pending": state.coordinator.pending_session_id().is_some(),
    }))
}

async fn env_setup_page(
    State(state): State<RouteState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionSnapshot>, HttpError> {
    session_view(&state, &session_id, "env-setup")
}

async fn clarification_page(
    State(state): State<RouteState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionSnapshot>, HttpError> {
    session_view(&state, &session_id, "clarification")
}

fn session_view(
    state: &RouteState,
    session_id: &str,
    expected: &'static str,
) -> Result<Json<SessionSnapshot>, HttpError> {
    let snapshot = state.coordinator.sessions().snapshot(session_id)?;
    if snapshot.payload.view() != expected {
        return Err(SessionError::WrongKind {
            session_id: session_id.to_string(),
            expected,
        }
        .into());
    }
    Ok(Json(snapshot))
}

async fn submit(State(state): State<RouteState>, body: Bytes) -> Result<Json<Value>, HttpError> {
    let req: SubmitRequest = parse_body(&body)?;
    let success = state
        .coordinator
        .submit(req.kind, req.data, req.session_id.as_deref());
    Ok(Json(json!({ "success": success })))
}

async fn cancel(State(state): State<RouteState>, body: Bytes) -> Result<Json<Value>, HttpError> {
    let req: ActionRequest = parse_body(&body)?;
    let success = state.coordinator.cancel(req.session_id.as_deref());
    Ok(Json(json!({ "success": success })))
}

async fn switch(State(state): State<RouteState>, body: Bytes) -> Result<Json<Value>, HttpError> {
    let req: ActionRequest = parse_body(&body)?;
    let success = state.coordinator.request_switch(req.session_id.as_deref());
    Ok(Json(json!({ "success": success })))
}

async fn retry_init(
    State(state): State<RouteState>,
    body: Bytes,
) -> Result<Json<Value>, HttpError> {
    let req: ActionRequest = parse_body(&body)?;
    let session_id = req.session_id.ok_or_else(|| HttpError::Validation {
        message: "retry-init requires 'sessionId'".to_string(),
        field: Some("sessionId".to_string()),
        received: None,
    })?;
    state.coordinator.retry_init(&session_id).await?;
    Ok(Json(json!({ "success": true })))
}

async fn open_url(State(state): State<RouteState>, body: Bytes) -> Result<Json<Value>, HttpError> {
    let req: OpenUrlRequest = parse_body(&body)?;
    let raw = req.url.unwrap_or_default();
    let parsed = url::Url::parse(raw.trim()).map_err(|e| HttpError::Validation {
        message: format!("Invalid url: {e}"),
        field: Some("url".to_string()),
        received: Some(Value::String(raw.clone())),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(HttpError::Validation {
            message: "Only http(s) URLs can be opened".to_string(),
            field: Some("url".to_string()),
            received: Some(Value::String(raw)),
        });
    }
    let outcome = state.coordinator.open_url(parsed.as_str());
    Ok(Json(json!({
        "success": true,
        "delivery": outcome.as_str(),
    })))
}

/// Empty bodies are accepted as `{}`; pages post bare actions.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, HttpError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| HttpError::Validation {
        message: format!("Invalid JSON body: {e}"),
        field: None,
        received: None,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::config::InteractiveConfig;
    use crate::interactive::delivery::Delivery;
    use crate::interactive::sessions::SessionPayload;

    fn test_router() -> (Router, SessionCoordinator, Arc<std::sync::Mutex<Vec<String>>>) {
        let opened = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = opened.clone();
        let coordinator = SessionCoordinator::new(
            InteractiveConfig::ephemeral(),
            Delivery::with_launcher(move |url| {
                seen.lock().unwrap().push(url.to_string());
                Ok(())
            }),
        );
        let (_tx, rx) = watch::channel(false);
        (router(coordinator.clone(), rx, 0), coordinator, opened)
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.expect("request should succeed");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should read");
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request should build")
    }

    #[tokio::test]
    async fn health_reports_version_and_idle_slot() {
        let (app, _, _) = test_router();
        let (status, body) = send(
            app,
            Request::builder().uri("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(body["pending"], false);
    }

    #[tokio::test]
    async fn unknown_session_page_is_404() {
        let (app, _, _) = test_router();
        let (status, body) = send(
            app,
            Request::builder()
                .uri("/env-setup/nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "session_not_found");
    }

    #[tokio::test]
    async fn clarification_route_rejects_env_setup_sessions() {
        let (app, coordinator, _) = test_router();
        coordinator.sessions().insert(
            "s1",
            SessionPayload::EnvSetup {
                candidates: Vec::new(),
                account: None,
                error_context: None,
                has_collaborator: false,
            },
        );
        let (status, body) = send(
            app.clone(),
            Request::builder()
                .uri("/clarification/s1")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "session_kind_mismatch");

        let (status, body) = send(
            app,
            Request::builder()
                .uri("/env-setup/s1")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sessionId"], "s1");
    }

    #[tokio::test]
    async fn submit_without_pending_wait_reports_failure() {
        let (app, _, _) = test_router();
        let (status, body) = send(
            app,
            post_json("/api/submit", r#"{"type":"environmentSelection","data":{"envId":"x"}}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn empty_cancel_body_is_accepted() {
        let (app, _, _) = test_router();
        let (status, body) = send(app, post_json("/api/cancel", "")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn retry_init_validates_session() {
        let (app, _, _) = test_router();
        let (status, _) = send(app.clone(), post_json("/api/retry-init", "{}")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, body) =
            send(app, post_json("/api/retry-init", r#"{"sessionId":"missing"}"#)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "session_not_found");
    }

    #[tokio::test]
    async fn open_url_runs_delivery_and_rejects_other_schemes() {
        let (app, _, opened) = test_router();
        let (status, body) = send(
            app.clone(),
            post_json("/api/open-url", r#"{"url":"https://console.example.com/env"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["delivery"], "browser_opened");
        assert_eq!(
            opened.lock().unwrap().as_slice(),
            ["https://console.example.com/env".to_string()]
        );

        let (status, body) =
            send(app, post_json("/api/open-url", r#"{"url":"file:///etc/passwd"}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "url");
    }
}
