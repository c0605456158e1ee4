use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use cloudkit_core::ResultKind;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::routes::RouteState;
use super::sessions::LiveChannel;

pub(super) async fn upgrade(ws: WebSocketUpgrade, State(state): State<RouteState>) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(socket: WebSocket, state: RouteState) {
    let connection_id = Uuid::now_v7();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let mut shutdown = state.shutdown.clone();
    tracing::debug!(%connection_id, "push channel connected");

    // Single select loop; the coordinator's stop signal ends it before the HTTP layer goes down.
    while !*shutdown.borrow() {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            outbound = rx.recv() => {
                let Some(text) = outbound else { break };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_message(&state, connection_id, &tx, text.as_str()).await;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.coordinator.sessions().detach_connection(connection_id);
    let _ = sender.send(Message::Close(None)).await;
    tracing::debug!(%connection_id, "push channel closed");
}

async fn handle_message(
    state: &RouteState,
    connection_id: Uuid,
    tx: &mpsc::UnboundedSender<String>,
    raw: &str,
) {
    let message: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(%connection_id, error = %err, "ignoring malformed push message");
            reply(tx, json!({ "type": "error", "error": "invalid_json" }));
            return;
        }
    };
    let message_type = message
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let coordinator = &state.coordinator;
    let bound_session = coordinator.sessions().session_for_connection(connection_id);
    let session_id = message
        .get("sessionId")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or(bound_session);

    match message_type.as_str() {
        "registerSession" => {
            let Some(session_id) = session_id else {
                reply(tx, json!({ "type": "error", "error": "session_id_required" }));
                return;
            };
            let channel = LiveChannel {
                connection_id,
                tx: tx.clone(),
            };
            match coordinator.register_channel(&session_id, channel) {
                Ok(()) => reply(
                    tx,
                    json!({ "type": "sessionRegistered", "sessionId": session_id }),
                ),
                Err(err) => {
                    tracing::info!(%connection_id, session_id = %session_id, error = %err, "push registration rejected");
                    reply(
                        tx,
                        json!({ "type": "error", "error": "session_not_found", "sessionId": session_id }),
                    );
                }
            }
        }
        "refreshEnvList" => {
            let Some(session_id) = session_id else {
                tracing::warn!(%connection_id, action = "refreshEnvList", "no session bound to push channel; ignored");
                return;
            };
            if let Err(err) = coordinator.refresh_env_list(&session_id).await {
                tracing::warn!(session_id = %session_id, error = %err, "env list refresh failed");
                reply(
                    tx,
                    json!({
                        "type": "envListError",
                        "sessionId": session_id,
                        "message": err.to_string(),
                    }),
                );
            }
        }
        "cancel" => {
            coordinator.cancel(session_id.as_deref());
        }
        "switch" | "switchAccount" => {
            coordinator.request_switch(session_id.as_deref());
        }
        other => {
            let kind = serde_json::from_value::<ResultKind>(Value::String(other.to_string())).ok();
            let data = message.get("data").cloned().unwrap_or_else(|| message.clone());
            if !coordinator.submit(kind, data, session_id.as_deref()) {
                tracing::debug!(%connection_id, action = %other, "push message had no pending resolver");
            }
        }
    }
}

fn reply(tx: &mpsc::UnboundedSender<String>, value: Value) {
    let _ = tx.send(value.to_string());
}
