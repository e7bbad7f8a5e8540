//! WebSocket room subscriptions.
//!
//! A client upgrades on `GET /coordination/runs/{run_id}/ws`, then sends
//! a join frame naming the run and, for participants, its magic token.
//! The join is resolved through the same participant resolver as HTTP
//! requests; after the ack, every room event is streamed as a JSON text
//! frame. Inbound `facilitator:message` frames from a resolved
//! participant are re-published to the room.

use std::sync::Arc;
use std::time::Duration;

use accord_engine::{ParticipantContext, ResolveRequest, RunEvent};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

use super::state::AppState;

/// How long the client has to send its join frame.
const JOIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinFrame {
    #[serde(rename = "type")]
    kind: String,
    run_id: String,
    #[serde(default)]
    token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    body: Option<String>,
}

/// GET /coordination/runs/{run_id}/ws
pub(crate) async fn handle_ws(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| run_socket(socket, state, run_id))
}

async fn run_socket(mut socket: WebSocket, state: Arc<AppState>, run_id: String) {
    let join = match tokio::time::timeout(JOIN_TIMEOUT, socket.recv()).await {
        Ok(Some(Ok(Message::Text(text)))) => {
            match serde_json::from_str::<JoinFrame>(&text) {
                Ok(frame) => frame,
                Err(_) => {
                    let _ = close_with_error(&mut socket, "malformed join frame").await;
                    return;
                }
            }
        }
        _ => {
            let _ = close_with_error(&mut socket, "expected a join frame").await;
            return;
        }
    };

    if join.kind != "joinCoordinationRun" || join.run_id != run_id {
        let _ = close_with_error(&mut socket, "join frame does not match this run").await;
        return;
    }
    if state.engine.run_view(&run_id).await.is_err() {
        let _ = close_with_error(&mut socket, "run not found").await;
        return;
    }

    let context = state
        .engine
        .resolver()
        .resolve(&ResolveRequest {
            run_id: Some(run_id.clone()),
            magic_token: join.token,
            session_user: None,
        })
        .await;
    let role = context.role().map(|r| r.to_string());
    let permissions = state
        .engine
        .context_permissions(&run_id, &context)
        .await
        .unwrap_or_default();

    let ack = serde_json::json!({
        "event": "joined",
        "data": {"run_id": run_id, "role": role, "permissions": permissions},
    });
    if send_json(&mut socket, &ack).await.is_err() {
        return;
    }
    tracing::debug!(run_id, ?role, "websocket joined room");

    let mut events = state.engine.rooms().subscribe(&run_id);
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let Ok(text) = serde_json::to_string(&event) else { continue };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                // Dropped frames under lag are acceptable; the states
                // endpoint is the catch-up path.
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(run_id, skipped, "websocket subscriber lagging");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    handle_inbound(&state, &run_id, &context, &text);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }
    tracing::debug!(run_id, "websocket left room");
}

/// Re-publish a facilitator message from an authorized socket.
fn handle_inbound(state: &AppState, run_id: &str, context: &ParticipantContext, text: &str) {
    let Ok(frame) = serde_json::from_str::<InboundFrame>(text) else {
        return;
    };
    if frame.kind != "facilitator:message" {
        return;
    }
    let ParticipantContext::Participant(p) = context else {
        return;
    };
    let Some(body) = frame.body else { return };
    state.engine.rooms().publish(
        run_id,
        RunEvent::Message {
            run_id: run_id.to_string(),
            from_participant: p.id.clone(),
            body,
        },
    );
}

async fn send_json(socket: &mut WebSocket, value: &serde_json::Value) -> Result<(), axum::Error> {
    socket.send(Message::Text(value.to_string().into())).await
}

async fn close_with_error(socket: &mut WebSocket, message: &str) -> Result<(), axum::Error> {
    let frame = serde_json::json!({
        "event": "error",
        "data": {"message": message},
    });
    send_json(socket, &frame).await?;
    socket.send(Message::Close(None)).await
}
