//! Session-scoped WebSocket endpoint.
//!
//! The subscriber side streams `connected` / replay / live frames from the
//! broadcaster; the sender side interprets client frames as agent commands
//! or native tool responses. Unknown command types get an `error` frame and
//! the socket stays open. A subscriber disconnect never touches the
//! supervisor.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use moor_shared::models::wire::{ClientCommand, synthetic_response};

use crate::state::AppState;
use crate::supervisor::ChannelSupervisor;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsQuery {
    #[serde(default)]
    pub last_seq: i64,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, id, query.last_seq))
}

async fn send_json(sink: &mut SplitSink<WebSocket, Message>, value: Value) -> Result<(), ()> {
    sink.send(Message::Text(value.to_string().into()))
        .await
        .map_err(|_| ())
}

async fn close(sink: &mut SplitSink<WebSocket, Message>, code: u16) {
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: "".into(),
        })))
        .await;
}

async fn handle_socket(socket: WebSocket, state: AppState, session_id: String, last_seq: i64) {
    let (mut sink, mut inbound) = socket.split();

    // The first subscriber (or first command) instantiates the supervisor.
    let supervisor = match state.supervisors.get_or_create(&session_id).await {
        Ok(supervisor) => supervisor,
        Err(error) => {
            let _ = send_json(
                &mut sink,
                json!({"type": "error", "code": error.code(), "message": error.to_string()}),
            )
            .await;
            close(&mut sink, close_code::ERROR).await;
            return;
        }
    };

    let broadcaster = state.broadcasters.get(&session_id).await;
    let mut stream = match broadcaster.subscribe(last_seq).await {
        Ok(stream) => stream,
        Err(error) => {
            let _ = send_json(
                &mut sink,
                json!({"type": "error", "code": "INTERNAL", "message": error.to_string()}),
            )
            .await;
            close(&mut sink, close_code::ERROR).await;
            return;
        }
    };

    // RPC responses addressed to this subscriber only.
    let (reply_tx, mut reply_rx) = mpsc::channel::<Value>(32);

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(frame) => {
                    if send_json(&mut sink, frame.to_json()).await.is_err() {
                        break;
                    }
                }
                None => {
                    close(&mut sink, close_code::NORMAL).await;
                    break;
                }
            },
            reply = reply_rx.recv() => {
                if let Some(reply) = reply {
                    if send_json(&mut sink, reply).await.is_err() {
                        break;
                    }
                }
            }
            message = inbound.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    handle_client_frame(&state, &session_id, &supervisor, &reply_tx, text.as_str())
                        .await;
                }
                Some(Ok(Message::Ping(payload))) => {
                    if sink.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // binary frames ignored
                Some(Err(error)) => {
                    tracing::debug!(session_id, %error, "websocket recv error");
                    break;
                }
            }
        }
    }

    tracing::debug!(session_id, "websocket subscriber disconnected");
}

async fn handle_client_frame(
    state: &AppState,
    session_id: &str,
    supervisor: &Arc<ChannelSupervisor>,
    reply_tx: &mpsc::Sender<Value>,
    text: &str,
) {
    let command = match serde_json::from_str::<ClientCommand>(text) {
        Ok(command) => command,
        Err(error) => {
            let _ = reply_tx
                .send(json!({
                    "type": "error",
                    "code": "unknown_command",
                    "message": format!("unrecognized client frame: {error}"),
                }))
                .await;
            return;
        }
    };

    let _ = state.sessions.touch(session_id);

    match &command {
        ClientCommand::NativeToolResponse { .. } => {
            if let Ok(line) = serde_json::to_string(&command) {
                supervisor.send_line(line).await;
            }
        }
        ClientCommand::Abort { .. } => {
            supervisor.abort().await;
        }
        ClientCommand::Prompt { .. } => {
            if let Err(error) = state.sessions.mark_running(session_id) {
                tracing::warn!(session_id, %error, "prompt on a session that cannot run");
            }
            if let Ok(value) = serde_json::to_value(&command) {
                supervisor.send(value).await;
            }
        }
        _ if command.expects_response() => {
            if let ClientCommand::SetModel {
                provider, model_id, ..
            } = &command
            {
                let _ = state
                    .store
                    .set_session_model(session_id, provider, model_id);
            }

            let name = command.command_name().to_string();
            let id = command.id().map(str::to_string);
            let value = serde_json::to_value(&command).unwrap_or(Value::Null);
            let supervisor = supervisor.clone();
            let reply_tx = reply_tx.clone();
            tokio::spawn(async move {
                let frame = match supervisor.call(&name, value).await {
                    Ok(frame) => frame,
                    Err(error) => synthetic_response(&name, id.as_deref(), &error.to_string()),
                };
                let _ = reply_tx.send(frame).await;
            });
        }
        _ => {
            if let Ok(value) = serde_json::to_value(&command) {
                supervisor.send(value).await;
            }
        }
    }
}
