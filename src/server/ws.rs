use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;

use super::AppState;
use super::middleware::ws_authorized;
use crate::error::ws_close;
use crate::session::{CreateSessionRequest, SessionMode};

const METRICS_BROADCAST_INTERVAL: Duration = Duration::from_secs(2);
/// Attachments above this size are rejected rather than written.
const MAX_ATTACHMENT_BYTES: usize = 10 * 1024 * 1024;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsQuery {
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub internal_key: Option<String>,
    pub token: Option<String>,
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

fn authorized(state: &AppState, query: &WsQuery) -> bool {
    ws_authorized(
        state.config.internal_api_key.as_deref(),
        query.internal_key.as_deref(),
        query.token.as_deref(),
    )
}

// ---------------------------------------------------------------------------
// /ws/terminal — raw PTY bytes
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ResizeFrame {
    #[serde(rename = "type")]
    frame_type: String,
    cols: u16,
    rows: u16,
}

pub async fn terminal_ws(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_terminal(socket, state, query))
}

async fn handle_terminal(socket: WebSocket, state: AppState, query: WsQuery) {
    if !authorized(&state, &query) {
        return close_with(socket, ws_close::UNAUTHORIZED, "unauthorized").await;
    }
    let Some(session_id) = query.session_id.clone() else {
        return close_with(socket, ws_close::MISSING_PARAMETER, "sessionId required").await;
    };

    let mut output_rx = match state.sessions.subscribe_raw(&session_id).await {
        Ok(rx) => rx,
        Err(_) => {
            return close_with(socket, ws_close::SESSION_UNAVAILABLE, "session not available")
                .await;
        }
    };

    let (mut ws_sink, mut ws_stream) = socket.split();

    // PTY broadcast -> WS. A lagged subscriber is dropped rather than
    // allowed to stall the PTY reader.
    let forward = tokio::spawn(async move {
        loop {
            match output_rx.recv().await {
                Ok(data) => {
                    if ws_sink.send(Message::Binary(data.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "terminal subscriber lagged, closing");
                    let _ = ws_sink
                        .send(Message::Close(Some(CloseFrame {
                            code: ws_close::SESSION_UNAVAILABLE,
                            reason: "subscriber too slow".into(),
                        })))
                        .await;
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    let _ = ws_sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    // WS -> PTY: binary verbatim; text frames are resize controls or
    // keystrokes.
    while let Some(Ok(message)) = ws_stream.next().await {
        match message {
            Message::Binary(data) => {
                if state.sessions.write(&session_id, &data).await.is_err() {
                    break;
                }
            }
            Message::Text(text) => {
                if let Ok(frame) = serde_json::from_str::<ResizeFrame>(&text) {
                    if frame.frame_type == "resize" {
                        let _ = state
                            .sessions
                            .resize(&session_id, frame.cols, frame.rows)
                            .await;
                        continue;
                    }
                }
                if state
                    .sessions
                    .write(&session_id, text.as_bytes())
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    forward.abort();
    tracing::debug!(session_id = %session_id, "terminal WebSocket disconnected");
}

// ---------------------------------------------------------------------------
// /ws/events — structured event stream
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum EventsClientFrame {
    UserMessage {
        content: String,
        #[serde(default)]
        attachments: Vec<Attachment>,
    },
    StopExecution,
}

#[derive(Deserialize)]
struct Attachment {
    name: String,
    /// Base64 payload.
    data: String,
}

pub async fn events_ws(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events(socket, state, query))
}

async fn handle_events(socket: WebSocket, state: AppState, query: WsQuery) {
    if !authorized(&state, &query) {
        return close_with(socket, ws_close::UNAUTHORIZED, "unauthorized").await;
    }
    let Some(user_id) = query.user_id.clone() else {
        return close_with(socket, ws_close::MISSING_PARAMETER, "userId required").await;
    };

    let session = match resolve_session(&state, &user_id, &query).await {
        Ok(session) => session,
        Err(reason) => {
            return close_with(socket, ws_close::SESSION_UNAVAILABLE, &reason).await;
        }
    };
    let session_id = session.id.clone();

    let mut events_rx = match state.sessions.subscribe_events(&session_id).await {
        Ok(rx) => rx,
        Err(_) => {
            // Session resolved but its event pipeline is gone.
            return close_with(socket, ws_close::SUBSYSTEM_UNAVAILABLE, "events unavailable")
                .await;
        }
    };
    let raw_rx = state.sessions.subscribe_raw(&session_id).await.ok();

    let (ws_sink, mut ws_stream) = socket.split();
    let sink = std::sync::Arc::new(tokio::sync::Mutex::new(ws_sink));

    // Structured events -> WS.
    let forward_sink = sink.clone();
    let forward = tokio::spawn(async move {
        loop {
            match events_rx.recv().await {
                Ok(event) => {
                    let Ok(payload) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if forward_sink
                        .lock()
                        .await
                        .send(Message::Text(payload.into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "events subscriber lagged, closing");
                    let _ = forward_sink
                        .lock()
                        .await
                        .send(Message::Close(Some(CloseFrame {
                            code: ws_close::SESSION_UNAVAILABLE,
                            reason: "subscriber too slow".into(),
                        })))
                        .await;
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    let _ = forward_sink.lock().await.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    // Raw-output passthrough alongside the structured stream.
    let raw_forward = raw_rx.map(|mut rx| {
        let raw_sink = sink.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(chunk) => {
                        let payload = json!({
                            "type": "raw_output",
                            "data": String::from_utf8_lossy(&chunk),
                        });
                        if raw_sink
                            .lock()
                            .await
                            .send(Message::Text(payload.to_string().into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    });

    while let Some(Ok(message)) = ws_stream.next().await {
        let Message::Text(text) = message else {
            if matches!(message, Message::Close(_)) {
                break;
            }
            continue;
        };
        let frame = match serde_json::from_str::<EventsClientFrame>(&text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(error = %e, "unparseable events frame");
                continue;
            }
        };
        match frame {
            EventsClientFrame::UserMessage {
                content,
                attachments,
            } => {
                if !attachments.is_empty() {
                    save_attachments(&state, &session_id, &attachments).await;
                }
                if let Err(e) = state.sessions.send_user_message(&session_id, &content).await {
                    tracing::warn!(error = %e, "user message write failed");
                    break;
                }
            }
            EventsClientFrame::StopExecution => {
                if let Err(e) = state.sessions.interrupt(&session_id).await {
                    tracing::warn!(error = %e, "interrupt write failed");
                }
            }
        }
    }

    forward.abort();
    if let Some(task) = raw_forward {
        task.abort();
    }
    tracing::debug!(session_id = %session_id, "events WebSocket disconnected");
}

/// Find the user's session, honouring the requested mode: a token implies
/// api mode, its absence implies ollama. A mode mismatch stops the old
/// session and creates a replacement.
async fn resolve_session(
    state: &AppState,
    user_id: &str,
    query: &WsQuery,
) -> Result<crate::session::Session, String> {
    let requested_mode = if query.token.is_some() {
        SessionMode::Api
    } else {
        SessionMode::Ollama
    };

    if let Some(session_id) = &query.session_id {
        return state
            .sessions
            .get(session_id)
            .await
            .filter(|s| s.user_id == user_id)
            .ok_or_else(|| format!("session {session_id} not available"));
    }

    if let Some(existing) = state.sessions.running_session_for_user(user_id).await {
        if existing.mode == requested_mode {
            return Ok(existing);
        }
        tracing::info!(
            user_id,
            old = ?existing.mode,
            new = ?requested_mode,
            "session mode mismatch, replacing session"
        );
        state
            .sessions
            .stop(&existing.id)
            .await
            .map_err(|e| e.to_string())?;
    }

    state
        .sessions
        .create(CreateSessionRequest {
            user_id: user_id.to_string(),
            api_key: query.token.clone().filter(|_| requested_mode == SessionMode::Api),
            ..Default::default()
        })
        .await
        .map_err(|e| e.to_string())
}

/// Decode base64 attachments into `{workspace}/uploads/`. File names are
/// flattened to their final component to keep writes inside the workspace.
async fn save_attachments(state: &AppState, session_id: &str, attachments: &[Attachment]) {
    let Some(session) = state.sessions.get(session_id).await else {
        return;
    };
    let uploads = session.workspace_path.join("uploads");
    if let Err(e) = tokio::fs::create_dir_all(&uploads).await {
        tracing::warn!(error = %e, "uploads dir creation failed");
        return;
    }

    for attachment in attachments {
        let name = std::path::Path::new(&attachment.name)
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| "attachment".to_string());

        let bytes = match base64::engine::general_purpose::STANDARD.decode(&attachment.data) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(name = %name, error = %e, "attachment decode failed");
                continue;
            }
        };
        if bytes.len() > MAX_ATTACHMENT_BYTES {
            tracing::warn!(name = %name, size = bytes.len(), "attachment too large, skipping");
            continue;
        }
        if let Err(e) = tokio::fs::write(uploads.join(&name), bytes).await {
            tracing::warn!(name = %name, error = %e, "attachment write failed");
        }
    }
}

// ---------------------------------------------------------------------------
// /ws/metrics — live system snapshots
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum MetricsClientFrame {
    SubscribeSession {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}

pub async fn metrics_ws(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_metrics(socket, state, query))
}

async fn handle_metrics(socket: WebSocket, state: AppState, query: WsQuery) {
    if !authorized(&state, &query) {
        return close_with(socket, ws_close::UNAUTHORIZED, "unauthorized").await;
    }

    let (mut ws_sink, mut ws_stream) = socket.split();
    let mut ticker = tokio::time::interval(METRICS_BROADCAST_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let sessions = state.sessions.list().await;
                let pids: Vec<Option<i32>> = sessions
                    .iter()
                    .filter(|s| matches!(s.status, crate::session::SessionStatus::Running))
                    .map(|s| s.pid.map(|p| p as i32))
                    .collect();
                let snapshot = state.sessions.metrics().aggregate(&pids);
                let payload = json!({
                    "type": "system_metrics",
                    "metrics": snapshot,
                });
                if ws_sink.send(Message::Text(payload.to_string().into())).await.is_err() {
                    break;
                }
            }
            inbound = ws_stream.next() => {
                let Some(Ok(message)) = inbound else { break };
                let Message::Text(text) = message else {
                    if matches!(message, Message::Close(_)) { break; }
                    continue;
                };
                let Ok(MetricsClientFrame::SubscribeSession { session_id }) =
                    serde_json::from_str::<MetricsClientFrame>(&text)
                else {
                    continue;
                };

                let response = match state.sessions.get(&session_id).await {
                    Some(session) => {
                        let process = session
                            .pid
                            .and_then(|pid| state.sessions.metrics().sample_pid(pid as i32));
                        json!({
                            "type": "session_metrics",
                            "sessionId": session_id,
                            "process": process,
                            "tokens": state.sessions.metrics().token_usage(&session_id),
                            "storage": crate::metrics::workspace_usage(&session.workspace_path),
                        })
                    }
                    None => json!({
                        "type": "error",
                        "error": format!("session {session_id} not found"),
                    }),
                };
                if ws_sink.send(Message::Text(response.to_string().into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_parse() {
        let frame: EventsClientFrame = serde_json::from_str(
            r#"{"type":"user_message","content":"hi","attachments":[{"name":"a.txt","data":"aGk="}]}"#,
        )
        .unwrap();
        match frame {
            EventsClientFrame::UserMessage {
                content,
                attachments,
            } => {
                assert_eq!(content, "hi");
                assert_eq!(attachments.len(), 1);
                assert_eq!(attachments[0].name, "a.txt");
            }
            _ => panic!("wrong frame"),
        }

        let frame: EventsClientFrame =
            serde_json::from_str(r#"{"type":"stop_execution"}"#).unwrap();
        assert!(matches!(frame, EventsClientFrame::StopExecution));
    }

    #[test]
    fn resize_frame_parses() {
        let frame: ResizeFrame =
            serde_json::from_str(r#"{"type":"resize","cols":100,"rows":30}"#).unwrap();
        assert_eq!(frame.frame_type, "resize");
        assert_eq!(frame.cols, 100);
        assert_eq!(frame.rows, 30);
    }

    #[test]
    fn metrics_subscribe_frame_parses() {
        let frame: MetricsClientFrame =
            serde_json::from_str(r#"{"type":"subscribe_session","sessionId":"s1"}"#).unwrap();
        let MetricsClientFrame::SubscribeSession { session_id } = frame;
        assert_eq!(session_id, "s1");
    }
}
