use axum::Json;
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use hyper::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};

use super::AppState;
use crate::error::Error;
use crate::session::CreateSessionRequest;

/// GET /health — unauthenticated liveness.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "activeSessions": state.sessions.active_count().await,
    }))
}

pub async fn not_found(req: axum::extract::Request) -> impl IntoResponse {
    tracing::warn!("unhandled path: {}", req.uri());
    (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" })))
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionBody {
    pub user_id: String,
    pub workspace_path: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub storage_limit_mb: Option<u64>,
}

/// POST /sessions — create, or return the user's running session.
pub async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> Result<Json<Value>, Error> {
    if body.user_id.trim().is_empty() {
        return Err(Error::StateInvalid("userId is required".into()));
    }

    if let Some(existing) = state.sessions.running_session_for_user(&body.user_id).await {
        return Ok(Json(json!({
            "sessionId": existing.id,
            "status": "existing",
            "session": existing,
        })));
    }

    let session = state
        .sessions
        .create(CreateSessionRequest {
            user_id: body.user_id,
            workspace_path: body.workspace_path.map(Into::into),
            model: body.model,
            api_key: body.api_key,
            storage_limit_mb: body.storage_limit_mb,
        })
        .await?;

    Ok(Json(json!({
        "sessionId": session.id,
        "status": "created",
        "session": session,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    #[serde(default)]
    pub include_metrics: bool,
    #[serde(default)]
    pub include_output: bool,
}

/// GET /sessions — all sessions, optionally with per-session metrics and
/// the rolling output buffer.
pub async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<Value> {
    let sessions = state.sessions.list().await;
    let mut entries = Vec::with_capacity(sessions.len());
    for session in sessions {
        let mut entry = serde_json::to_value(&session).unwrap_or_default();
        if let Some(activity) = state.sessions.activity(&session.id).await {
            entry["currentActivity"] = json!(activity);
        }
        if query.include_output {
            entry["recentOutput"] = json!(state.sessions.output_buffer(&session.id).await);
        }
        if query.include_metrics {
            if let Some(pid) = session.pid {
                entry["metrics"] = json!(state.sessions.metrics().sample_pid(pid as i32));
            }
        }
        entries.push(entry);
    }
    Json(json!({ "sessions": entries }))
}

/// GET /sessions/:id
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, Error> {
    let session = state
        .sessions
        .get(&id)
        .await
        .ok_or_else(|| Error::NotFound(format!("session {id}")))?;
    Ok(Json(json!({ "session": session })))
}

/// GET /users/:userId/sessions
pub async fn list_user_sessions(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Json<Value> {
    Json(json!({ "sessions": state.sessions.list_for_user(&user_id).await }))
}

/// DELETE /sessions/:id — stops the session and any bound IDE.
pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, Error> {
    state.sessions.stop(&id).await?;
    Ok(Json(json!({ "status": "stopping" })))
}

/// POST /sessions/:id/restart
pub async fn restart_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, Error> {
    let session = state.sessions.restart(&id).await?;
    Ok(Json(json!({
        "sessionId": session.id,
        "session": session,
    })))
}

#[derive(Deserialize)]
pub struct MessageBody {
    pub message: String,
}

/// POST /sessions/:id/messages — legacy: write a line, collect a
/// bounded-time response. Completion detection is a quiet-period
/// heuristic; the structured events channel is the reliable surface.
pub async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<MessageBody>,
) -> Result<Json<Value>, Error> {
    if body.message.trim().is_empty() {
        return Err(Error::StateInvalid("message is required".into()));
    }
    let response = state.sessions.collect_response(&id, &body.message).await?;
    Ok(Json(json!({ "response": response })))
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// GET /sessions/:id/metrics
pub async fn session_metrics(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, Error> {
    let session = state
        .sessions
        .get(&id)
        .await
        .ok_or_else(|| Error::NotFound(format!("session {id}")))?;

    let process = session
        .pid
        .and_then(|pid| state.sessions.metrics().sample_pid(pid as i32));
    Ok(Json(json!({
        "sessionId": id,
        "process": process,
        "tokens": state.sessions.metrics().token_usage(&id),
    })))
}

/// GET /sessions/:id/metrics/enhanced — adds the workspace walk.
pub async fn enhanced_metrics(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, Error> {
    let session = state
        .sessions
        .get(&id)
        .await
        .ok_or_else(|| Error::NotFound(format!("session {id}")))?;

    let process = session
        .pid
        .and_then(|pid| state.sessions.metrics().sample_pid(pid as i32));
    let storage = crate::metrics::workspace_usage(&session.workspace_path);
    Ok(Json(json!({
        "sessionId": id,
        "status": session.status,
        "process": process,
        "tokens": state.sessions.metrics().token_usage(&id),
        "storage": storage,
        "activity": state.sessions.translator_activity(&id).await,
    })))
}

/// GET /sessions/all/metrics/enhanced
pub async fn all_enhanced_metrics(State(state): State<AppState>) -> Json<Value> {
    let sessions = state.sessions.list().await;
    let mut entries = Vec::with_capacity(sessions.len());
    for session in sessions {
        let process = session
            .pid
            .and_then(|pid| state.sessions.metrics().sample_pid(pid as i32));
        entries.push(json!({
            "sessionId": session.id,
            "userId": session.user_id,
            "status": session.status,
            "process": process,
            "tokens": state.sessions.metrics().token_usage(&session.id),
            "storage": crate::metrics::workspace_usage(&session.workspace_path),
        }));
    }
    Json(json!({ "sessions": entries }))
}

/// GET /metrics/system
pub async fn system_metrics(State(state): State<AppState>) -> Json<Value> {
    let pids: Vec<Option<i32>> = state
        .sessions
        .list()
        .await
        .iter()
        .filter(|s| matches!(s.status, crate::session::SessionStatus::Running))
        .map(|s| s.pid.map(|p| p as i32))
        .collect();
    Json(json!(state.sessions.metrics().aggregate(&pids)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokensBody {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub model: Option<String>,
}

/// POST /sessions/:id/tokens
pub async fn record_tokens(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<TokensBody>,
) -> Result<Json<Value>, Error> {
    let session = state
        .sessions
        .get(&id)
        .await
        .ok_or_else(|| Error::NotFound(format!("session {id}")))?;
    let model = body.model.unwrap_or(session.model);
    let usage = state.sessions.metrics().record_tokens(
        &id,
        body.input_tokens,
        body.output_tokens,
        Some(&model),
    );
    Ok(Json(json!({ "tokens": usage })))
}

// ---------------------------------------------------------------------------
// IDE (code-server)
// ---------------------------------------------------------------------------

/// POST /sessions/:id/code-server
pub async fn start_code_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, Error> {
    let session = state
        .sessions
        .get(&id)
        .await
        .ok_or_else(|| Error::NotFound(format!("session {id}")))?;
    if !matches!(session.status, crate::session::SessionStatus::Running) {
        return Err(Error::StateInvalid(format!(
            "session {id} is not running"
        )));
    }

    // The sandbox user record lives with the session manager; reuse the
    // binding when present so the IDE drops privileges too.
    let instance = state
        .sessions
        .start_ide(&id)
        .await?;
    Ok(Json(json!({ "codeServer": instance })))
}

/// GET /sessions/:id/code-server
pub async fn get_code_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, Error> {
    let instance = state
        .sessions
        .ide()
        .get(&id)
        .await
        .ok_or_else(|| Error::NotFound(format!("no IDE for session {id}")))?;
    Ok(Json(json!({ "codeServer": instance })))
}

/// DELETE /sessions/:id/code-server
pub async fn stop_code_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<Value> {
    state.sessions.ide().stop(&id).await;
    Json(json!({ "status": "stopped" }))
}

/// GET /code-servers
pub async fn list_code_servers(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "codeServers": state.sessions.ide().list().await }))
}

// ---------------------------------------------------------------------------
// Workspace sync
// ---------------------------------------------------------------------------

/// POST /sessions/:id/sync — explicit full sync to the cloud.
pub async fn sync_workspace(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, Error> {
    let uploaded = state.sessions.workspaces().force_sync_to_cloud(&id).await?;
    Ok(Json(json!({ "filesUploaded": uploaded })))
}

/// GET /workspace/sync/status
pub async fn sync_status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "activeWorkspaces": state.sessions.workspaces().active_count().await,
    }))
}
