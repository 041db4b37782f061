pub mod middleware;
mod routes;
mod ws;

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post};
use hyper::header;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::session::SessionManager;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionManager>,
}

pub fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(vec![header::CONTENT_TYPE, header::AUTHORIZATION]);

    let control_plane = Router::new()
        .route("/sessions", post(routes::create_session).get(routes::list_sessions))
        .route("/sessions/{id}", get(routes::get_session).delete(routes::delete_session))
        .route("/users/{user_id}/sessions", get(routes::list_user_sessions))
        .route("/sessions/{id}/restart", post(routes::restart_session))
        .route("/sessions/{id}/messages", post(routes::send_message))
        .route("/sessions/all/metrics/enhanced", get(routes::all_enhanced_metrics))
        .route("/sessions/{id}/metrics", get(routes::session_metrics))
        .route("/sessions/{id}/metrics/enhanced", get(routes::enhanced_metrics))
        .route("/metrics/system", get(routes::system_metrics))
        .route("/sessions/{id}/tokens", post(routes::record_tokens))
        .route(
            "/sessions/{id}/code-server",
            post(routes::start_code_server)
                .get(routes::get_code_server)
                .delete(routes::stop_code_server),
        )
        .route("/code-servers", get(routes::list_code_servers))
        .route("/sessions/{id}/sync", post(routes::sync_workspace))
        .route("/workspace/sync/status", get(routes::sync_status))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::require_internal_key,
        ));

    Router::new()
        .route("/health", get(routes::health))
        .route("/ws/terminal", get(ws::terminal_ws))
        .route("/ws/events", get(ws::events_ws))
        .route("/ws/metrics", get(ws::metrics_ws))
        .merge(control_plane)
        .fallback(routes::not_found)
        .with_state(state)
        .layer(cors)
}
