use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use super::AppState;
use crate::error::Error;

/// Control-plane auth: every request must present the pre-shared internal
/// key, via the `x-internal-key` header or an `internalKey` query
/// parameter. When no key is configured the check is disabled (single-node
/// dev setups).
pub async fn require_internal_key(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.config.internal_api_key.as_deref() else {
        return next.run(req).await;
    };

    let header_key = req
        .headers()
        .get("x-internal-key")
        .and_then(|v| v.to_str().ok());

    let query_key = req.uri().query().and_then(|q| {
        q.split('&')
            .find_map(|pair| pair.strip_prefix("internalKey="))
    });

    if header_key == Some(expected) || query_key == Some(expected) {
        next.run(req).await
    } else {
        Error::AuthRequired.into_response()
    }
}

/// Shared by the WebSocket endpoints: accept either the internal key or a
/// non-empty opaque user token from the query string.
pub fn ws_authorized(
    internal_api_key: Option<&str>,
    internal_key_param: Option<&str>,
    token_param: Option<&str>,
) -> bool {
    match internal_api_key {
        // No key configured: open edge (dev mode).
        None => true,
        Some(expected) => {
            internal_key_param == Some(expected)
                || token_param.map(|t| !t.is_empty()).unwrap_or(false)
        }
    }
}
