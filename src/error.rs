use axum::Json;
use axum::response::{IntoResponse, Response};
use hyper::StatusCode;
use serde_json::json;

/// Errors surfaced to API callers.
///
/// Subsystems map their internal failures into these variants at the
/// boundary; anything recoverable (watcher sync retries, best-effort
/// teardown, parse failures) is logged where it happens and never reaches
/// this type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("quota exceeded: user {user_id} already has {running} running sessions (max {max})")]
    QuotaExceeded {
        user_id: String,
        running: usize,
        max: usize,
    },

    #[error("storage limit exceeded: workspace is {measured_mb} MB, limit is {allowed_mb} MB")]
    StorageLimitExceeded { measured_mb: u64, allowed_mb: u64 },

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("capacity exhausted: {0}")]
    CapacityExhausted(&'static str),

    #[error("privilege denied: {0}")]
    PrivilegeDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    StateInvalid(String),

    #[error("authentication required")]
    AuthRequired,

    #[error("upstream failure: {0}")]
    UpstreamFailure(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    /// HTTP status code for this error kind.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::QuotaExceeded { .. } => StatusCode::CONFLICT,
            Error::StorageLimitExceeded { .. } => StatusCode::CONFLICT,
            Error::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::CapacityExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::PrivilegeDenied(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::StateInvalid(_) => StatusCode::BAD_REQUEST,
            Error::AuthRequired => StatusCode::UNAUTHORIZED,
            Error::UpstreamFailure(_) => StatusCode::BAD_GATEWAY,
            Error::Io(_) | Error::Serde(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// WebSocket close codes used by the edge surface.
pub mod ws_close {
    pub const UNAUTHORIZED: u16 = 4000;
    pub const MISSING_PARAMETER: u16 = 4001;
    pub const SESSION_UNAVAILABLE: u16 = 4002;
    pub const SUBSYSTEM_UNAVAILABLE: u16 = 4003;
}
