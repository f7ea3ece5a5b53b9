//! Diagnostics endpoint errors

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum DiagnosticsError {
    #[error("unknown method")]
    UnknownMethod(String),

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DiagnosticsError {
    pub fn status(&self) -> StatusCode {
        match self {
            DiagnosticsError::UnknownMethod(_) | DiagnosticsError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            DiagnosticsError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Error response echoing the request id
    pub fn with_id(self, id: serde_json::Value) -> Response {
        let body = axum::Json(json!({
            "id": id,
            "error": self.to_string(),
        }));
        (self.status(), body).into_response()
    }
}

impl IntoResponse for DiagnosticsError {
    fn into_response(self) -> Response {
        self.with_id(serde_json::Value::Null)
    }
}
