use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use careledger_core::LedgerError;
use serde_json::json;
use tracing::{error, warn};

/// Error body shared by every route: `{"success": false, "error", "kind", "retryable"}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
    retryable: bool,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "invalid_input",
            message: message.into(),
            retryable: false,
        }
    }

    pub fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            kind: "unauthorized",
            message: "missing or invalid bearer token".to_string(),
            retryable: false,
        }
    }

    pub fn timeout() -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            kind: "timeout",
            message: "anchoring did not finish in time; retry later".to_string(),
            retryable: true,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        let status = match &err {
            LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::Serialization(_) | LedgerError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            LedgerError::TamperDetected { .. } => StatusCode::CONFLICT,
            LedgerError::MiningExhausted { .. }
            | LedgerError::WriteConflict { .. }
            | LedgerError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        match status {
            StatusCode::CONFLICT => error!(error = %err, "ledger refused request"),
            StatusCode::SERVICE_UNAVAILABLE => {
                warn!(error = %err, "ledger temporarily unavailable")
            }
            _ => {}
        }
        Self {
            status,
            kind: err.kind(),
            retryable: err.is_retryable(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "success": false,
            "error": self.message,
            "kind": self.kind,
            "retryable": self.retryable,
        });
        (self.status, Json(body)).into_response()
    }
}
