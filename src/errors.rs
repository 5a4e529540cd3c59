//! Stable error-code boundary.
//!
//! Every component defines its own `thiserror` enum for internal use; at the
//! `OrderGateway` boundary those all collapse into [`AppError`], an
//! `ApiResponse`-shaped envelope with a stable `code` field. Only
//! `AppError` is allowed to leave the crate's public surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Stable, user-facing error codes so that a transport layer can map them
/// to HTTP status codes without re-deriving policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MarketNotOpen,
    NotClosed,
    AlreadyResolved,
    NotOpenOrClosed,
    NotFound,
    NotOwner,
    AlreadyTerminal,
    InsufficientBalance,
    InsufficientShares,
    PriceOutOfRange,
    QuantityOutOfRange,
    SelfTrade,
    IdempotencyReplay,
    IdempotencyKeyConflict,
    Timeout,
    Conflict,
    NoLiquidity,
    PositionCapExceeded,
    Internal,
}

impl ErrorCode {
    fn status(self) -> StatusCode {
        use ErrorCode::*;
        match self {
            MarketNotOpen | NotClosed | AlreadyResolved | NotOpenOrClosed | AlreadyTerminal => {
                StatusCode::CONFLICT
            }
            NotFound => StatusCode::NOT_FOUND,
            NotOwner => StatusCode::FORBIDDEN,
            InsufficientBalance | InsufficientShares => StatusCode::UNPROCESSABLE_ENTITY,
            PriceOutOfRange | QuantityOutOfRange | SelfTrade => StatusCode::BAD_REQUEST,
            IdempotencyReplay => StatusCode::OK,
            IdempotencyKeyConflict => StatusCode::CONFLICT,
            Timeout => StatusCode::REQUEST_TIMEOUT,
            Conflict => StatusCode::CONFLICT,
            NoLiquidity => StatusCode::UNPROCESSABLE_ENTITY,
            PositionCapExceeded => StatusCode::UNPROCESSABLE_ENTITY,
            Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// The envelope every public operation's error path returns: an
/// `ApiResponse<()>`-shaped pair carrying a typed [`ErrorCode`] instead of
/// a free-form string, since the codes are part of this crate's contract.
#[derive(Debug, Clone)]
pub struct AppError {
    pub code: ErrorCode,
    pub message: String,
}

impl AppError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}

#[derive(Debug, Serialize)]
struct ApiErrorBody {
    code: ErrorCode,
    message: String,
}

#[derive(Debug, Serialize)]
struct ApiResponseBody {
    success: bool,
    error: ApiErrorBody,
    timestamp_ms: i64,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.code.status();
        let body = ApiResponseBody {
            success: false,
            error: ApiErrorBody {
                code: self.code,
                message: self.message,
            },
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_balance_maps_to_422() {
        let err = AppError::new(ErrorCode::InsufficientBalance, "need 10.0000 available");
        assert_eq!(err.code.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
