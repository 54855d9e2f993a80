use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Failure classes surfaced by the delivery core.
///
/// Idempotent no-ops (already delivered, already read) are not errors and never
/// show up here.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("unauthenticated")]
    Unauthenticated,
    /// Missing entity, or one the caller is not allowed to see.
    #[error("not_found")]
    NotFound,
    #[error("{0}")]
    InvalidInput(&'static str),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T, E = ChatError> = std::result::Result<T, E>;

impl From<rusqlite::Error> for ChatError {
    fn from(e: rusqlite::Error) -> Self {
        ChatError::Internal(e.into())
    }
}

impl From<r2d2::Error> for ChatError {
    fn from(e: r2d2::Error) -> Self {
        ChatError::Internal(e.into())
    }
}

impl ChatError {
    /// Stable snake_case code sent to clients.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Unauthenticated => "unauthenticated",
            ChatError::NotFound => "not_found",
            ChatError::InvalidInput(code) => code,
            ChatError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ChatError::NotFound => StatusCode::NOT_FOUND,
            ChatError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ChatError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorResp {
    error: String,
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        if let ChatError::Internal(e) = &self {
            tracing::error!(error = %e, "request failed");
        }
        (
            self.status(),
            Json(ErrorResp {
                error: self.code().into(),
            }),
        )
            .into_response()
    }
}
