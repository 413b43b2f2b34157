use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::config::ConfigError;
use crate::models::PollStatus;
use crate::notify::NotifyError;

/// Failures of the storage layer. Always surfaced as `AppError::Internal`.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Anything that stops the server from coming up.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Notify(#[from] NotifyError),

    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid poll option")]
    InvalidOption,

    #[error("Invalid or expired code")]
    InvalidVerification,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("You have already voted on this poll")]
    DuplicateVote,

    #[error("This poll is not accepting votes")]
    PollNotActive,

    #[error("This poll has not ended yet")]
    PollStillOpen,

    #[error("Cannot move poll from {from} to {to}")]
    InvalidTransition { from: PollStatus, to: PollStatus },

    #[error("Poll not found")]
    PollNotFound,

    #[error("Internal error")]
    Internal(#[from] StoreError),
}

impl AppError {
    /// Stable machine-readable code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation_failed",
            AppError::InvalidOption => "invalid_option",
            AppError::InvalidVerification => "invalid_verification",
            AppError::Unauthorized => "unauthorized",
            AppError::DuplicateVote => "duplicate_vote",
            AppError::PollNotActive => "poll_not_active",
            AppError::PollStillOpen => "poll_still_open",
            AppError::InvalidTransition { .. } => "invalid_transition",
            AppError::PollNotFound => "poll_not_found",
            AppError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::InvalidOption => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::InvalidVerification | AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::DuplicateVote
            | AppError::PollNotActive
            | AppError::PollStillOpen
            | AppError::InvalidTransition { .. } => StatusCode::CONFLICT,
            AppError::PollNotFound => StatusCode::NOT_FOUND,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Only storage failures are worth retrying, and only for reads.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Internal(_))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::Internal(e) = &self {
            tracing::error!(error = %e, "Request failed on storage");
        }

        let status = self.status();
        let body = json!({
            "success": false,
            "code": self.code(),
            "message": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}
