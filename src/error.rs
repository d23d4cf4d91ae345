use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(sqlx::Error),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("stale write: {0}")]
    StaleWrite(String),
    #[error("insufficient balance: only {remaining} sessions remaining, {requested} requested")]
    InsufficientBalance { remaining: i32, requested: i32 },
    #[error("class is full at capacity {capacity}")]
    ClassFull { capacity: i32 },
    #[error("an active booking already exists for this member and class")]
    AlreadyBooked,
    #[error("cancellation window closed: cancellations require at least {lead_hours} hours before class start")]
    CancellationWindowClosed { lead_hours: i64 },
    #[error("not found")]
    NotFound,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("{0}")]
    Message(String),
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        // A timed-out or broken connection means the outcome is unknown; the
        // caller must re-read authoritative state before retrying.
        match err {
            sqlx::Error::PoolTimedOut => {
                AppError::StoreUnavailable("connection pool timed out".into())
            }
            sqlx::Error::Io(io) => AppError::StoreUnavailable(io.to_string()),
            other => AppError::Db(other),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::InsufficientBalance { .. }
            | AppError::ClassFull { .. }
            | AppError::AlreadyBooked
            | AppError::CancellationWindowClosed { .. }
            | AppError::StaleWrite(_) => StatusCode::CONFLICT,
            AppError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Db(_) | AppError::Message(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::error!(?self);
        (status, self.to_string()).into_response()
    }
}

/// True when a database error is a unique-constraint violation, which the
/// booking and ledger paths use to detect concurrent duplicates.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    }
}

pub type AppResult<T> = Result<T, AppError>;
