use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use thiserror::Error;
use validator::ValidationErrors;

use crate::{
    dao::storage::StorageError,
    state::{
        AbortError, ApplyError, PlanError,
        session::{SessionCode, SessionError},
    },
};

/// Result alias used by the synchronization layer.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors returned to the participant that issued an operation.
///
/// Every error is scoped to that one operation; the session survives it.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Input rejected before anything was written.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// No session uses this code.
    #[error("session `{0}` not found")]
    NotFound(SessionCode),
    /// The session left the lobby and accepts no more players.
    #[error("session `{0}` already started")]
    AlreadyStarted(SessionCode),
    /// The session reached its player limit.
    #[error("session `{0}` is full")]
    SessionFull(SessionCode),
    /// Operation cannot be performed in the current state.
    #[error("precondition failed: {0}")]
    Precondition(String),
    /// Host-only operation issued by another participant.
    #[error("only the host can {0}")]
    NotHost(&'static str),
    /// The participant is not attached to a session.
    #[error("not attached to a session")]
    NoSession,
    /// The session store failed; the caller may retry.
    #[error("session store unavailable")]
    Unavailable(#[source] StorageError),
    /// Operation exceeded its timeout limit.
    #[error("operation timed out")]
    Timeout,
}

impl SyncError {
    /// Whether retrying the operation later may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SyncError::Unavailable(_) | SyncError::Timeout)
    }
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Missing { .. } => SyncError::Precondition(err.to_string()),
            err => SyncError::Unavailable(err),
        }
    }
}

impl From<SessionError> for SyncError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::AnswerOutOfRange { .. } | SessionError::InvalidLatency(_) => {
                SyncError::InvalidInput(err.to_string())
            }
            SessionError::UnknownPlayer(_) | SessionError::NotAcceptingAnswers(_) => {
                SyncError::Precondition(err.to_string())
            }
        }
    }
}

impl From<PlanError> for SyncError {
    fn from(err: PlanError) -> Self {
        match err {
            PlanError::AlreadyPending => {
                SyncError::Precondition("state transition already pending".into())
            }
            PlanError::InvalidTransition(invalid) => SyncError::Precondition(invalid.to_string()),
            PlanError::PlayerCount { count, limits } => SyncError::Precondition(format!(
                "{count} players present, {} to {} required",
                limits.min, limits.max
            )),
        }
    }
}

impl From<ApplyError> for SyncError {
    fn from(err: ApplyError) -> Self {
        match err {
            ApplyError::NoPending => SyncError::Precondition("no transition is pending".into()),
            ApplyError::IdMismatch { .. } => {
                SyncError::Precondition("pending transition does not match".into())
            }
            ApplyError::PhaseMismatch { expected, actual } => SyncError::Precondition(format!(
                "state changed during transition (expected {expected}, got {actual})"
            )),
            ApplyError::VersionMismatch { expected, actual } => SyncError::Precondition(format!(
                "state version mismatch during transition (expected {expected}, got {actual})"
            )),
        }
    }
}

impl From<AbortError> for SyncError {
    fn from(err: AbortError) -> Self {
        match err {
            AbortError::NoPending => SyncError::Precondition("no pending transition".into()),
            AbortError::IdMismatch { .. } => {
                SyncError::Precondition("transition plan does not match".into())
            }
        }
    }
}

impl From<ValidationErrors> for AppError {
    fn from(err: ValidationErrors) -> Self {
        AppError::BadRequest(format!("validation failed: {}", err))
    }
}

/// Application-level errors that are converted to HTTP responses.
#[derive(Debug, Error)]
pub enum AppError {
    /// Bad request with invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Conflict with current state.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Service unavailable or degraded.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Conflict { .. } => AppError::Conflict(err.to_string()),
            StorageError::Rejected(message) => AppError::BadRequest(message),
            StorageError::Malformed { .. } | StorageError::Missing { .. } => {
                AppError::BadRequest(err.to_string())
            }
            StorageError::Unavailable { .. } => AppError::ServiceUnavailable(err.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };

        let payload = Json(ErrorBody {
            message: self.to_string(),
        });

        (status, payload).into_response()
    }
}
