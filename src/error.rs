use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use serde_with::skip_serializing_none;
use thiserror::Error;
use validator::ValidationErrors;

use crate::{
    dao::storage::StorageError,
    state::session_machine::{AbortError, ApplyError, PlanError},
};

/// Errors that can occur in service layer operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Persistence gateway call failed.
    #[error("storage unavailable")]
    Unavailable(#[source] StorageError),
    /// No persistence gateway is currently installed.
    #[error("storage unavailable (degraded mode)")]
    Degraded,
    /// Gateway call exceeded its timeout.
    #[error("operation timed out")]
    Timeout,
    /// Session, participant, artifact or trigger absent.
    #[error("not found: {0}")]
    NotFound(String),
    /// A state machine rejected the requested move.
    #[error("invalid transition: {message}")]
    InvalidTransition {
        /// Human-readable description of the rejected move.
        message: String,
        /// Actual state at the time of rejection.
        current: String,
    },
    /// The request conflicts with the current state, e.g. starting an active session.
    #[error("conflict: {message}")]
    Conflict {
        /// Human-readable description of the conflict.
        message: String,
        /// Actual state at the time of rejection.
        current: String,
    },
    /// Missing or expired credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Credentials are valid but do not permit the action.
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// A spend or debit would drive a balance negative.
    #[error("insufficient balance: {balance} available, {requested} requested")]
    InsufficientBalance {
        /// Balance observed atomically with the rejection.
        balance: i64,
        /// Amount that was requested.
        requested: i64,
    },
    /// A time-bank delta would leave the balance outside its bounds.
    #[error("time bank balance {balance} with delta {delta} leaves bounds [{min}, {max}]")]
    ClampViolation {
        /// Balance before the rejected delta.
        balance: i64,
        /// Rejected delta in seconds.
        delta: i64,
        /// Lower bound that applied.
        min: i64,
        /// Upper bound that applied.
        max: i64,
    },
    /// Malformed payload, including unknown condition or action tags.
    #[error("validation failed: {0}")]
    Validation(String),
}

impl ServiceError {
    /// Build an [`ServiceError::InvalidTransition`] carrying the caller-visible current state.
    pub fn invalid_transition(message: impl Into<String>, current: impl ToString) -> Self {
        ServiceError::InvalidTransition {
            message: message.into(),
            current: current.to_string(),
        }
    }

    /// Build a [`ServiceError::Conflict`] carrying the caller-visible current state.
    pub fn conflict(message: impl Into<String>, current: impl ToString) -> Self {
        ServiceError::Conflict {
            message: message.into(),
            current: current.to_string(),
        }
    }
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        ServiceError::Unavailable(err)
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
    /// Missing or expired credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Credentials do not permit the action.
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Requested resource not found.
    #[error("not found: {0}")]
    NotFound(String),
    /// Conflict with current state.
    #[error("conflict: {message}")]
    Conflict {
        /// Description of the conflict.
        message: String,
        /// Current state the client should reconcile against.
        current_state: Option<String>,
    },
    /// Semantically valid request the ledger refused.
    #[error("unprocessable: {0}")]
    Unprocessable(String),
    /// Service unavailable or degraded.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Unavailable(source) => AppError::ServiceUnavailable(source.to_string()),
            ServiceError::Degraded => AppError::ServiceUnavailable("degraded mode".into()),
            ServiceError::Timeout => AppError::ServiceUnavailable("operation timed out".into()),
            ServiceError::NotFound(message) => AppError::NotFound(message),
            ServiceError::InvalidTransition { message, current }
            | ServiceError::Conflict { message, current } => AppError::Conflict {
                message,
                current_state: Some(current),
            },
            ServiceError::Unauthorized(message) => AppError::Unauthorized(message),
            ServiceError::Forbidden(message) => AppError::Forbidden(message),
            err @ ServiceError::InsufficientBalance { .. } => {
                AppError::Unprocessable(err.to_string())
            }
            err @ ServiceError::ClampViolation { .. } => AppError::Conflict {
                message: err.to_string(),
                current_state: None,
            },
            ServiceError::Validation(message) => AppError::BadRequest(message),
        }
    }
}

#[skip_serializing_none]
#[derive(Serialize)]
struct ErrorBody {
    message: String,
    current_state: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict { .. } => StatusCode::CONFLICT,
            AppError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let current_state = match &self {
            AppError::Conflict { current_state, .. } => current_state.clone(),
            _ => None,
        };

        let payload = Json(ErrorBody {
            message: self.to_string(),
            current_state,
        });

        (status, payload).into_response()
    }
}

impl From<PlanError> for ServiceError {
    fn from(err: PlanError) -> Self {
        match err {
            PlanError::AlreadyPending { current } => {
                ServiceError::conflict("session transition already pending", current)
            }
            PlanError::InvalidTransition(invalid) if invalid.is_redundant() => {
                ServiceError::conflict(invalid.to_string(), invalid.from)
            }
            PlanError::InvalidTransition(invalid) => {
                ServiceError::invalid_transition(invalid.to_string(), invalid.from)
            }
        }
    }
}

impl From<ApplyError> for ServiceError {
    fn from(err: ApplyError) -> Self {
        match err {
            ApplyError::NoPending { current } => {
                ServiceError::conflict("no transition is pending", current)
            }
            ApplyError::IdMismatch { current, .. } => {
                ServiceError::conflict("pending transition does not match", current)
            }
            ApplyError::StatusMismatch { expected, actual } => ServiceError::conflict(
                format!("session changed during transition (expected {expected})"),
                actual,
            ),
            ApplyError::VersionMismatch {
                expected,
                actual,
                current,
            } => ServiceError::conflict(
                format!("session version mismatch (expected {expected}, got {actual})"),
                current,
            ),
        }
    }
}

impl From<AbortError> for ServiceError {
    fn from(err: AbortError) -> Self {
        match err {
            AbortError::NoPending { current } => {
                ServiceError::conflict("no pending transition", current)
            }
            AbortError::IdMismatch { current, .. } => {
                ServiceError::conflict("transition plan does not match", current)
            }
        }
    }
}
