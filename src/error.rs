use std::fmt;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Longest error message persisted on a sync status row.
pub const MAX_STORED_ERROR_LEN: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Validation(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "VALIDATION_ERROR",
                msg.clone(),
            ),
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "A database error occurred".to_string(),
                )
            }
            AppError::Jwt(e) => {
                tracing::warn!("JWT error: {:?}", e);
                (
                    StatusCode::UNAUTHORIZED,
                    "INVALID_TOKEN",
                    "Invalid or expired token".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
                details: None,
            },
        };

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

// ============================================================================
// Sync engine errors
// ============================================================================

/// Classification of a failed CalDAV call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    /// 401/403. Only fixed by a credential change, but still counted against the retry budget.
    Auth,
    /// 412/405 from the create-only precondition: the event may already exist.
    Conflict,
    /// Timeouts, connection failures, 408/429 and 5xx responses.
    Transient,
    /// 404 outside of a delete.
    NotFound,
    /// Any other non-2xx response.
    Rejected,
}

impl TransportErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportErrorKind::Auth => "auth",
            TransportErrorKind::Conflict => "conflict",
            TransportErrorKind::Transient => "transient",
            TransportErrorKind::NotFound => "not_found",
            TransportErrorKind::Rejected => "rejected",
        }
    }

    /// Map an HTTP status code of a failed response to its kind.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => TransportErrorKind::Auth,
            405 | 412 => TransportErrorKind::Conflict,
            404 => TransportErrorKind::NotFound,
            408 | 429 => TransportErrorKind::Transient,
            s if s >= 500 => TransportErrorKind::Transient,
            _ => TransportErrorKind::Rejected,
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default()
}

/// Errors raised while building or delivering a calendar event.
///
/// None of these escape the sync orchestrator: they are logged and, where the
/// row already exists, folded into `mark_failed`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid event interval: end {end} is not after start {start}")]
    InvalidInterval {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("CalDAV {kind} error{}: {message}", status_suffix(.status))]
    Transport {
        kind: TransportErrorKind,
        status: Option<u16>,
        message: String,
    },
}

impl SyncError {
    pub fn transport(kind: TransportErrorKind, status: Option<u16>, message: impl Into<String>) -> Self {
        SyncError::Transport {
            kind,
            status,
            message: message.into(),
        }
    }

    pub fn transport_kind(&self) -> Option<TransportErrorKind> {
        match self {
            SyncError::Transport { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Whether a later attempt may succeed without a code or data change.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Configuration(_) | SyncError::InvalidInterval { .. } => false,
            SyncError::Transport { kind, .. } => matches!(
                kind,
                TransportErrorKind::Transient | TransportErrorKind::Auth
            ),
        }
    }

    /// The message stored on a failed row, cut to `MAX_STORED_ERROR_LEN` characters.
    pub fn truncated_message(&self) -> String {
        truncate_chars(&self.to_string(), MAX_STORED_ERROR_LEN)
    }
}

pub fn truncate_chars(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value.to_string(),
    }
}
