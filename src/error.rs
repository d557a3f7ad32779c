//! Request-level errors and their HTTP rendering.
//!
//! Every handler returns `Result<_, AppError>`. Module errors convert in via
//! `From`, so handlers just use `?`.

use crate::integrations::TicketingError;
use crate::persist::SaveFileError;
use crate::recurrence::RecurrenceError;
use crate::storage::StorageError;
use crate::world::WorldError;
use axum::{
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// The message behind a generic 500, carried as a response extension so the
/// router can decide whether the client gets to see it.
#[derive(Debug, Clone)]
pub struct InternalDetail(pub String);

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{provider} request failed")]
    Upstream {
        provider: String,
        status: Option<u16>,
        body: String,
    },

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        AppError::Validation(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            AppError::Persistence(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            AppError::Upstream {
                provider,
                status: upstream_status,
                body,
            } => json!({
                "error": format!("{provider} request failed"),
                "status": upstream_status,
                "details": body,
            }),
            AppError::Persistence(detail) | AppError::Internal(detail) => {
                tracing::error!(error = %detail, "request failed");
                let mut response =
                    (status, Json(json!({ "error": "Internal server error" }))).into_response();
                response
                    .extensions_mut()
                    .insert(InternalDetail(self.to_string()));
                return response;
            }
            other => json!({ "error": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

/// Put the detail of a generic 500 back into the body when `dev_mode` is on.
/// The detail never leaves the process otherwise.
pub fn render_internal_detail(dev_mode: bool, mut response: Response) -> Response {
    let Some(InternalDetail(detail)) = response.extensions_mut().remove::<InternalDetail>() else {
        return response;
    };
    if !dev_mode {
        return response;
    }
    (response.status(), Json(json!({ "error": detail }))).into_response()
}

// ── Conversions ────────────────────────────────────────────────

impl From<WorldError> for AppError {
    fn from(e: WorldError) -> Self {
        match e {
            WorldError::TaskNotFound => AppError::NotFound("Task"),
            WorldError::UserNotFound => AppError::NotFound("User"),
            WorldError::AttachmentNotFound => AppError::NotFound("Attachment"),
            WorldError::DuplicateName(_) | WorldError::DuplicateEmail(_) => {
                AppError::Conflict(e.to_string())
            }
        }
    }
}

impl From<SaveFileError> for AppError {
    fn from(e: SaveFileError) -> Self {
        AppError::Persistence(e.to_string())
    }
}

impl From<RecurrenceError> for AppError {
    fn from(e: RecurrenceError) -> Self {
        AppError::Validation(e.to_string())
    }
}

impl From<StorageError> for AppError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::TooLarge { .. } => AppError::Validation(e.to_string()),
            StorageError::Upstream { status, body } => AppError::Upstream {
                provider: "file storage".into(),
                status: Some(status),
                body,
            },
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<MultipartError> for AppError {
    fn from(e: MultipartError) -> Self {
        AppError::Validation(e.body_text())
    }
}

impl From<TicketingError> for AppError {
    fn from(e: TicketingError) -> Self {
        match e {
            TicketingError::Upstream {
                provider,
                status,
                body,
            } => AppError::Upstream {
                provider: provider.to_string(),
                status: Some(status),
                body,
            },
            TicketingError::Transport { provider, message } => AppError::Upstream {
                provider: provider.to_string(),
                status: None,
                body: message,
            },
            TicketingError::Decode { provider, message } => AppError::Upstream {
                provider: provider.to_string(),
                status: None,
                body: message,
            },
            TicketingError::UnsupportedProvider(_) | TicketingError::InvalidConfig(_) => {
                AppError::Validation(e.to_string())
            }
            TicketingError::NotConfigured(_) => AppError::NotFound("Integration"),
            TicketingError::Disabled(_) => AppError::Validation(e.to_string()),
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────
