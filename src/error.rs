//! Crate-wide error taxonomy (spec §7), grounded on `liveion/src/error.rs`'s
//! `AppError` but widened to the five buckets the spec's error-handling
//! design names, and derived with `thiserror` rather than hand-rolled
//! `Display`/`Error` impls.

use axum::response::{IntoResponse, Response};
use http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error ({status}): {message}")]
    Protocol { status: u16, message: String },

    #[error("format error: {0}")]
    Format(String),

    #[error("stream already published: {0}")]
    AlreadyPublished(String),

    #[error("stream not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl RelayError {
    pub fn transport(msg: impl ToString) -> Self {
        RelayError::Transport(msg.to_string())
    }

    pub fn protocol(status: u16, msg: impl ToString) -> Self {
        RelayError::Protocol {
            status,
            message: msg.to_string(),
        }
    }

    pub fn format(msg: impl ToString) -> Self {
        RelayError::Format(msg.to_string())
    }

    pub fn already_published(path: impl ToString) -> Self {
        RelayError::AlreadyPublished(path.to_string())
    }

    pub fn not_found(path: impl ToString) -> Self {
        RelayError::NotFound(path.to_string())
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        match self {
            RelayError::NotFound(err) => (StatusCode::NOT_FOUND, err).into_response(),
            RelayError::AlreadyPublished(err) => (StatusCode::CONFLICT, err).into_response(),
            RelayError::Protocol { status, message } => {
                let code = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_REQUEST);
                (code, message).into_response()
            }
            RelayError::Transport(err) => (StatusCode::BAD_GATEWAY, err).into_response(),
            RelayError::Format(err) => {
                (StatusCode::UNPROCESSABLE_ENTITY, err).into_response()
            }
            RelayError::Fatal(err) => {
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
            }
        }
    }
}

/// Lets `?` compose across library code that still returns `anyhow::Result`,
/// mirroring `liveion`'s blanket `From<E> for AppError`. Kept narrow to
/// `anyhow::Error` itself (rather than a blanket `E: Into<anyhow::Error>`)
/// so it does not swallow the typed variants above via accidental coercion.
impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
