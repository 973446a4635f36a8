use crate::services::{
    access::AccessError, remote::RemoteError, storage::StorageError, upload::UploadError,
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use tracing::error;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(_) | StorageError::InvalidKey(_) => {
                AppError::not_found("file not found")
            }
            StorageError::FileEmpty => AppError::bad_request(err.to_string()),
            StorageError::BadMetadata(_) => AppError::internal("corrupt metadata"),
            StorageError::InsufficientDiskSpace { .. } => {
                error!(error = %err, "rejecting upload");
                AppError::new(StatusCode::INSUFFICIENT_STORAGE, "insufficient disk space")
            }
            other => {
                error!(error = %other, "storage failure");
                AppError::internal(other.to_string())
            }
        }
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::Storage(inner) => inner.into(),
            user_error => AppError::bad_request(format!("could not upload file: {user_error}")),
        }
    }
}

impl From<AccessError> for AppError {
    fn from(err: AccessError) -> Self {
        AppError::unauthorized(err.to_string())
    }
}

impl From<RemoteError> for AppError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::InvalidUrl(_) => AppError::bad_request(err.to_string()),
            other => AppError::new(StatusCode::BAD_GATEWAY, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_error_kind() {
        let status = |e: AppError| e.status;
        assert_eq!(status(StorageError::NotFound("k".into()).into()), StatusCode::NOT_FOUND);
        assert_eq!(status(StorageError::InvalidKey("..".into()).into()), StatusCode::NOT_FOUND);
        assert_eq!(status(UploadError::FileTooLarge.into()), StatusCode::BAD_REQUEST);
        assert_eq!(
            status(UploadError::ForbiddenExtension("exe".into()).into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status(AccessError::InvalidAccessKey.into()), StatusCode::UNAUTHORIZED);
        assert_eq!(
            status(
                StorageError::InsufficientDiskSpace {
                    available: 1,
                    required: 2
                }
                .into()
            ),
            StatusCode::INSUFFICIENT_STORAGE
        );
        assert_eq!(
            status(UploadError::Storage(StorageError::Transport("boom".into())).into()),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
