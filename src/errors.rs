use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

use crate::{
    models::tree::TreeError,
    services::{
        gateway::GatewayError, signing::SignatureError, thumbnail_service::ThumbnailError,
        tree_repository::RepositoryError, tree_service::TreeServiceError,
        upload_service::UploadError,
    },
};

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

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, msg)
    }

    pub fn unprocessable(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, msg)
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
        if self.status.is_server_error() {
            tracing::error!(status = self.status.as_u16(), error = %self.message, "request failed");
        }

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

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!(error = %err, "database error");
        AppError::internal("database error")
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::UploadNotFound(_) | GatewayError::ObjectNotFound(_) => {
                AppError::not_found(err.to_string())
            }
            GatewayError::InvalidPart { .. } => AppError::unprocessable(err.to_string()),
            GatewayError::InvalidKey => AppError::new(StatusCode::BAD_REQUEST, err.to_string()),
            GatewayError::Io(_) | GatewayError::Serialization(_) => {
                AppError::new(StatusCode::BAD_GATEWAY, format!("object store error: {err}"))
            }
        }
    }
}

impl From<SignatureError> for AppError {
    fn from(err: SignatureError) -> Self {
        AppError::new(StatusCode::FORBIDDEN, err.to_string())
    }
}

impl From<TreeError> for AppError {
    fn from(err: TreeError) -> Self {
        match err {
            TreeError::TreeNotFound(_) | TreeError::NodeNotFound { .. } => {
                AppError::not_found(err.to_string())
            }
            TreeError::ConflictingTopology(_) => AppError::new(StatusCode::CONFLICT, err.to_string()),
        }
    }
}

impl From<TreeServiceError> for AppError {
    fn from(err: TreeServiceError) -> Self {
        match err {
            TreeServiceError::Tree(err) => err.into(),
            TreeServiceError::Storage(err) => err.into(),
            TreeServiceError::Repository(RepositoryError::Database(err)) => err.into(),
            TreeServiceError::Repository(err) => AppError::internal(err.to_string()),
        }
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::InvalidMediaType(_)
            | UploadError::InvalidFileName(_)
            | UploadError::InvalidPartNumber(_)
            | UploadError::MissingIntegrityTag(_)
            | UploadError::IncompleteUpload(_) => AppError::unprocessable(err.to_string()),
            UploadError::NotFound(_) => AppError::not_found(err.to_string()),
            UploadError::SessionTerminated { .. } => {
                AppError::new(StatusCode::CONFLICT, err.to_string())
            }
            UploadError::StorageFinalizeFailed { .. } => {
                AppError::new(StatusCode::BAD_GATEWAY, err.to_string())
            }
            UploadError::Storage(GatewayError::UploadNotFound(_)) => {
                AppError::new(StatusCode::BAD_GATEWAY, err.to_string())
            }
            UploadError::Storage(err) => err.into(),
            UploadError::Database(err) => err.into(),
        }
    }
}

impl From<ThumbnailError> for AppError {
    fn from(err: ThumbnailError) -> Self {
        match err {
            ThumbnailError::InvalidMediaType(_) => AppError::unprocessable(err.to_string()),
            ThumbnailError::KeyOutsideNamespace(_) => {
                AppError::new(StatusCode::FORBIDDEN, err.to_string())
            }
            ThumbnailError::Storage(err) => err.into(),
        }
    }
}
