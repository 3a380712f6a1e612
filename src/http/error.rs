use std::fmt::Display;

use log::error;
use rouille::Response;

use crate::storage::error::StorageError;

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    Internal(String),
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::TrackNotFound(_)
            | StorageError::VersionNotFound { .. }
            | StorageError::VersionLabelNotFound { .. }
            | StorageError::ObjectNotFound(_) => ApiError::NotFound(err.to_string()),

            StorageError::PermissionDenied(_) => ApiError::Forbidden(err.to_string()),

            StorageError::UnsupportedFile(_) | StorageError::InvalidInput(_) => {
                ApiError::BadRequest(err.to_string())
            }

            StorageError::InvariantViolation { .. }
            | StorageError::Database(_)
            | StorageError::Fs(_)
            | StorageError::Serialization(_)
            | StorageError::Internal(_) => {
                error!("request failed: {err}");
                ApiError::Internal("internal server error".into())
            }
        }
    }
}

impl Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::NotFound(msg)
            | ApiError::BadRequest(msg)
            | ApiError::Unauthorized(msg)
            | ApiError::Forbidden(msg)
            | ApiError::Internal(msg) => f.write_str(msg),
        }
    }
}

impl ApiError {
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::NotFound(_) => 404,
            ApiError::BadRequest(_) => 400,
            ApiError::Unauthorized(_) => 401,
            ApiError::Forbidden(_) => 403,
            ApiError::Internal(_) => 500,
        }
    }

    pub fn into_response(self) -> Response {
        let status = self.status_code();
        Response::json(&serde_json::json!({ "error": self.to_string() })).with_status_code(status)
    }
}
