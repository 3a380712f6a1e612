use thiserror::Error;

use crate::domain::track::{TrackId, VersionId};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("track {0} not found")]
    TrackNotFound(TrackId),

    #[error("version {version} not found on track {track}")]
    VersionNotFound { track: TrackId, version: VersionId },

    #[error("version label {label} not found on track {track}")]
    VersionLabelNotFound { track: TrackId, label: String },

    #[error("only the owner of track {0} may do that")]
    PermissionDenied(TrackId),

    #[error("stored object {0} not found")]
    ObjectNotFound(String),

    #[error("unsupported file: {0}")]
    UnsupportedFile(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("track {track} is inconsistent: {reason}")]
    InvariantViolation { track: TrackId, reason: String },

    #[error("filesystem error: {0}")]
    Fs(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
