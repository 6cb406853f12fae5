//! Error types for scene-studio

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Not authenticated - sign in before using the cloud tier")]
    NotAuthenticated,

    #[error("Cloud backend error: {0}")]
    NetworkOrBackend(String),

    #[error("Permission denied by cloud backend: {0}")]
    Permission(String),

    #[error("Local storage corrupt: {0}")]
    LocalStorageCorrupt(String),

    #[error("Migration incomplete: {failed} of {total} items failed")]
    PartialMigrationFailure { failed: usize, total: usize },

    #[error("Bundled asset not found: {0}")]
    AssetNotFound(String),

    #[error("Item {0} has no cloud document id yet")]
    NotMigrated(String),

    #[error("Item {0} is read-only")]
    ReadOnly(String),

    #[error("Item not found: {0}")]
    NotFound(String),

    #[error("Unsupported image reference: {0}")]
    UnsupportedImage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Local database error: {0}")]
    Local(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Coarse failure categories surfaced to collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotAuthenticated,
    NetworkOrBackend,
    LocalStorageCorrupt,
    PartialMigrationFailure,
    AssetNotFound,
    Rejected,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::NotAuthenticated => ErrorKind::NotAuthenticated,
            SyncError::NetworkOrBackend(_) | SyncError::Permission(_) => {
                ErrorKind::NetworkOrBackend
            }
            SyncError::LocalStorageCorrupt(_) | SyncError::Json(_) => {
                ErrorKind::LocalStorageCorrupt
            }
            SyncError::PartialMigrationFailure { .. } => ErrorKind::PartialMigrationFailure,
            SyncError::AssetNotFound(_) => ErrorKind::AssetNotFound,
            SyncError::Io(_) | SyncError::Local(_) => ErrorKind::NetworkOrBackend,
            SyncError::NotMigrated(_)
            | SyncError::ReadOnly(_)
            | SyncError::NotFound(_)
            | SyncError::UnsupportedImage(_) => ErrorKind::Rejected,
        }
    }

    /// Whether the failure should be shown to the user.
    pub fn is_user_visible(&self) -> bool {
        self.kind() != ErrorKind::LocalStorageCorrupt
    }
}

impl From<surrealdb::Error> for SyncError {
    fn from(e: surrealdb::Error) -> Self {
        let message = e.to_string();
        let lower = message.to_lowercase();
        if lower.contains("permission") || lower.contains("not allowed") || lower.contains("iam") {
            SyncError::Permission(message)
        } else {
            SyncError::NetworkOrBackend(message)
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::NetworkOrBackend(e.to_string())
    }
}
