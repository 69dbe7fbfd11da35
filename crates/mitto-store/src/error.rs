use thiserror::Error;

use crate::SessionId;

/// Shared discriminator re-exported by every crate boundary in the workspace
/// so callers can match on error class without downcasting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    QueueFull,
    QueueEmpty,
    InvalidArgument,
    AgentUnavailable,
    AgentProtocol,
    PermissionTimeout,
    IoError,
    StoreCorrupt,
    Cancelled,
    Internal,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("session not found: {0}")]
    NotFound(SessionId),

    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("store corrupt: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Io(_) => ErrorKind::IoError,
            StoreError::Serde(_) => ErrorKind::IoError,
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::InvalidSessionId(_) => ErrorKind::InvalidArgument,
            StoreError::Corrupt(_) => ErrorKind::StoreCorrupt,
        }
    }
}
