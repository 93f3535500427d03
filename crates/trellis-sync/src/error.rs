//! Error types for sync orchestration.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use trellis_graph::GraphError;

/// Wire-level error kinds carried by `error` events and per-ref ack failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "&'static str", try_from = "String")]
pub enum ErrorCode {
    InvalidSyncId,
    InvalidCommits,
    Internal,
    Disconnected,
    Network,
    BadRequest,
    Unauthorized,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 7] = [
        ErrorCode::InvalidSyncId,
        ErrorCode::InvalidCommits,
        ErrorCode::Internal,
        ErrorCode::Disconnected,
        ErrorCode::Network,
        ErrorCode::BadRequest,
        ErrorCode::Unauthorized,
    ];

    /// Kebab-case wire name, used by both serde and `Display`.
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidSyncId => "invalid-sync-id",
            ErrorCode::InvalidCommits => "invalid-commits",
            ErrorCode::Internal => "internal",
            ErrorCode::Disconnected => "disconnected",
            ErrorCode::Network => "network",
            ErrorCode::BadRequest => "bad-request",
            ErrorCode::Unauthorized => "unauthorized",
        }
    }
}

impl From<ErrorCode> for &'static str {
    fn from(code: ErrorCode) -> Self {
        code.as_str()
    }
}

impl TryFrom<String> for ErrorCode {
    type Error = String;

    fn try_from(name: String) -> std::result::Result<Self, Self::Error> {
        ErrorCode::ALL
            .into_iter()
            .find(|code| code.as_str() == name)
            .ok_or_else(|| format!("unknown error code: {name}"))
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for store, remote, repository and client operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Invalid sync id: {0}")]
    InvalidSyncId(String),

    #[error("Invalid commits: {0}")]
    InvalidCommits(String),

    #[error("Remote disconnected")]
    Disconnected,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Store is shut down")]
    Closed,

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// The wire error kind reported for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            SyncError::Graph(_) | SyncError::InvalidCommits(_) => ErrorCode::InvalidCommits,
            SyncError::InvalidSyncId(_) => ErrorCode::InvalidSyncId,
            SyncError::Disconnected | SyncError::ChannelClosed(_) => ErrorCode::Disconnected,
            SyncError::Network(_) => ErrorCode::Network,
            SyncError::BadRequest(_) => ErrorCode::BadRequest,
            SyncError::Unauthorized(_) => ErrorCode::Unauthorized,
            SyncError::Closed | SyncError::Internal(_) => ErrorCode::Internal,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::BadRequest(err.to_string())
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
