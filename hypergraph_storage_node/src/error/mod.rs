// Error handling module for the hypergraph storage node
//
// Every fallible operation in the crate returns this error type. Remote failures are
// folded into counters and log lines by the cluster layer, so only local storage
// failures ever surface to direct callers of store/remove.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::io;
use std::result;
use thiserror::Error;

/// Result type for storage node operations
pub type Result<T> = result::Result<T, StorageNodeError>;

/// Error type for storage node operations
#[derive(Debug, Error, Clone)]
pub enum StorageNodeError {
    /// A peer call exceeded its time bound
    #[error("Operation timed out")]
    Timeout,

    /// The local knowledge store rejected or failed an operation
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A peer could not be contacted or answered with a failure
    #[error("Network error: {0}")]
    Network(String),

    /// An inbound message could not be decoded
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// A peer introduction failed validation
    #[error("Invalid peer: {0}")]
    InvalidPeer(String),

    /// A rebalance is already running on this node
    #[error("Rebalance already in progress")]
    RebalanceInProgress,

    /// A conflict winner could not be applied; logged and the local value kept
    #[error("Conflict unresolved: {0}")]
    ConflictUnresolved(String),

    /// IO errors
    #[error("IO error: {0}")]
    IO(String),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(String),

    /// SQLite errors
    #[error("SQLite error: {0}")]
    Sqlite(String),

    /// HTTP request errors
    #[error("Request error: {0}")]
    Request(String),

    /// Task failed
    #[error("Task failed: {0}")]
    TaskFailed(String),
}

impl StorageNodeError {
    /// True for failures caused by an unreachable or misbehaving peer.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            StorageNodeError::Timeout | StorageNodeError::Network(_) | StorageNodeError::Request(_)
        )
    }
}

/// Implement IntoResponse for StorageNodeError so it can be returned directly from handlers
impl IntoResponse for StorageNodeError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            StorageNodeError::Timeout => (StatusCode::REQUEST_TIMEOUT, "Operation timed out".to_string()),
            StorageNodeError::Storage(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            StorageNodeError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            StorageNodeError::Network(msg) => (StatusCode::BAD_GATEWAY, msg),
            StorageNodeError::MalformedMessage(msg) => (StatusCode::BAD_REQUEST, msg),
            StorageNodeError::InvalidPeer(msg) => (StatusCode::BAD_REQUEST, msg),
            StorageNodeError::RebalanceInProgress => {
                (StatusCode::CONFLICT, "Rebalance already in progress".to_string())
            }
            StorageNodeError::ConflictUnresolved(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            StorageNodeError::IO(err) => (StatusCode::INTERNAL_SERVER_ERROR, err),
            StorageNodeError::Json(err) => (StatusCode::BAD_REQUEST, err),
            StorageNodeError::Sqlite(err) => (StatusCode::INTERNAL_SERVER_ERROR, err),
            StorageNodeError::Request(err) => (StatusCode::BAD_GATEWAY, err),
            StorageNodeError::TaskFailed(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(serde_json::json!({
            "error": {
                "code": status.as_u16(),
                "message": error_message
            }
        }));

        (status, body).into_response()
    }
}

impl From<rusqlite::Error> for StorageNodeError {
    fn from(err: rusqlite::Error) -> Self {
        StorageNodeError::Sqlite(err.to_string())
    }
}

impl From<io::Error> for StorageNodeError {
    fn from(err: io::Error) -> Self {
        StorageNodeError::IO(err.to_string())
    }
}

impl From<reqwest::Error> for StorageNodeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            StorageNodeError::Timeout
        } else {
            StorageNodeError::Request(err.to_string())
        }
    }
}

impl From<config::ConfigError> for StorageNodeError {
    fn from(err: config::ConfigError) -> Self {
        StorageNodeError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for StorageNodeError {
    fn from(err: serde_json::Error) -> Self {
        StorageNodeError::Json(err.to_string())
    }
}

impl From<tokio::task::JoinError> for StorageNodeError {
    fn from(err: tokio::task::JoinError) -> Self {
        StorageNodeError::TaskFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_classification() {
        assert!(StorageNodeError::Timeout.is_network());
        assert!(StorageNodeError::Network("down".into()).is_network());
        assert!(!StorageNodeError::Storage("disk".into()).is_network());
        assert!(!StorageNodeError::MalformedMessage("bad".into()).is_network());
    }

    #[test]
    fn test_error_response_status() {
        let response = StorageNodeError::MalformedMessage("bad json".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = StorageNodeError::RebalanceInProgress.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
