//! Error types for the control plane

use std::fmt;

/// Result type alias for control-plane operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the control plane
#[derive(Debug)]
pub enum Error {
    /// IO errors
    Io(std::io::Error),
    /// Node control-surface HTTP errors
    Http(reqwest::Error),
    /// Serialization errors
    Serialization(String),
    /// Version store errors
    Storage(String),
    /// Configuration errors
    Config(String),
    /// No cluster is configured
    ClusterNotFound,
    /// Named group is not part of the cluster
    GroupNotFound(String),
    /// No active topology version exists for the service
    VersionNotFound,
    /// Named topology version does not exist in the store
    UnknownVersion(String),
    /// Persisted snapshot belongs to a different cluster
    ClusterMismatch { expected: String, actual: String },
    /// Persisted snapshot was computed for a different shard count
    ShardTotalMismatch { expected: u32, actual: u32 },
    /// The store's active version is not the one the caller observed
    ActiveVersionConflict { expected: String, actual: String },
    /// Node returned a non-success HTTP status
    UnexpectedStatus { url: String, status: u16 },
    /// Internal error
    Internal(String),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Http(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Http(e) => write!(f, "HTTP error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Storage(msg) => write!(f, "Version store error: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::ClusterNotFound => write!(f, "No cluster is configured"),
            Error::GroupNotFound(name) => write!(f, "Group not found: {}", name),
            Error::VersionNotFound => write!(f, "No active shard version found"),
            Error::UnknownVersion(version) => write!(f, "Unknown shard version: {}", version),
            Error::ClusterMismatch { expected, actual } => write!(
                f,
                "Stored shard version belongs to cluster '{}', current cluster is '{}'",
                actual, expected
            ),
            Error::ShardTotalMismatch { expected, actual } => write!(
                f,
                "Stored shard version has {} shards, current config has {}; reassignment required",
                actual, expected
            ),
            Error::ActiveVersionConflict { expected, actual } => write!(
                f,
                "Active version conflict: expected '{}', store has '{}'",
                expected, actual
            ),
            Error::UnexpectedStatus { url, status } => {
                write!(f, "Unexpected HTTP status {} from {}", status, url)
            }
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(e: redb::DatabaseError) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(e: redb::TransactionError) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<redb::TableError> for Error {
    fn from(e: redb::TableError) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<redb::StorageError> for Error {
    fn from(e: redb::StorageError) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<redb::CommitError> for Error {
    fn from(e: redb::CommitError) -> Self {
        Error::Storage(e.to_string())
    }
}
