//! Error types for the graph engine

use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MinefieldError>;

/// Coarse classification surfaced to RPC callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidInput,
    Conflict,
    Precondition,
    Backend,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Precondition => "precondition",
            ErrorKind::Backend => "backend",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum MinefieldError {
    #[error("Node not found: {0}")]
    NodeNotFound(u32),

    #[error("Node name not found: {0}")]
    NameNotFound(String),

    #[error("Cache not found for node {0}")]
    CacheNotFound(u32),

    #[error("Key not bound: {0}")]
    KeyNotFound(u32),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid glob pattern: {0}")]
    InvalidGlob(#[from] globset::Error),

    #[error("Node {0} cannot depend on itself")]
    SelfDependency(u32),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Storage error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Thread pool error: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

impl MinefieldError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MinefieldError::NodeNotFound(_)
            | MinefieldError::NameNotFound(_)
            | MinefieldError::CacheNotFound(_)
            | MinefieldError::KeyNotFound(_) => ErrorKind::NotFound,
            MinefieldError::InvalidQuery(_)
            | MinefieldError::InvalidGlob(_) => ErrorKind::InvalidInput,
            MinefieldError::SelfDependency(_) => ErrorKind::Conflict,
            MinefieldError::Precondition(_) => ErrorKind::Precondition,
            MinefieldError::Cancelled => ErrorKind::Cancelled,
            MinefieldError::Io(_)
            | MinefieldError::Json(_)
            | MinefieldError::Serialization(_)
            | MinefieldError::Sled(_)
            | MinefieldError::Base64(_)
            | MinefieldError::Corrupt(_)
            | MinefieldError::Pool(_) => ErrorKind::Backend,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(MinefieldError::NodeNotFound(3).kind(), ErrorKind::NotFound);
        assert_eq!(MinefieldError::SelfDependency(1).kind(), ErrorKind::Conflict);
        assert_eq!(MinefieldError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            MinefieldError::InvalidQuery("empty script".into()).kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(ErrorKind::Precondition.to_string(), "precondition");
    }
}
