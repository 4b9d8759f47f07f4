//! Error types for the cluster core.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ClusterError>;

/// The main error type.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// The named index is not registered (or not present in the catalog).
    #[error("Index <{0}> does not exist")]
    IndexNotFound(String),

    /// The segment is not loaded on this member.
    #[error("Segment <{segment}> is not loaded for index <{index}>")]
    SegmentNotFound { index: String, segment: u32 },

    #[error("Index <{0}> already exists")]
    AlreadyExists(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Failed to parse query: {0}")]
    QueryParse(String),

    /// Federated responses did not cover the segment set exactly.
    #[error("Inconsistent response: {0}")]
    InconsistentResponse(String),

    /// The merged result was still short after a full fetch.
    #[error("Full fetch request is short for query <{0}>")]
    ShortResult(String),

    #[error("Member <{member}> unreachable: {reason}")]
    MemberUnreachable { member: String, reason: String },

    /// Failure inside a local shard.
    #[error("Index error: {0}")]
    Index(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),
}

impl ClusterError {
    pub fn index_not_found(name: impl Into<String>) -> Self {
        ClusterError::IndexNotFound(name.into())
    }

    pub fn segment_not_found(index: impl Into<String>, segment: u32) -> Self {
        ClusterError::SegmentNotFound {
            index: index.into(),
            segment,
        }
    }

    pub fn already_exists(name: impl Into<String>) -> Self {
        ClusterError::AlreadyExists(name.into())
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        ClusterError::InvalidConfig(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        ClusterError::InvalidArgument(msg.into())
    }

    pub fn query_parse(msg: impl Into<String>) -> Self {
        ClusterError::QueryParse(msg.into())
    }

    pub fn inconsistent(msg: impl Into<String>) -> Self {
        ClusterError::InconsistentResponse(msg.into())
    }

    pub fn unreachable(member: impl ToString, reason: impl Into<String>) -> Self {
        ClusterError::MemberUnreachable {
            member: member.to_string(),
            reason: reason.into(),
        }
    }

    pub fn index(msg: impl Into<String>) -> Self {
        ClusterError::Index(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ClusterError::Internal(msg.into())
    }

    /// Returns true for errors that report a missing index or segment.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ClusterError::IndexNotFound(_) | ClusterError::SegmentNotFound { .. }
        )
    }
}
