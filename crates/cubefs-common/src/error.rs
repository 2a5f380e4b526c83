//! Error types for the CubeFS storage core
//!
//! A single error enum is shared by the extent store, the data partition
//! pipeline and the cache engine. Classification helpers let callers decide
//! between repair, retry and escalation without matching on every variant.

use thiserror::Error;

/// Common result type
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type
#[derive(Debug, Error)]
pub enum Error {
    // Extent errors
    #[error("extent not found: {0}")]
    ExtentNotFound(u64),

    #[error("extent already exists: {0}")]
    AlreadyExists(u64),

    #[error("extent {0} was recently deleted")]
    ExtentDeleted(u64),

    #[error("parameter mismatch: {0}")]
    ParamMismatch(String),

    #[error("illegal overwrite on extent {extent_id} block {block_no}")]
    IllegalOverwrite { extent_id: u64, block_no: u64 },

    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("partition is still loading")]
    PartitionLoading,

    #[error("no available tiny extent")]
    NoAvailableExtent,

    #[error("no broken tiny extent")]
    NoBrokenExtent,

    // Cache errors
    #[error("cache block closed")]
    CacheClosed,

    #[error("range invalid: {0}")]
    RangeInvalid(String),

    #[error("insufficient space: required {required} bytes, available {available} bytes")]
    InsufficientSpace { required: u64, available: u64 },

    // Network/raft errors
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("not leader, current leader: {0}")]
    NotLeader(String),

    #[error("request timeout")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

/// Error messages that identify a failing disk rather than a bad request.
const DISK_ERROR_MESSAGES: &[&str] = &[
    "input/output error",
    "no space left on device",
    "read-only file system",
    "too many open files",
];

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a parameter mismatch error
    pub fn param_mismatch(msg: impl Into<String>) -> Self {
        Self::ParamMismatch(msg.into())
    }

    /// Create a range invalid error
    pub fn range_invalid(msg: impl Into<String>) -> Self {
        Self::RangeInvalid(msg.into())
    }

    /// Check whether the error comes from a failing filesystem.
    ///
    /// Matching is done on the rendered message so that errors wrapped by
    /// other layers are still recognised.
    #[must_use]
    pub fn is_disk_error(&self) -> bool {
        let msg = self.to_string().to_ascii_lowercase();
        DISK_ERROR_MESSAGES.iter().any(|m| msg.contains(m))
    }

    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::PeerUnreachable(_) | Self::PartitionLoading
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::ExtentNotFound(_) | Self::ExtentDeleted(_))
    }

    /// HTTP status code used by the node HTTP APIs
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            Self::ParamMismatch(_) | Self::RangeInvalid(_) | Self::Configuration(_) => 400,
            Self::ExtentNotFound(_) | Self::ExtentDeleted(_) => 404,
            Self::AlreadyExists(_) | Self::IllegalOverwrite { .. } => 409,
            Self::NotLeader(_)
            | Self::PartitionLoading
            | Self::NoAvailableExtent
            | Self::NoBrokenExtent
            | Self::PeerUnreachable(_)
            | Self::Timeout
            | Self::InsufficientSpace { .. } => 503,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_error_by_message() {
        let err = Error::from(std::io::Error::other("Input/output error"));
        assert!(err.is_disk_error());

        let err = Error::Internal("write failed: no space left on device".into());
        assert!(err.is_disk_error());

        assert!(!Error::ParamMismatch("offset".into()).is_disk_error());
        assert!(
            !Error::IllegalOverwrite {
                extent_id: 1024,
                block_no: 0
            }
            .is_disk_error()
        );
    }

    #[test]
    fn test_error_retryable() {
        assert!(Error::Timeout.is_retryable());
        assert!(Error::PartitionLoading.is_retryable());
        assert!(!Error::CacheClosed.is_retryable());
    }

    #[test]
    fn test_error_not_found() {
        assert!(Error::ExtentNotFound(1024).is_not_found());
        assert!(Error::ExtentDeleted(1024).is_not_found());
        assert!(!Error::AlreadyExists(1024).is_not_found());
    }

    #[test]
    fn test_error_http_status() {
        assert_eq!(Error::ExtentNotFound(1).http_status_code(), 404);
        assert_eq!(Error::NotLeader("a".into()).http_status_code(), 503);
        assert_eq!(Error::Internal("x".into()).http_status_code(), 500);
    }
}
