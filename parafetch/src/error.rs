//! Error types for the download engine.
//!
//! Every failure the engine surfaces maps onto one [`ErrorKind`]. The kind
//! decides whether a failure is retried (transient), ends a chunk at once
//! (permanent), or is reported before any chunk runs (planning).

use std::fmt;
use std::ops::Range;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::source::{LocatorError, ResolveError, TransferId};
use crate::transfer::TransferStatus;

/// Classification of an engine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid total size, zero workers, failed probe or resolution.
    Planning,
    /// Network error, stall timeout, truncated body or a retryable status.
    Transient,
    /// Non-retryable status, destination I/O failure, ignored range request.
    Permanent,
    /// Plan overlap, size mismatch or checksum mismatch.
    Integrity,
    /// Stopped by pause or cancel. Never surfaced as a failure.
    Canceled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Planning => "planning",
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Canceled => "canceled",
        };
        f.write_str(name)
    }
}

/// Failure of a single range request attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("no data received for {timeout:?}")]
    Stalled { timeout: Duration },

    #[error("server answered with HTTP {status}")]
    Status { status: u16 },

    #[error("body ended after {received} of {expected} bytes")]
    UnexpectedEof { expected: u64, received: u64 },

    #[error("server ignored range request at offset {offset}")]
    RangeIgnored { offset: u64 },

    #[error("write at offset {offset} failed: {reason}")]
    Sink { offset: u64, reason: String },
}

impl FetchError {
    /// Maps a non-success HTTP status onto a fetch error.
    pub fn from_status(status: u16) -> Self {
        FetchError::Status { status }
    }

    /// Whether another attempt could plausibly succeed.
    ///
    /// 408, 429 and every 5xx are retried. Any other status, including 416,
    /// means the request itself is wrong and retrying cannot help.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Network(_) | FetchError::Stalled { .. } => true,
            FetchError::UnexpectedEof { .. } => true,
            FetchError::Status { status } => matches!(status, 408 | 429 | 500..=599),
            FetchError::RangeIgnored { .. } | FetchError::Sink { .. } => false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        if self.is_transient() {
            ErrorKind::Transient
        } else {
            ErrorKind::Permanent
        }
    }
}

/// Failure of a whole transfer, or of an operation invoked on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("planning failed: {0}")]
    Planning(String),

    #[error("could not resolve download URL: {0}")]
    Resolve(#[from] ResolveError),

    #[error("could not probe {url}: {source}")]
    Probe {
        url: String,
        #[source]
        source: FetchError,
    },

    #[error(
        "chunk {index} [{}, {}) failed after {attempts} attempt(s): {source}",
        .range.start,
        .range.end
    )]
    ChunkFailed {
        index: usize,
        range: Range<u64>,
        attempts: u32,
        #[source]
        source: FetchError,
    },

    #[error("chunk plan is inconsistent: {0}")]
    InvalidPlan(String),

    #[error("size mismatch: expected {expected} bytes, found {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("{pending} chunk(s) never completed")]
    Incomplete { pending: usize },

    #[error("I/O error on {}: {reason}", .path.display())]
    Io { path: PathBuf, reason: String },

    #[error("transfer was canceled")]
    Canceled,

    #[error("cannot {action} a transfer that is {status}")]
    InvalidState {
        action: &'static str,
        status: TransferStatus,
    },
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::Planning(_)
            | TransferError::Resolve(_)
            | TransferError::Probe { .. }
            | TransferError::InvalidState { .. } => ErrorKind::Planning,
            TransferError::ChunkFailed { source, .. } => source.kind(),
            TransferError::InvalidPlan(_)
            | TransferError::SizeMismatch { .. }
            | TransferError::ChecksumMismatch { .. }
            | TransferError::Incomplete { .. } => ErrorKind::Integrity,
            TransferError::Io { .. } => ErrorKind::Permanent,
            TransferError::Canceled => ErrorKind::Canceled,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        TransferError::Io {
            path: path.into(),
            reason: err.to_string(),
        }
    }
}

/// Errors from the transfer registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManagerError {
    #[error("transfer {0} already exists")]
    AlreadyExists(TransferId),

    #[error("transfer {0} not found")]
    NotFound(TransferId),

    #[error(transparent)]
    Locator(#[from] LocatorError),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// Errors loading or validating engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {reason}", .path.display())]
    Read { path: PathBuf, reason: String },

    #[error("invalid value {value:?} for [{section}] {key}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses_are_transient() {
        for status in [408, 429, 500, 502, 503, 504] {
            assert!(FetchError::from_status(status).is_transient(), "{status}");
        }
    }

    #[test]
    fn test_client_statuses_are_permanent() {
        for status in [400, 401, 403, 404, 410, 416] {
            let err = FetchError::from_status(status);
            assert!(!err.is_transient(), "{status}");
            assert_eq!(err.kind(), ErrorKind::Permanent);
        }
    }

    #[test]
    fn test_network_and_stall_are_transient() {
        assert!(FetchError::Network("reset".into()).is_transient());
        assert!(FetchError::Stalled {
            timeout: Duration::from_secs(30)
        }
        .is_transient());
        assert!(FetchError::UnexpectedEof {
            expected: 10,
            received: 4
        }
        .is_transient());
    }

    #[test]
    fn test_sink_and_ignored_range_are_permanent() {
        assert!(!FetchError::RangeIgnored { offset: 5 }.is_transient());
        assert!(!FetchError::Sink {
            offset: 0,
            reason: "disk full".into()
        }
        .is_transient());
    }

    #[test]
    fn test_chunk_failed_kind_follows_cause() {
        let err = TransferError::ChunkFailed {
            index: 2,
            range: 10..20,
            attempts: 3,
            source: FetchError::from_status(503),
        };
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(
            err.to_string(),
            "chunk 2 [10, 20) failed after 3 attempt(s): server answered with HTTP 503"
        );
    }

    #[test]
    fn test_integrity_kinds() {
        let err = TransferError::SizeMismatch {
            expected: 10,
            actual: 9,
        };
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert_eq!(
            TransferError::InvalidPlan("gap".into()).kind(),
            ErrorKind::Integrity
        );
    }

    #[test]
    fn test_invalid_state_display() {
        let err = TransferError::InvalidState {
            action: "pause",
            status: TransferStatus::Completed,
        };
        assert_eq!(err.to_string(), "cannot pause a transfer that is completed");
        assert_eq!(err.kind(), ErrorKind::Planning);
    }
}
