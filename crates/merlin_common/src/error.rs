use thiserror::Error;

use crate::types::{SchemaVersion, ShardId, TableId};

/// Convenience alias for `Result<T, MerlinError>`.
pub type MerlinResult<T> = Result<T, MerlinError>;

/// Error classification for retry/escalation decisions.
///
/// - `UserError`   — bad input; the request itself is at fault
/// - `Transient`   — timeout, admission rejection, backpressure; client MAY retry after back-off
/// - `InternalBug` — should never happen; fails the affected query only
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Transient,
    InternalBug,
}

/// Top-level error type that all crate-specific errors convert into.
#[derive(Error, Debug)]
pub enum MerlinError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised by the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("unknown table {0}")]
    UnknownTable(TableId),

    #[error("schema version mismatch: requested {requested}, current {current}")]
    SchemaVersionMismatch {
        requested: SchemaVersion,
        current: SchemaVersion,
    },
}

/// Errors raised while executing a read.
#[derive(Error, Debug)]
pub enum QueryError {
    /// The operation's deadline expired. Partial results are discarded.
    #[error("read timed out: {0}")]
    Timeout(String),

    /// The reader-concurrency semaphore could not admit the read.
    #[error("read admission rejected: {0}")]
    AdmissionRejected(String),

    /// The result exceeded the max-result-size cap and the slice does not
    /// allow short reads.
    #[error("result size limit exceeded: {0} bytes over the cap")]
    ResultTooLarge(u64),

    /// An illegal shard-reader state-machine transition was requested.
    /// Fails the affected query only.
    #[error("invalid reader state on {shard}: {details}")]
    InvalidReaderState { shard: ShardId, details: String },

    /// A shard worker is no longer accepting tasks.
    #[error("shard {0} unavailable")]
    ShardUnavailable(ShardId),
}

impl MerlinError {
    /// Construct an internal error, logging it at error level so invariant
    /// violations are visible even when the query error is swallowed.
    pub fn internal(msg: impl Into<String>) -> MerlinError {
        let msg = msg.into();
        tracing::error!("internal error: {}", msg);
        MerlinError::Internal(msg)
    }

    /// Classify this error for retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MerlinError::Storage(_) => ErrorKind::UserError,
            MerlinError::Query(q) => match q {
                QueryError::Timeout(_)
                | QueryError::AdmissionRejected(_)
                | QueryError::ShardUnavailable(_) => ErrorKind::Transient,
                QueryError::ResultTooLarge(_) => ErrorKind::UserError,
                QueryError::InvalidReaderState { .. } => ErrorKind::InternalBug,
            },
            MerlinError::Internal(_) => ErrorKind::InternalBug,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, MerlinError::Query(QueryError::Timeout(_)))
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_classified_transient() {
        let err = MerlinError::from(QueryError::Timeout("fill_buffer".into()));
        assert!(err.is_timeout());
        assert!(err.is_transient());
    }

    #[test]
    fn test_invalid_state_is_internal() {
        let err = MerlinError::from(QueryError::InvalidReaderState {
            shard: ShardId(3),
            details: "saving".into(),
        });
        assert_eq!(err.kind(), ErrorKind::InternalBug);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_internal_constructor() {
        let err = MerlinError::internal("permit mismatch");
        assert_eq!(err.kind(), ErrorKind::InternalBug);
        assert!(err.to_string().contains("permit mismatch"));
    }
}
