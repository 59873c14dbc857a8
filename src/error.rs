//! Errors surfaced by the node manager and their wire taxonomy.

use crate::driver::DriverError;
use crate::pool::PoolError;
use crate::session::SessionError;
use crate::storage::StorageError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error classes reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    Conflict,
    NotFound,
    NotAvailable,
    DriverFailure,
    StorageFailure,
    Timeout,
    PoolFull,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid_argument",
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
            Self::NotAvailable => "not_available",
            Self::DriverFailure => "driver_failure",
            Self::StorageFailure => "storage_failure",
            Self::Timeout => "timeout",
            Self::PoolFull => "pool_full",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from node manager operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Conflict(String),

    #[error("node not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    NotAvailable(String),

    #[error("driver failed for {node}: {source}")]
    Driver {
        node: String,
        #[source]
        source: DriverError,
    },

    #[error("storage failure: {0}")]
    Storage(#[source] StorageError),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("worker pool is full")]
    PoolFull,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ManagerError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::NotAvailable(_) => ErrorKind::NotAvailable,
            Self::Driver { .. } => ErrorKind::DriverFailure,
            Self::Storage(_) => ErrorKind::StorageFailure,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::PoolFull => ErrorKind::PoolFull,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<StorageError> for ManagerError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::AlreadyExists(name) => Self::Conflict(format!("node already exists: {name}")),
            StorageError::NotFound(name) => Self::NotFound(name),
            other => Self::Storage(other),
        }
    }
}

impl From<SessionError> for ManagerError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotFound(name) => Self::NotFound(name),
            e @ (SessionError::NotAvailable(_) | SessionError::Closing(_)) => {
                Self::NotAvailable(e.to_string())
            }
            SessionError::Driver { node, source } => Self::Driver { node, source },
            e @ SessionError::SpawnTimeout { .. } => Self::Timeout(e.to_string()),
            SessionError::Internal(message) => Self::Internal(message),
        }
    }
}

impl From<PoolError> for ManagerError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Full => Self::PoolFull,
            PoolError::Closed => Self::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_errors_map_to_kinds() {
        let conflict: ManagerError = StorageError::AlreadyExists("n1".into()).into();
        assert_eq!(conflict.kind(), ErrorKind::Conflict);

        let missing: ManagerError = StorageError::NotFound("n1".into()).into();
        assert_eq!(missing.kind(), ErrorKind::NotFound);

        let io: ManagerError = StorageError::Io {
            path: "/nowhere".into(),
            source: std::io::Error::other("disk gone"),
        }
        .into();
        assert_eq!(io.kind(), ErrorKind::StorageFailure);
    }

    #[test]
    fn test_session_errors_map_to_kinds() {
        let timeout: ManagerError = SessionError::SpawnTimeout {
            node: "n1".into(),
            timeout: std::time::Duration::from_secs(1),
        }
        .into();
        assert_eq!(timeout.kind(), ErrorKind::Timeout);

        let unavailable: ManagerError = SessionError::NotAvailable("n1".into()).into();
        assert_eq!(unavailable.kind(), ErrorKind::NotAvailable);
    }

    #[test]
    fn test_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&ErrorKind::InvalidArgument).unwrap(),
            "\"invalid_argument\""
        );
        assert_eq!(
            serde_json::from_str::<ErrorKind>("\"pool_full\"").unwrap(),
            ErrorKind::PoolFull
        );
        assert_eq!(ErrorKind::StorageFailure.to_string(), "storage_failure");
    }
}
