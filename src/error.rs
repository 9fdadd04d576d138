//! Error types for transfer operations.

use std::io;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Failure taxonomy carried by [`crate::ErrorEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    /// Source path absent or not a regular file
    NotFound,
    /// The file could not be opened for reading or writing
    OpenFailed,
    /// A read or write failed after the file was opened
    IoError,
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("file does not exist: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("cannot open {}: {source}", path.display())]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("error transferring {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("a transfer is already running")]
    Busy,

    #[error("transfer worker is not running")]
    WorkerUnavailable,

    #[error("invalid options: {0}")]
    InvalidOptions(String),
}

impl TransferError {
    /// Event-facing kind, or `None` for errors that are returned synchronously
    /// by the controller and never travel as events.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            TransferError::NotFound { .. } => Some(ErrorKind::NotFound),
            TransferError::OpenFailed { .. } => Some(ErrorKind::OpenFailed),
            TransferError::Io { .. } => Some(ErrorKind::IoError),
            TransferError::Busy
            | TransferError::WorkerUnavailable
            | TransferError::InvalidOptions(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_map_to_event_kinds() {
        let not_found = TransferError::NotFound {
            path: PathBuf::from("/missing"),
        };
        assert_eq!(not_found.kind(), Some(ErrorKind::NotFound));

        let open = TransferError::OpenFailed {
            path: PathBuf::from("/ro"),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        };
        assert_eq!(open.kind(), Some(ErrorKind::OpenFailed));

        let io = TransferError::Io {
            path: PathBuf::from("/disk"),
            source: io::Error::other("disk full"),
        };
        assert_eq!(io.kind(), Some(ErrorKind::IoError));
    }

    #[test]
    fn controller_errors_have_no_event_kind() {
        assert_eq!(TransferError::Busy.kind(), None);
        assert_eq!(TransferError::WorkerUnavailable.kind(), None);
        assert_eq!(TransferError::InvalidOptions("x".into()).kind(), None);
    }

    #[test]
    fn messages_name_the_path() {
        let err = TransferError::NotFound {
            path: PathBuf::from("/nonexistent/path"),
        };
        assert_eq!(err.to_string(), "file does not exist: /nonexistent/path");
    }
}
