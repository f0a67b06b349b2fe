//! Error types for CowDB.
//!
//! Every fallible operation in the engine returns [`Result`]. The variants
//! mirror the recovery contract of the public API: `Locked` means another
//! process holds the file and the caller may retry, `Corrupt` and `Version`
//! are fatal at open, and the `Tx*`/`Bucket*` variants are recoverable user
//! errors. Internal invariant violations (a page count exceeding capacity, a
//! freelist id overlapping the tree) are assertions, not error values.

use std::io;
use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in CowDB operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the underlying file or mmap.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Another process holds the advisory lock on the database file.
    #[error("database file is locked by another process")]
    Locked,

    /// On-disk state failed validation (bad magic, checksum, or structure).
    #[error("corrupt database: {reason}")]
    Corrupt { reason: String },

    /// The file was written by an incompatible format version.
    #[error("unsupported format version: expected {expected}, found {found}")]
    Version { expected: u32, found: u32 },

    /// The database handle has been closed.
    #[error("database is closed")]
    Closed,

    /// The transaction has already been committed or rolled back.
    #[error("transaction has already been committed or rolled back")]
    TxClosed,

    /// A mutating operation was attempted on a read-only transaction.
    #[error("transaction is read-only")]
    TxReadOnly,

    /// `close` was called while transactions are still open.
    #[error("cannot close database while transactions are open")]
    TxOpen,

    /// The named bucket does not exist.
    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    /// A bucket with this name already exists.
    #[error("bucket already exists: {0}")]
    BucketExists(String),

    /// The caller passed an argument the engine rejects.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A record does not fit in the logical span of its page.
    #[error("record does not fit in the page span")]
    OutOfSpace,
}

impl Error {
    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        Error::Corrupt {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn corrupt_display() {
        let err = Error::corrupt("bad magic on page 7");
        assert_eq!(err.to_string(), "corrupt database: bad magic on page 7");
    }

    #[test]
    fn version_display() {
        let err = Error::Version {
            expected: 1,
            found: 9,
        };
        assert_eq!(
            err.to_string(),
            "unsupported format version: expected 1, found 9"
        );
    }

    #[test]
    fn bucket_errors_display() {
        let err = Error::BucketNotFound("users".to_string());
        assert_eq!(err.to_string(), "bucket not found: users");

        let err = Error::BucketExists("users".to_string());
        assert_eq!(err.to_string(), "bucket already exists: users");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Error>();
    }
}
