//! Classification of driver errors, so business logic never inspects raw
//! error codes. The mongodb crate doesn't provide error code constants, so
//! the ones we need are defined here.

use mongodb::error::{
    Error as DbError, ErrorKind, WriteFailure, TRANSIENT_TRANSACTION_ERROR,
    UNKNOWN_TRANSACTION_COMMIT_RESULT,
};

pub const DUPLICATE_KEY: i32 = 11000;
pub const WRITE_CONFLICT: i32 = 112;

/// What kind of storage failure an error represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageFailure {
    /// A unique index rejected the write.
    DuplicateKey,
    /// The operation may succeed if the enclosing transaction is retried.
    Transient,
    /// Anything else. Fatal to the request.
    Other,
}

/// Classify a driver error.
pub fn classify(err: &DbError) -> StorageFailure {
    if is_duplicate_key(err) {
        StorageFailure::DuplicateKey
    } else if err.contains_label(TRANSIENT_TRANSACTION_ERROR) || error_code(err) == Some(WRITE_CONFLICT)
    {
        StorageFailure::Transient
    } else {
        StorageFailure::Other
    }
}

/// Return true if the given error is a duplicate key error.
pub fn is_duplicate_key(err: &DbError) -> bool {
    match *err.kind {
        ErrorKind::BulkWrite(ref failure) => failure
            .write_errors
            .iter()
            .flatten()
            .any(|e| e.code == DUPLICATE_KEY),
        _ => error_code(err) == Some(DUPLICATE_KEY),
    }
}

/// Return true if a commit should be retried without rerunning the transaction.
pub fn is_unknown_commit_result(err: &DbError) -> bool {
    err.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT)
}

fn error_code(err: &DbError) -> Option<i32> {
    match *err.kind {
        ErrorKind::Write(WriteFailure::WriteError(ref e)) => Some(e.code),
        ErrorKind::Command(ref e) => Some(e.code),
        _ => None,
    }
}
