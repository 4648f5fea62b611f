//! Remapping of backend errors onto the engine taxonomy.
//!
//! redb error types never cross a public API: every call site converts
//! them here, and only the remapped kind reaches callers.

use canopy_types::error::{
    AbortedSnafu, BackendSnafu, SerializationSnafu, UnavailableSnafu,
};
use canopy_types::LogError;

/// Failure to begin a transaction. Poisoned or contended transaction state
/// is transient; callers may retry the whole operation.
pub(crate) fn txn_err(err: redb::TransactionError) -> LogError {
    AbortedSnafu { message: err.to_string() }.build()
}

/// Failure to commit. Treated as transient: the transaction has rolled
/// back and the caller may retry it in full.
pub(crate) fn commit_err(err: redb::CommitError) -> LogError {
    AbortedSnafu { message: err.to_string() }.build()
}

/// Failure to open a table inside a healthy transaction.
pub(crate) fn table_err(err: redb::TableError) -> LogError {
    BackendSnafu { message: err.to_string() }.build()
}

/// Row-level storage failure.
pub(crate) fn storage_err(err: redb::StorageError) -> LogError {
    BackendSnafu { message: err.to_string() }.build()
}

/// Failure to open or create the database itself.
pub(crate) fn db_err(err: redb::DatabaseError) -> LogError {
    UnavailableSnafu { message: err.to_string() }.build()
}

/// Record encode/decode failure.
pub(crate) fn codec_err(err: postcard::Error) -> LogError {
    SerializationSnafu { message: err.to_string() }.build()
}
