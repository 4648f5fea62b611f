//! Error types for the Canopy storage engine using snafu.
//!
//! Every public operation returns [`LogError`]. Backend-specific failures
//! are remapped into these variants at the storage boundary; callers (an
//! RPC layer, a sequencer) branch on [`LogError::kind`] and never see a
//! backend sentinel.

use snafu::{Location, Snafu};

use crate::tree::TreeId;

/// Unified result type for engine operations.
pub type Result<T, E = LogError> = std::result::Result<T, E>;

/// Coarse error taxonomy exposed to the RPC layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Tree or revision absent.
    NotFound,
    /// Deletion-state mismatch, sequencing conflict, or an attempt to
    /// mutate a frozen tree.
    FailedPrecondition,
    /// Malformed leaf, bad range parameters, unknown enum.
    InvalidArgument,
    /// Quota denial.
    ResourceExhausted,
    /// Transient backend conflict; the caller may retry the whole
    /// transaction.
    Aborted,
    /// Integrity violation or engine bug.
    Internal,
    /// Backend connection failure.
    Unavailable,
}

/// Top-level error type for engine operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum LogError {
    /// The requested tree does not exist.
    #[snafu(display("{tree_id} not found"))]
    TreeNotFound {
        /// Tree identifier.
        tree_id: TreeId,
    },

    /// No tree head exists yet; the caller must run the initialization
    /// path before using the tree.
    #[snafu(display("{tree_id} has no tree head: tree needs init"))]
    TreeNeedsInit {
        /// Tree identifier.
        tree_id: TreeId,
    },

    /// A lifecycle or sequencing precondition does not hold.
    #[snafu(display("failed precondition: {message}"))]
    FailedPrecondition {
        /// What precondition failed.
        message: String,
    },

    /// The caller supplied a malformed argument.
    #[snafu(display("invalid argument: {message}"))]
    InvalidArgument {
        /// What was malformed.
        message: String,
    },

    /// The unsequenced backlog would exceed the configured ceiling.
    #[snafu(display(
        "too many unsequenced rows: {count} queued + {requested} requested > limit {limit}"
    ))]
    TooManyUnsequencedRows {
        /// Current backlog size.
        count: u64,
        /// Tokens requested.
        requested: u64,
        /// Configured ceiling.
        limit: u64,
    },

    /// The backend transaction hit a transient conflict.
    #[snafu(display("transaction aborted at {location}: {message}"))]
    Aborted {
        /// Conflict description.
        message: String,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// Stored state violates an engine invariant.
    #[snafu(display("integrity violation at {location}: {message}"))]
    Integrity {
        /// Violated invariant.
        message: String,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// The backend reported an error the engine cannot act on.
    #[snafu(display("backend error at {location}: {message}"))]
    Backend {
        /// Error description.
        message: String,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// The backend could not be reached or opened.
    #[snafu(display("backend unavailable: {message}"))]
    Unavailable {
        /// Error description.
        message: String,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// A stored record failed to encode or decode.
    #[snafu(display("serialization error: {message}"))]
    Serialization {
        /// Error description.
        message: String,
    },
}

impl LogError {
    /// Maps the error onto the coarse taxonomy the RPC layer exposes.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LogError::TreeNotFound { .. } => ErrorKind::NotFound,
            LogError::TreeNeedsInit { .. } => ErrorKind::FailedPrecondition,
            LogError::FailedPrecondition { .. } => ErrorKind::FailedPrecondition,
            LogError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            LogError::TooManyUnsequencedRows { .. } => ErrorKind::ResourceExhausted,
            LogError::Aborted { .. } => ErrorKind::Aborted,
            LogError::Integrity { .. } => ErrorKind::Internal,
            LogError::Backend { .. } => ErrorKind::Internal,
            LogError::Serialization { .. } => ErrorKind::Internal,
            LogError::Unavailable { .. } => ErrorKind::Unavailable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let tree_id = TreeId::new(7);
        let cases: Vec<(LogError, ErrorKind)> = vec![
            (TreeNotFoundSnafu { tree_id }.build(), ErrorKind::NotFound),
            (TreeNeedsInitSnafu { tree_id }.build(), ErrorKind::FailedPrecondition),
            (
                FailedPreconditionSnafu { message: "tree is frozen" }.build(),
                ErrorKind::FailedPrecondition,
            ),
            (
                InvalidArgumentSnafu { message: "count must be > 0" }.build(),
                ErrorKind::InvalidArgument,
            ),
            (
                TooManyUnsequencedRowsSnafu { count: 20u64, requested: 1u64, limit: 20u64 }
                    .build(),
                ErrorKind::ResourceExhausted,
            ),
            (AbortedSnafu { message: "write lock poisoned" }.build(), ErrorKind::Aborted),
            (IntegritySnafu { message: "gap in sequence" }.build(), ErrorKind::Internal),
            (BackendSnafu { message: "checksum mismatch" }.build(), ErrorKind::Internal),
            (UnavailableSnafu { message: "io error" }.build(), ErrorKind::Unavailable),
            (
                SerializationSnafu { message: "truncated record" }.build(),
                ErrorKind::Internal,
            ),
        ];
        for (err, want) in cases {
            assert_eq!(err.kind(), want, "{err}");
        }
    }

    #[test]
    fn test_display_has_no_backend_sentinels() {
        let err = TreeNotFoundSnafu { tree_id: TreeId::new(3) }.build();
        assert_eq!(err.to_string(), "tree:3 not found");
    }
}
