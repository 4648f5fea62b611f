//! Tree heads: committed snapshots of a log.

use serde::{Deserialize, Serialize};

use crate::hash::Hash;

/// A tree head: the commitment to the first `tree_size` sequenced leaves
/// at a given revision.
///
/// The engine stores heads append-only with strictly increasing revisions;
/// signing is the caller's responsibility and `signature` is persisted as
/// an opaque placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRoot {
    /// Number of sequenced leaves this head commits to.
    pub tree_size: u64,
    /// RFC 6962 root over the first `tree_size` leaves.
    pub root_hash: Hash,
    /// Nanoseconds since the Unix epoch; strictly increasing across heads.
    pub timestamp_nanos: u64,
    /// Revision label; strictly increasing, assigned by the transaction.
    pub revision: u64,
    /// Reserved for caller metadata. The engine rejects non-empty values
    /// it cannot interpret.
    pub metadata: Vec<u8>,
    /// Signature bytes placeholder; written as supplied.
    pub signature: Vec<u8>,
}

impl LogRoot {
    /// The head written by the initialization path of a brand-new tree.
    pub fn initial(timestamp_nanos: u64) -> Self {
        Self {
            tree_size: 0,
            root_hash: crate::hash::EMPTY_ROOT_HASH,
            timestamp_nanos,
            revision: 0,
            metadata: Vec::new(),
            signature: Vec::new(),
        }
    }
}
