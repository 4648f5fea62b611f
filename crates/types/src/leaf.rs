//! Log leaf records and queueing results.

use serde::{Deserialize, Serialize};

use crate::hash::{leaf_hash, sha256, Hash};

/// Sentinel index for a leaf that has not been sequenced.
pub const LEAF_INDEX_UNSEQUENCED: i64 = -1;

/// A leaf of a log tree.
///
/// The identity hash is the dedup key: two leaves with equal identity
/// hashes within a tree denote the same leaf. The Merkle leaf hash is the
/// value folded into the tree and need not be unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLeaf {
    /// RFC 6962 hash of `leaf_value`; inserted into the Merkle tree.
    pub merkle_leaf_hash: Hash,
    /// Dedup key, unique per tree.
    pub leaf_identity_hash: Hash,
    /// Opaque payload.
    pub leaf_value: Vec<u8>,
    /// Opaque side data, not covered by the Merkle hash.
    pub extra_data: Vec<u8>,
    /// Position in the sequenced log; [`LEAF_INDEX_UNSEQUENCED`] while
    /// queued.
    pub leaf_index: i64,
    /// Nanoseconds since the Unix epoch, set at enqueue.
    pub queue_timestamp_nanos: i64,
    /// Nanoseconds since the Unix epoch, set when the leaf is folded into
    /// a signed tree head. Zero while unsequenced.
    pub integrate_timestamp_nanos: i64,
}

impl LogLeaf {
    /// Builds a leaf from its payload, deriving both hashes.
    ///
    /// The identity hash defaults to SHA-256 of the value; callers with a
    /// richer identity (e.g. deduplicating on a subset of the payload) set
    /// `leaf_identity_hash` themselves.
    pub fn new(leaf_value: Vec<u8>, extra_data: Vec<u8>) -> Self {
        Self {
            merkle_leaf_hash: leaf_hash(&leaf_value),
            leaf_identity_hash: sha256(&leaf_value),
            leaf_value,
            extra_data,
            leaf_index: LEAF_INDEX_UNSEQUENCED,
            queue_timestamp_nanos: 0,
            integrate_timestamp_nanos: 0,
        }
    }
}

/// Outcome of queueing one leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueStatus {
    /// The leaf was accepted and is awaiting sequencing.
    Queued,
    /// A leaf with the same identity hash already exists; the canonical
    /// stored row is returned instead of the submitted one.
    AlreadyExists,
    /// The leaf conflicts with an already-sequenced entry (pre-ordered
    /// logs only).
    FailedPrecondition,
}

/// Per-position result of `queue_leaves` / `add_sequenced_leaves`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedLogLeaf {
    /// The queued leaf, or the canonical stored row for duplicates.
    pub leaf: LogLeaf,
    /// Queueing outcome for this input position.
    pub status: QueueStatus,
}
