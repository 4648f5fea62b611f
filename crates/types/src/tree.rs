//! Tree definitions and lifecycle state.
//!
//! A tree is a single verifiable append-only log instance. Its record
//! carries display metadata, lifecycle state, and the storage options that
//! were fixed at creation time.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a tree.
///
/// Wraps an `i64` with compile-time type safety; generated as a random
/// positive 63-bit integer at creation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TreeId(i64);

impl TreeId {
    /// Creates an identifier from a raw value.
    #[inline]
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw numeric value.
    #[inline]
    pub const fn value(self) -> i64 {
        self.0
    }
}

impl From<i64> for TreeId {
    #[inline]
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<TreeId> for i64 {
    #[inline]
    fn from(id: TreeId) -> Self {
        id.0
    }
}

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tree:{}", self.0)
    }
}

/// The kind of log a tree stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeType {
    /// Leaves are queued and assigned indices by the sequencer.
    Log,
    /// Leaves arrive with indices already assigned by the caller.
    PreorderedLog,
}

/// Lifecycle state of a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeState {
    /// Accepting new leaves and integrating.
    Active,
    /// No new leaves accepted; the queue backlog is still integrated.
    Draining,
    /// No new leaves accepted and nothing left to integrate.
    Frozen,
}

/// Storage options fixed when a tree is created.
///
/// Persisted as an explicitly-present record: a tree row that predates
/// this record decodes as `None`, which is distinguishable from a record
/// written with default values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageOptions {
    /// Whether subtree tiles are written at each revision. When false,
    /// tiles are overwritten in place and historical roots cannot be
    /// reconstructed from storage.
    pub subtree_revisions: bool,
}

impl Default for StorageOptions {
    fn default() -> Self {
        // New trees skip writing subtree revisions.
        Self { subtree_revisions: false }
    }
}

/// A tree record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    /// Unique identifier, assigned at creation.
    pub id: TreeId,
    /// Log kind; immutable after creation except `PreorderedLog -> Log`.
    pub tree_type: TreeType,
    /// Lifecycle state.
    pub state: TreeState,
    /// Human-readable name.
    pub display_name: String,
    /// Human-readable description.
    pub description: String,
    /// Creation time, whole milliseconds since the Unix epoch.
    pub create_time_millis: i64,
    /// Last-update time, whole milliseconds since the Unix epoch.
    pub update_time_millis: i64,
    /// How stale a tree head may become before a new one must be produced
    /// even without new leaves.
    pub max_root_duration_millis: i64,
    /// Soft-deletion tombstone.
    pub deleted: bool,
    /// When the tombstone was set, whole milliseconds since the Unix epoch.
    pub delete_time_millis: Option<i64>,
    /// Storage options; `None` on rows written before options existed.
    pub storage_options: Option<StorageOptions>,
}

impl Tree {
    /// Creates a tree definition with defaults suitable for `create_tree`.
    ///
    /// The id and timestamps are assigned by the admin store.
    pub fn new(tree_type: TreeType) -> Self {
        Self {
            id: TreeId::new(0),
            tree_type,
            state: TreeState::Active,
            display_name: String::new(),
            description: String::new(),
            create_time_millis: 0,
            update_time_millis: 0,
            max_root_duration_millis: 0,
            deleted: false,
            delete_time_millis: None,
            storage_options: None,
        }
    }

    /// Whether subtree tiles are revisioned for this tree.
    ///
    /// Rows with no stored options predate the setting and were written by
    /// versions that always kept revisions.
    pub fn subtree_revisions(&self) -> bool {
        self.storage_options.map_or(true, |o| o.subtree_revisions)
    }
}
