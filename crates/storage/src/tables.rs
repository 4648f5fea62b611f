//! Table definitions for redb storage.
//!
//! All tables use byte arrays as keys and values. Key encoding is handled
//! by the keys module; values are postcard-serialized records.

use redb::TableDefinition;

/// Table definitions for log storage.
pub struct Tables;

impl Tables {
    /// Tree records: {tree_id:8BE} -> serialized Tree
    pub const TREES: TableDefinition<'static, &'static [u8], &'static [u8]> =
        TableDefinition::new("trees");

    /// Tree control rows: {tree_id:8BE} -> serialized TreeControlRecord
    pub const TREE_CONTROL: TableDefinition<'static, &'static [u8], &'static [u8]> =
        TableDefinition::new("tree_control");

    /// Tree head history: {tree_id:8BE}{revision:8BE} -> serialized LogRoot
    pub const TREE_HEADS: TableDefinition<'static, &'static [u8], &'static [u8]> =
        TableDefinition::new("tree_heads");

    /// Subtree tiles: {tree_id:8BE}{prefix_len:1}{prefix}{revision:8BE}
    /// -> serialized SubtreeRecord
    pub const SUBTREES: TableDefinition<'static, &'static [u8], &'static [u8]> =
        TableDefinition::new("subtrees");

    /// Leaf payloads: {tree_id:8BE}{leaf_identity_hash:32}
    /// -> serialized LeafDataRecord
    pub const LEAF_DATA: TableDefinition<'static, &'static [u8], &'static [u8]> =
        TableDefinition::new("leaf_data");

    /// Sequence store: {tree_id:8BE}{sequence_number:8BE}
    /// -> serialized SequencedLeafRecord
    pub const SEQUENCED_LEAF: TableDefinition<'static, &'static [u8], &'static [u8]> =
        TableDefinition::new("sequenced_leaf");

    /// Uniqueness index: {tree_id:8BE}{leaf_identity_hash:32}
    /// -> sequence number (8BE)
    pub const SEQ_BY_IDENTITY: TableDefinition<'static, &'static [u8], &'static [u8]> =
        TableDefinition::new("seq_by_identity");

    /// Lookup index: {tree_id:8BE}{merkle_leaf_hash:32}{sequence_number:8BE}
    /// -> leaf identity hash (32 bytes)
    pub const SEQ_BY_MERKLE: TableDefinition<'static, &'static [u8], &'static [u8]> =
        TableDefinition::new("seq_by_merkle");

    /// Pending-work queue:
    /// {tree_id:8BE}{bucket:4BE}{queue_ts:8BE}{leaf_identity_hash:32}
    /// -> merkle leaf hash (32 bytes)
    ///
    /// Key order is exactly the dequeue order.
    pub const UNSEQUENCED: TableDefinition<'static, &'static [u8], &'static [u8]> =
        TableDefinition::new("unsequenced");

    /// All table definitions, for schema initialization.
    pub(crate) const ALL: [TableDefinition<'static, &'static [u8], &'static [u8]>; 9] = [
        Self::TREES,
        Self::TREE_CONTROL,
        Self::TREE_HEADS,
        Self::SUBTREES,
        Self::LEAF_DATA,
        Self::SEQUENCED_LEAF,
        Self::SEQ_BY_IDENTITY,
        Self::SEQ_BY_MERKLE,
        Self::UNSEQUENCED,
    ];
}
