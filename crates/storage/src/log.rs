//! Log storage: the queue -> dequeue -> sequence -> integrate pipeline and
//! tree head history, bundled into one backend transaction per operation.

use std::collections::HashMap;
use std::ops::Bound;

use redb::{ReadableTable, ReadTransaction, WriteTransaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use canopy_types::error::{
    FailedPreconditionSnafu, IntegritySnafu, InvalidArgumentSnafu, TreeNeedsInitSnafu,
};
use canopy_types::leaf::LEAF_INDEX_UNSEQUENCED;
use canopy_types::{
    leaf_hash, Hash, LogLeaf, LogRoot, NodeId, QueueStatus, QueuedLogLeaf, Result, Tree,
    TreeId, TreeState, TreeType, EMPTY_ROOT_HASH,
};

use crate::cache::SubtreeCache;
use crate::engine::StorageEngine;
use crate::errors::{codec_err, commit_err, storage_err, table_err, txn_err};
use crate::keys::{self, UnsequencedKey};
use crate::tables::Tables;

/// Queue shard assigned to enqueued leaves. A single bucket keeps dequeue
/// order global per tree; the key layout already supports sharding.
const DEFAULT_BUCKET: u32 = 0;

/// Stored leaf payload; the identity hash lives in the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LeafDataRecord {
    leaf_value: Vec<u8>,
    extra_data: Vec<u8>,
    queue_timestamp_nanos: i64,
}

/// Sequence store row; the sequence number lives in the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SequencedLeafRecord {
    leaf_identity_hash: Hash,
    merkle_leaf_hash: Hash,
    integrate_timestamp_nanos: i64,
}

/// Log store over the shared engine.
#[derive(Clone)]
pub struct LogStorage {
    engine: StorageEngine,
}

impl LogStorage {
    /// Creates a log store sharing the given engine.
    pub fn new(engine: StorageEngine) -> Self {
        Self { engine }
    }

    /// Opens a read-write log transaction pinned to the latest tree head.
    ///
    /// Succeeds even when no head exists yet so the caller can run the
    /// initialization path; [`LogTransaction::needs_init`] reports that
    /// state and most operations refuse to run before a head is stored.
    pub fn begin(&self, tree: &Tree) -> Result<LogTransaction> {
        if tree.deleted {
            return FailedPreconditionSnafu { message: format!("{} is soft deleted", tree.id) }
                .fail();
        }
        let txn = self.engine.db().begin_write().map_err(txn_err)?;
        let stored = {
            let heads = txn.open_table(Tables::TREE_HEADS).map_err(table_err)?;
            latest_root(&heads, tree.id)?
        };
        let (root, needs_init) = match stored {
            Some(root) => (root, false),
            None => (empty_root(), true),
        };
        let read_revision = root.revision;
        let write_revision = if needs_init { 0 } else { read_revision + 1 };
        Ok(LogTransaction {
            txn,
            tree_id: tree.id,
            tree_type: tree.tree_type,
            tree_state: tree.state,
            revisioned: tree.subtree_revisions(),
            needs_init,
            root,
            write_revision,
            cache: SubtreeCache::new(tree.id, read_revision),
            dequeued: HashMap::new(),
        })
    }

    /// Opens a read-only snapshot pinned to the latest tree head.
    pub fn snapshot(&self, tree: &Tree) -> Result<LogSnapshot> {
        if tree.deleted {
            return FailedPreconditionSnafu { message: format!("{} is soft deleted", tree.id) }
                .fail();
        }
        let txn = self.engine.db().begin_read().map_err(txn_err)?;
        let stored = {
            let heads = txn.open_table(Tables::TREE_HEADS).map_err(table_err)?;
            latest_root(&heads, tree.id)?
        };
        let (root, needs_init) = match stored {
            Some(root) => (root, false),
            None => (empty_root(), true),
        };
        let read_revision = root.revision;
        Ok(LogSnapshot {
            txn,
            tree_id: tree.id,
            tree_type: tree.tree_type,
            needs_init,
            cache: SubtreeCache::new(tree.id, read_revision),
            root,
        })
    }

    /// Runs `f` inside one log transaction, committing on success and
    /// rolling back on error or panic.
    ///
    /// Unlike the convenience wrappers, `f` also runs when the tree still
    /// needs initialization, so it can store the first head.
    pub fn read_write_transaction<T>(
        &self,
        tree: &Tree,
        f: impl FnOnce(&mut LogTransaction) -> Result<T>,
    ) -> Result<T> {
        let mut tx = self.begin(tree)?;
        match f(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                // Dropping the transaction rolls the backend back.
                warn!(tree_id = tree.id.value(), error = %err, "log transaction rolled back");
                Err(err)
            }
        }
    }

    /// Queues leaves in their own transaction, returning one result per
    /// input position.
    pub fn queue_leaves(
        &self,
        tree: &Tree,
        leaves: &[LogLeaf],
        queue_timestamp_nanos: i64,
    ) -> Result<Vec<QueuedLogLeaf>> {
        let mut tx = self.begin(tree)?;
        if tx.needs_init() {
            return TreeNeedsInitSnafu { tree_id: tree.id }.fail();
        }
        let queued = tx.queue_leaves(leaves, queue_timestamp_nanos)?;
        tx.commit()?;
        Ok(queued)
    }

    /// Adds pre-sequenced leaves in their own transaction, returning one
    /// result per input position.
    pub fn add_sequenced_leaves(
        &self,
        tree: &Tree,
        leaves: &[LogLeaf],
        timestamp_nanos: i64,
    ) -> Result<Vec<QueuedLogLeaf>> {
        let mut tx = self.begin(tree)?;
        if tx.needs_init() {
            return TreeNeedsInitSnafu { tree_id: tree.id }.fail();
        }
        let added = tx.add_sequenced_leaves(leaves, timestamp_nanos)?;
        tx.commit()?;
        Ok(added)
    }

    /// Ids of all trees a sequencer should visit: non-deleted logs in
    /// Active or Draining state (draining trees still integrate their
    /// backlog).
    pub fn active_log_ids(&self) -> Result<Vec<TreeId>> {
        let txn = self.engine.db().begin_read().map_err(txn_err)?;
        let trees = txn.open_table(Tables::TREES).map_err(table_err)?;
        let mut ids = Vec::new();
        for entry in trees.iter().map_err(storage_err)? {
            let (_, value) = entry.map_err(storage_err)?;
            let tree: Tree = postcard::from_bytes(value.value()).map_err(codec_err)?;
            if !tree.deleted
                && matches!(tree.state, TreeState::Active | TreeState::Draining)
            {
                ids.push(tree.id);
            }
        }
        Ok(ids)
    }
}

/// A read-write log transaction.
///
/// Wraps one backend write transaction; nothing is visible to other
/// transactions until [`Self::commit`]. Dropping the value without
/// committing rolls everything back.
pub struct LogTransaction {
    txn: WriteTransaction,
    tree_id: TreeId,
    tree_type: TreeType,
    tree_state: TreeState,
    revisioned: bool,
    needs_init: bool,
    root: LogRoot,
    write_revision: u64,
    cache: SubtreeCache,
    /// Leaves already handed out by this transaction, so repeated dequeue
    /// calls never surface the same leaf twice.
    dequeued: HashMap<Hash, UnsequencedKey>,
}

impl LogTransaction {
    /// Whether the tree has no head yet and must run the initialization
    /// path (store a size-0 root at revision 0).
    pub fn needs_init(&self) -> bool {
        self.needs_init
    }

    /// The revision this transaction writes at.
    pub fn write_revision(&self) -> u64 {
        self.write_revision
    }

    /// Queues leaves for sequencing.
    ///
    /// Inserts happen in identity-hash order regardless of input order, so
    /// concurrent producers acquire row locks in one total order. A leaf
    /// whose identity hash already exists is not an error: the canonical
    /// stored row is returned at that position marked `AlreadyExists`.
    pub fn queue_leaves(
        &mut self,
        leaves: &[LogLeaf],
        queue_timestamp_nanos: i64,
    ) -> Result<Vec<QueuedLogLeaf>> {
        if self.tree_type != TreeType::Log {
            return InvalidArgumentSnafu {
                message: "queue_leaves requires a Log tree; use add_sequenced_leaves",
            }
            .fail();
        }
        self.check_accepts_leaves()?;

        let ordered = sort_by_identity_hash(leaves);
        // Input position -> canonical identity hash, for duplicates only.
        let mut duplicates: HashMap<usize, Hash> = HashMap::new();
        {
            let mut leaf_table = self.txn.open_table(Tables::LEAF_DATA).map_err(table_err)?;
            let mut queue = self.txn.open_table(Tables::UNSEQUENCED).map_err(table_err)?;
            for (position, leaf) in &ordered {
                let key = keys::leaf_data_key(self.tree_id, &leaf.leaf_identity_hash);
                let exists = leaf_table.get(key.as_slice()).map_err(storage_err)?.is_some();
                if exists {
                    duplicates.insert(*position, leaf.leaf_identity_hash);
                    continue;
                }
                let record = LeafDataRecord {
                    leaf_value: leaf.leaf_value.clone(),
                    extra_data: leaf.extra_data.clone(),
                    queue_timestamp_nanos,
                };
                let encoded = postcard::to_allocvec(&record).map_err(codec_err)?;
                leaf_table
                    .insert(key.as_slice(), encoded.as_slice())
                    .map_err(storage_err)?;

                let queue_key = keys::unsequenced_key(
                    self.tree_id,
                    DEFAULT_BUCKET,
                    queue_timestamp_nanos,
                    &leaf.leaf_identity_hash,
                );
                queue
                    .insert(queue_key.as_slice(), &leaf.merkle_leaf_hash[..])
                    .map_err(storage_err)?;
            }
        }

        // Re-read the canonical rows for duplicate positions. The lookup
        // list is deduplicated because the input batch may repeat a hash.
        let mut canonical: HashMap<Hash, LogLeaf> = HashMap::new();
        if !duplicates.is_empty() {
            let leaf_table = self.txn.open_table(Tables::LEAF_DATA).map_err(table_err)?;
            for hash in duplicates.values() {
                if canonical.contains_key(hash) {
                    continue;
                }
                let record = read_leaf_data(&leaf_table, self.tree_id, hash)?.ok_or_else(
                    || {
                        IntegritySnafu {
                            message: format!(
                                "existing leaf {hash:02x?} vanished within transaction"
                            ),
                        }
                        .build()
                    },
                )?;
                canonical.insert(*hash, unsequenced_leaf(*hash, record));
            }
        }

        debug!(
            tree_id = self.tree_id.value(),
            queued = leaves.len() - duplicates.len(),
            duplicates = duplicates.len(),
            "queued leaves"
        );

        let mut results = Vec::with_capacity(leaves.len());
        for (position, leaf) in leaves.iter().enumerate() {
            match duplicates.get(&position) {
                Some(hash) => {
                    let canonical_leaf = canonical.get(hash).cloned().ok_or_else(|| {
                        IntegritySnafu {
                            message: format!("no canonical row fetched for {hash:02x?}"),
                        }
                        .build()
                    })?;
                    results.push(QueuedLogLeaf {
                        leaf: canonical_leaf,
                        status: QueueStatus::AlreadyExists,
                    });
                }
                None => {
                    let mut queued = leaf.clone();
                    queued.queue_timestamp_nanos = queue_timestamp_nanos;
                    results.push(QueuedLogLeaf { leaf: queued, status: QueueStatus::Queued });
                }
            }
        }
        Ok(results)
    }

    /// Removes and returns up to `limit` queued leaves whose queue
    /// timestamp is at or before the cutoff, in (bucket, queue time,
    /// identity hash) order.
    ///
    /// For pre-ordered trees the queue is the sequence store itself:
    /// dequeuing scans forward from the current tree size.
    pub fn dequeue_leaves(&mut self, limit: usize, cutoff_nanos: i64) -> Result<Vec<LogLeaf>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        if self.tree_type == TreeType::PreorderedLog {
            let start = self.root.tree_size as i64;
            let count = i64::try_from(limit).unwrap_or(i64::MAX);
            return self.leaves_by_range_inner(start, count);
        }

        let mut picked: Vec<(UnsequencedKey, Hash)> = Vec::new();
        {
            let queue = self.txn.open_table(Tables::UNSEQUENCED).map_err(table_err)?;
            let prefix = keys::tree_prefix(self.tree_id);
            let upper = keys::prefix_upper_bound(&prefix);
            let start = Bound::Included(&prefix[..]);
            let end = match upper.as_deref() {
                Some(end) => Bound::Excluded(end),
                None => Bound::Unbounded,
            };
            for entry in queue
                .range::<&[u8]>((start, end))
                .map_err(storage_err)?
            {
                let (key, value) = entry.map_err(storage_err)?;
                let decoded = keys::decode_unsequenced_key(key.value()).ok_or_else(|| {
                    IntegritySnafu { message: "malformed unsequenced key" }.build()
                })?;
                if decoded.queue_timestamp_nanos > cutoff_nanos {
                    // Later buckets may still hold older entries; skip
                    // rather than stop.
                    continue;
                }
                if self.dequeued.contains_key(&decoded.leaf_identity_hash) {
                    continue;
                }
                let merkle: Hash = value.value().try_into().map_err(|_| {
                    IntegritySnafu { message: "malformed unsequenced value" }.build()
                })?;
                picked.push((decoded, merkle));
                if picked.len() == limit {
                    break;
                }
            }
        }

        // Selection and removal stay inside this one transaction.
        {
            let mut queue = self.txn.open_table(Tables::UNSEQUENCED).map_err(table_err)?;
            for (decoded, _) in &picked {
                let key = keys::unsequenced_key(
                    self.tree_id,
                    decoded.bucket,
                    decoded.queue_timestamp_nanos,
                    &decoded.leaf_identity_hash,
                );
                queue.remove(key.as_slice()).map_err(storage_err)?;
            }
        }

        let mut leaves = Vec::with_capacity(picked.len());
        {
            let leaf_table = self.txn.open_table(Tables::LEAF_DATA).map_err(table_err)?;
            for (decoded, merkle) in &picked {
                let record =
                    read_leaf_data(&leaf_table, self.tree_id, &decoded.leaf_identity_hash)?
                        .ok_or_else(|| {
                            IntegritySnafu {
                                message: format!(
                                    "queued leaf {:02x?} has no leaf data",
                                    decoded.leaf_identity_hash
                                ),
                            }
                            .build()
                        })?;
                let mut leaf = unsequenced_leaf(decoded.leaf_identity_hash, record);
                leaf.merkle_leaf_hash = *merkle;
                leaves.push(leaf);
                self.dequeued.insert(decoded.leaf_identity_hash, decoded.clone());
            }
        }
        debug!(tree_id = self.tree_id.value(), count = leaves.len(), "dequeued leaves");
        Ok(leaves)
    }

    /// Records the sequence numbers a sequencer assigned to dequeued
    /// leaves. Conflicts here are fatal: they mean two sequencers ran, or
    /// one assigned a number twice.
    pub fn update_sequenced_leaves(&mut self, leaves: &[LogLeaf]) -> Result<()> {
        let mut sequenced = self.txn.open_table(Tables::SEQUENCED_LEAF).map_err(table_err)?;
        let mut by_identity =
            self.txn.open_table(Tables::SEQ_BY_IDENTITY).map_err(table_err)?;
        let mut by_merkle = self.txn.open_table(Tables::SEQ_BY_MERKLE).map_err(table_err)?;
        for leaf in leaves {
            if leaf.leaf_index < 0 {
                return InvalidArgumentSnafu {
                    message: format!("leaf has unassigned index {}", leaf.leaf_index),
                }
                .fail();
            }
            let sequence_number = leaf.leaf_index as u64;
            let seq_key = keys::sequenced_leaf_key(self.tree_id, sequence_number);
            if sequenced.get(seq_key.as_slice()).map_err(storage_err)?.is_some() {
                return IntegritySnafu {
                    message: format!("sequence number {sequence_number} already assigned"),
                }
                .fail();
            }
            let identity_key = keys::leaf_data_key(self.tree_id, &leaf.leaf_identity_hash);
            if by_identity.get(identity_key.as_slice()).map_err(storage_err)?.is_some() {
                return IntegritySnafu {
                    message: format!(
                        "leaf {:02x?} already sequenced",
                        leaf.leaf_identity_hash
                    ),
                }
                .fail();
            }

            let record = SequencedLeafRecord {
                leaf_identity_hash: leaf.leaf_identity_hash,
                merkle_leaf_hash: leaf.merkle_leaf_hash,
                integrate_timestamp_nanos: leaf.integrate_timestamp_nanos,
            };
            let encoded = postcard::to_allocvec(&record).map_err(codec_err)?;
            sequenced
                .insert(seq_key.as_slice(), encoded.as_slice())
                .map_err(storage_err)?;
            by_identity
                .insert(
                    identity_key.as_slice(),
                    &keys::encode_sequence_number(sequence_number)[..],
                )
                .map_err(storage_err)?;
            let merkle_key = keys::seq_by_merkle_key(
                self.tree_id,
                &leaf.merkle_leaf_hash,
                sequence_number,
            );
            by_merkle
                .insert(merkle_key.as_slice(), &leaf.leaf_identity_hash[..])
                .map_err(storage_err)?;
        }
        Ok(())
    }

    /// Inserts leaves that arrive with indices already assigned
    /// (pre-ordered trees only).
    ///
    /// Each leaf is atomic on its own: a conflicting index or identity
    /// hash marks that slot `FailedPrecondition` and leaves no side
    /// effects, while the rest of the batch proceeds. Conflicts are
    /// detected by point lookups before any insert, so no savepoint is
    /// needed to undo a half-inserted leaf.
    pub fn add_sequenced_leaves(
        &mut self,
        leaves: &[LogLeaf],
        timestamp_nanos: i64,
    ) -> Result<Vec<QueuedLogLeaf>> {
        if self.tree_type != TreeType::PreorderedLog {
            return InvalidArgumentSnafu {
                message: "add_sequenced_leaves requires a PreorderedLog tree",
            }
            .fail();
        }
        self.check_accepts_leaves()?;

        let ordered = sort_by_identity_hash(leaves);
        let mut statuses = vec![QueueStatus::Queued; leaves.len()];
        {
            let mut leaf_table = self.txn.open_table(Tables::LEAF_DATA).map_err(table_err)?;
            let mut sequenced =
                self.txn.open_table(Tables::SEQUENCED_LEAF).map_err(table_err)?;
            let mut by_identity =
                self.txn.open_table(Tables::SEQ_BY_IDENTITY).map_err(table_err)?;
            let mut by_merkle =
                self.txn.open_table(Tables::SEQ_BY_MERKLE).map_err(table_err)?;

            for (position, leaf) in &ordered {
                if leaf.leaf_index < 0 {
                    return InvalidArgumentSnafu {
                        message: format!(
                            "leaves[{position}] has unassigned index {}",
                            leaf.leaf_index
                        ),
                    }
                    .fail();
                }
                let sequence_number = leaf.leaf_index as u64;
                let identity_key =
                    keys::leaf_data_key(self.tree_id, &leaf.leaf_identity_hash);
                let seq_key = keys::sequenced_leaf_key(self.tree_id, sequence_number);

                let identity_taken = leaf_table
                    .get(identity_key.as_slice())
                    .map_err(storage_err)?
                    .is_some()
                    || by_identity
                        .get(identity_key.as_slice())
                        .map_err(storage_err)?
                        .is_some();
                let index_taken =
                    sequenced.get(seq_key.as_slice()).map_err(storage_err)?.is_some();
                if identity_taken || index_taken {
                    statuses[*position] = QueueStatus::FailedPrecondition;
                    continue;
                }

                let data = LeafDataRecord {
                    leaf_value: leaf.leaf_value.clone(),
                    extra_data: leaf.extra_data.clone(),
                    queue_timestamp_nanos: timestamp_nanos,
                };
                let encoded = postcard::to_allocvec(&data).map_err(codec_err)?;
                leaf_table
                    .insert(identity_key.as_slice(), encoded.as_slice())
                    .map_err(storage_err)?;

                let record = SequencedLeafRecord {
                    leaf_identity_hash: leaf.leaf_identity_hash,
                    merkle_leaf_hash: leaf.merkle_leaf_hash,
                    integrate_timestamp_nanos: 0,
                };
                let encoded = postcard::to_allocvec(&record).map_err(codec_err)?;
                sequenced
                    .insert(seq_key.as_slice(), encoded.as_slice())
                    .map_err(storage_err)?;
                by_identity
                    .insert(
                        identity_key.as_slice(),
                        &keys::encode_sequence_number(sequence_number)[..],
                    )
                    .map_err(storage_err)?;
                let merkle_key = keys::seq_by_merkle_key(
                    self.tree_id,
                    &leaf.merkle_leaf_hash,
                    sequence_number,
                );
                by_merkle
                    .insert(merkle_key.as_slice(), &leaf.leaf_identity_hash[..])
                    .map_err(storage_err)?;
            }
        }

        Ok(leaves
            .iter()
            .zip(statuses)
            .map(|(leaf, status)| {
                let mut result = leaf.clone();
                result.queue_timestamp_nanos = timestamp_nanos;
                QueuedLogLeaf { leaf: result, status }
            })
            .collect())
    }

    /// Returns sequenced leaves `[start, start + count)`, verifying the
    /// range is densely numbered.
    pub fn get_leaves_by_range(&self, start: i64, count: i64) -> Result<Vec<LogLeaf>> {
        self.leaves_by_range_inner(start, count)
    }

    fn leaves_by_range_inner(&self, start: i64, count: i64) -> Result<Vec<LogLeaf>> {
        let leaf_table = self.txn.open_table(Tables::LEAF_DATA).map_err(table_err)?;
        let sequenced = self.txn.open_table(Tables::SEQUENCED_LEAF).map_err(table_err)?;
        leaves_by_range(
            &leaf_table,
            &sequenced,
            self.tree_id,
            self.tree_type,
            self.root.tree_size,
            start,
            count,
        )
    }

    /// Fetches all sequenced leaves carrying any of the given Merkle leaf
    /// hashes. One hash may match several leaves.
    pub fn get_leaves_by_hash(
        &self,
        merkle_hashes: &[Hash],
        order_by_sequence: bool,
    ) -> Result<Vec<LogLeaf>> {
        let leaf_table = self.txn.open_table(Tables::LEAF_DATA).map_err(table_err)?;
        let sequenced = self.txn.open_table(Tables::SEQUENCED_LEAF).map_err(table_err)?;
        let by_merkle = self.txn.open_table(Tables::SEQ_BY_MERKLE).map_err(table_err)?;
        leaves_by_hash(
            &leaf_table,
            &sequenced,
            &by_merkle,
            self.tree_id,
            merkle_hashes,
            order_by_sequence,
        )
    }

    /// Resolves Merkle nodes at the pinned read revision through the
    /// subtree cache.
    pub fn get_merkle_nodes(&mut self, ids: &[NodeId]) -> Result<Vec<Hash>> {
        let table = self.txn.open_table(Tables::SUBTREES).map_err(table_err)?;
        self.cache.get_nodes(ids, &table)
    }

    /// Stages Merkle node writes; dirty tiles are persisted at commit at
    /// the write revision.
    pub fn set_merkle_nodes(&mut self, updates: &[(NodeId, Hash)]) -> Result<()> {
        let table = self.txn.open_table(Tables::SUBTREES).map_err(table_err)?;
        self.cache.set_nodes(updates, &table)
    }

    /// The tree head this transaction is pinned to.
    pub fn latest_signed_log_root(&self) -> Result<LogRoot> {
        if self.needs_init {
            return TreeNeedsInitSnafu { tree_id: self.tree_id }.fail();
        }
        Ok(self.root.clone())
    }

    /// Appends a new tree head at the write revision.
    ///
    /// The root must not shrink the tree, must advance the timestamp, and
    /// must carry the transaction's write revision. Storing a root
    /// identical to an already-stored one is a no-op.
    pub fn store_signed_log_root(&mut self, root: &LogRoot) -> Result<()> {
        if !root.metadata.is_empty() {
            return InvalidArgumentSnafu {
                message: "log root metadata is not supported by this storage",
            }
            .fail();
        }
        if root.revision != self.write_revision {
            return InvalidArgumentSnafu {
                message: format!(
                    "root revision {} does not match write revision {}",
                    root.revision, self.write_revision
                ),
            }
            .fail();
        }
        if !self.needs_init {
            if root.tree_size < self.root.tree_size {
                return IntegritySnafu {
                    message: format!(
                        "tree size regression: {} -> {}",
                        self.root.tree_size, root.tree_size
                    ),
                }
                .fail();
            }
            if root.timestamp_nanos <= self.root.timestamp_nanos {
                return IntegritySnafu {
                    message: format!(
                        "root timestamp must increase: {} -> {}",
                        self.root.timestamp_nanos, root.timestamp_nanos
                    ),
                }
                .fail();
            }
        }

        let mut heads = self.txn.open_table(Tables::TREE_HEADS).map_err(table_err)?;
        let key = keys::tree_head_key(self.tree_id, root.revision);
        if let Some(existing) = heads.get(key.as_slice()).map_err(storage_err)? {
            let stored: LogRoot =
                postcard::from_bytes(existing.value()).map_err(codec_err)?;
            if &stored == root {
                return Ok(());
            }
            return IntegritySnafu {
                message: format!(
                    "conflicting root already stored at revision {}",
                    root.revision
                ),
            }
            .fail();
        }
        let encoded = postcard::to_allocvec(root).map_err(codec_err)?;
        heads.insert(key.as_slice(), encoded.as_slice()).map_err(storage_err)?;
        Ok(())
    }

    /// Flushes dirty subtree tiles at the write revision, then commits the
    /// backend transaction. Dropping the value instead rolls back.
    pub fn commit(mut self) -> Result<()> {
        {
            let mut table = self.txn.open_table(Tables::SUBTREES).map_err(table_err)?;
            let tiles = self.cache.flush(self.write_revision, self.revisioned, &mut table)?;
            if tiles > 0 {
                debug!(
                    tree_id = self.tree_id.value(),
                    revision = self.write_revision,
                    tiles,
                    "flushed subtree tiles"
                );
            }
        }
        self.txn.commit().map_err(commit_err)
    }

    fn check_accepts_leaves(&self) -> Result<()> {
        if self.tree_state != TreeState::Active {
            return FailedPreconditionSnafu {
                message: format!(
                    "{} does not accept new leaves in state {:?}",
                    self.tree_id, self.tree_state
                ),
            }
            .fail();
        }
        Ok(())
    }
}

/// A read-only view of a log pinned to its latest tree head.
pub struct LogSnapshot {
    txn: ReadTransaction,
    tree_id: TreeId,
    tree_type: TreeType,
    needs_init: bool,
    cache: SubtreeCache,
    root: LogRoot,
}

impl LogSnapshot {
    /// The tree head this snapshot is pinned to.
    pub fn latest_signed_log_root(&self) -> Result<LogRoot> {
        if self.needs_init {
            return TreeNeedsInitSnafu { tree_id: self.tree_id }.fail();
        }
        Ok(self.root.clone())
    }

    /// See [`LogTransaction::get_leaves_by_range`].
    pub fn get_leaves_by_range(&self, start: i64, count: i64) -> Result<Vec<LogLeaf>> {
        let leaf_table = self.txn.open_table(Tables::LEAF_DATA).map_err(table_err)?;
        let sequenced = self.txn.open_table(Tables::SEQUENCED_LEAF).map_err(table_err)?;
        leaves_by_range(
            &leaf_table,
            &sequenced,
            self.tree_id,
            self.tree_type,
            self.root.tree_size,
            start,
            count,
        )
    }

    /// See [`LogTransaction::get_leaves_by_hash`].
    pub fn get_leaves_by_hash(
        &self,
        merkle_hashes: &[Hash],
        order_by_sequence: bool,
    ) -> Result<Vec<LogLeaf>> {
        let leaf_table = self.txn.open_table(Tables::LEAF_DATA).map_err(table_err)?;
        let sequenced = self.txn.open_table(Tables::SEQUENCED_LEAF).map_err(table_err)?;
        let by_merkle = self.txn.open_table(Tables::SEQ_BY_MERKLE).map_err(table_err)?;
        leaves_by_hash(
            &leaf_table,
            &sequenced,
            &by_merkle,
            self.tree_id,
            merkle_hashes,
            order_by_sequence,
        )
    }

    /// Resolves Merkle nodes at the snapshot's read revision.
    pub fn get_merkle_nodes(&mut self, ids: &[NodeId]) -> Result<Vec<Hash>> {
        let table = self.txn.open_table(Tables::SUBTREES).map_err(table_err)?;
        self.cache.get_nodes(ids, &table)
    }
}

/// Pairs each leaf with its input position and sorts by identity hash.
///
/// The sort is a correctness requirement, not an optimization: it gives
/// concurrent writers one total order over row-lock acquisition.
fn sort_by_identity_hash(leaves: &[LogLeaf]) -> Vec<(usize, &LogLeaf)> {
    let mut ordered: Vec<(usize, &LogLeaf)> = leaves.iter().enumerate().collect();
    ordered.sort_by(|(_, a), (_, b)| a.leaf_identity_hash.cmp(&b.leaf_identity_hash));
    ordered
}

fn empty_root() -> LogRoot {
    LogRoot {
        tree_size: 0,
        root_hash: EMPTY_ROOT_HASH,
        timestamp_nanos: 0,
        revision: 0,
        metadata: Vec::new(),
        signature: Vec::new(),
    }
}

/// A leaf rebuilt from its stored payload, not yet tied to a sequence
/// entry. The Merkle hash is recomputed from the stored value.
fn unsequenced_leaf(leaf_identity_hash: Hash, record: LeafDataRecord) -> LogLeaf {
    LogLeaf {
        merkle_leaf_hash: leaf_hash(&record.leaf_value),
        leaf_identity_hash,
        leaf_value: record.leaf_value,
        extra_data: record.extra_data,
        leaf_index: LEAF_INDEX_UNSEQUENCED,
        queue_timestamp_nanos: record.queue_timestamp_nanos,
        integrate_timestamp_nanos: 0,
    }
}

fn read_leaf_data(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    tree_id: TreeId,
    leaf_identity_hash: &Hash,
) -> Result<Option<LeafDataRecord>> {
    let key = keys::leaf_data_key(tree_id, leaf_identity_hash);
    match table.get(key.as_slice()).map_err(storage_err)? {
        Some(value) => Ok(Some(postcard::from_bytes(value.value()).map_err(codec_err)?)),
        None => Ok(None),
    }
}

/// The latest stored head for a tree, if any.
fn latest_root(
    heads: &impl ReadableTable<&'static [u8], &'static [u8]>,
    tree_id: TreeId,
) -> Result<Option<LogRoot>> {
    let start = keys::tree_head_key(tree_id, 0);
    let end = keys::tree_head_key(tree_id, u64::MAX);
    let mut range = heads
        .range(start.as_slice()..=end.as_slice())
        .map_err(storage_err)?;
    match range.next_back() {
        Some(entry) => {
            let (_, value) = entry.map_err(storage_err)?;
            Ok(Some(postcard::from_bytes(value.value()).map_err(codec_err)?))
        }
        None => Ok(None),
    }
}

fn leaves_by_range(
    leaf_table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    sequenced: &impl ReadableTable<&'static [u8], &'static [u8]>,
    tree_id: TreeId,
    tree_type: TreeType,
    tree_size: u64,
    start: i64,
    count: i64,
) -> Result<Vec<LogLeaf>> {
    if count <= 0 {
        return InvalidArgumentSnafu { message: format!("invalid count {count}, want > 0") }
            .fail();
    }
    if start < 0 {
        return InvalidArgumentSnafu { message: format!("invalid start {start}, want >= 0") }
            .fail();
    }
    let start = start as u64;
    let mut count = count as u64;
    if tree_type == TreeType::Log {
        if tree_size == 0 {
            return InvalidArgumentSnafu { message: "empty tree" }.fail();
        }
        if start >= tree_size {
            return InvalidArgumentSnafu {
                message: format!("invalid start {start}, want < tree size {tree_size}"),
            }
            .fail();
        }
        count = count.min(tree_size - start);
    }
    let end = start.saturating_add(count);

    let start_key = keys::sequenced_leaf_key(tree_id, start);
    let end_key = keys::sequenced_leaf_key(tree_id, end);
    let mut leaves = Vec::new();
    let mut want_index = start;
    for entry in sequenced
        .range(start_key.as_slice()..end_key.as_slice())
        .map_err(storage_err)?
    {
        let (key, value) = entry.map_err(storage_err)?;
        let sequence_number = decode_sequence_key(key.value())?;
        if sequence_number != want_index {
            // A gap below the committed tree size is an integrity
            // failure; beyond it (pre-ordered scans) the range just ends.
            if want_index < tree_size {
                return IntegritySnafu {
                    message: format!(
                        "got unexpected index {sequence_number}, want {want_index}"
                    ),
                }
                .fail();
            }
            break;
        }
        let record: SequencedLeafRecord =
            postcard::from_bytes(value.value()).map_err(codec_err)?;
        let data = read_leaf_data(leaf_table, tree_id, &record.leaf_identity_hash)?
            .ok_or_else(|| {
                IntegritySnafu {
                    message: format!(
                        "sequenced leaf {sequence_number} has no leaf data"
                    ),
                }
                .build()
            })?;
        leaves.push(LogLeaf {
            merkle_leaf_hash: record.merkle_leaf_hash,
            leaf_identity_hash: record.leaf_identity_hash,
            leaf_value: data.leaf_value,
            extra_data: data.extra_data,
            leaf_index: sequence_number as i64,
            queue_timestamp_nanos: data.queue_timestamp_nanos,
            integrate_timestamp_nanos: record.integrate_timestamp_nanos,
        });
        want_index += 1;
    }
    // Dense-range check: a Log tree must serve the whole clipped range.
    if tree_type == TreeType::Log && want_index < end {
        return IntegritySnafu {
            message: format!(
                "sequence range ended at {want_index}, want {end} (tree size {tree_size})"
            ),
        }
        .fail();
    }
    Ok(leaves)
}

fn leaves_by_hash(
    leaf_table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    sequenced: &impl ReadableTable<&'static [u8], &'static [u8]>,
    by_merkle: &impl ReadableTable<&'static [u8], &'static [u8]>,
    tree_id: TreeId,
    merkle_hashes: &[Hash],
    order_by_sequence: bool,
) -> Result<Vec<LogLeaf>> {
    let mut leaves = Vec::new();
    for hash in merkle_hashes {
        let prefix = keys::seq_by_merkle_prefix(tree_id, hash);
        let upper = keys::prefix_upper_bound(&prefix).ok_or_else(|| {
            IntegritySnafu { message: "merkle index prefix overflow" }.build()
        })?;
        for entry in by_merkle
            .range(&prefix[..]..upper.as_slice())
            .map_err(storage_err)?
        {
            let (key, _) = entry.map_err(storage_err)?;
            let sequence_number = u64::from_be_bytes(
                key.value()[40..48].try_into().map_err(|_| {
                    IntegritySnafu { message: "malformed merkle index key" }.build()
                })?,
            );
            let seq_key = keys::sequenced_leaf_key(tree_id, sequence_number);
            let record: SequencedLeafRecord = match sequenced
                .get(seq_key.as_slice())
                .map_err(storage_err)?
            {
                Some(value) => postcard::from_bytes(value.value()).map_err(codec_err)?,
                None => {
                    return IntegritySnafu {
                        message: format!(
                            "merkle index points at missing sequence entry {sequence_number}"
                        ),
                    }
                    .fail()
                }
            };
            let data = read_leaf_data(leaf_table, tree_id, &record.leaf_identity_hash)?
                .ok_or_else(|| {
                    IntegritySnafu {
                        message: format!(
                            "sequenced leaf {sequence_number} has no leaf data"
                        ),
                    }
                    .build()
                })?;
            leaves.push(LogLeaf {
                merkle_leaf_hash: record.merkle_leaf_hash,
                leaf_identity_hash: record.leaf_identity_hash,
                leaf_value: data.leaf_value,
                extra_data: data.extra_data,
                leaf_index: sequence_number as i64,
                queue_timestamp_nanos: data.queue_timestamp_nanos,
                integrate_timestamp_nanos: record.integrate_timestamp_nanos,
            });
        }
    }
    if order_by_sequence {
        leaves.sort_by_key(|leaf| leaf.leaf_index);
    }
    Ok(leaves)
}

fn decode_sequence_key(key: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = key
        .get(8..16)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| IntegritySnafu { message: "malformed sequence key" }.build())?;
    Ok(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_by_identity_hash_remembers_positions() {
        let mut a = LogLeaf::new(b"a".to_vec(), Vec::new());
        let mut b = LogLeaf::new(b"b".to_vec(), Vec::new());
        a.leaf_identity_hash = [0xff; 32];
        b.leaf_identity_hash = [0x01; 32];
        let leaves = vec![a.clone(), b.clone()];
        let ordered = sort_by_identity_hash(&leaves);
        assert_eq!(ordered[0].0, 1);
        assert_eq!(ordered[1].0, 0);
        assert_eq!(ordered[0].1.leaf_identity_hash, b.leaf_identity_hash);
    }

    #[test]
    fn test_empty_root_shape() {
        let root = empty_root();
        assert_eq!(root.tree_size, 0);
        assert_eq!(root.revision, 0);
        assert_eq!(root.root_hash, EMPTY_ROOT_HASH);
    }
}
