//! Tree administration: creation, metadata updates, and the
//! soft/hard-delete lifecycle.

use std::ops::Bound;

use rand::Rng;
use redb::{ReadableTable, TableDefinition, TableHandle, WriteTransaction};
use serde::{Deserialize, Serialize};
use tracing::debug;

use canopy_types::error::{
    FailedPreconditionSnafu, InvalidArgumentSnafu, TreeNotFoundSnafu,
};
use canopy_types::{Result, StorageOptions, Tree, TreeId, TreeState, TreeType};

use crate::engine::StorageEngine;
use crate::errors::{codec_err, commit_err, storage_err, table_err, txn_err};
use crate::keys;
use crate::tables::Tables;

/// Default sequencer cadence recorded for new trees.
const DEFAULT_SEQUENCE_INTERVAL_SECONDS: i64 = 60;

/// Per-tree sequencer control row, created alongside the tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct TreeControlRecord {
    pub signing_enabled: bool,
    pub sequencing_enabled: bool,
    pub sequence_interval_seconds: i64,
}

impl Default for TreeControlRecord {
    fn default() -> Self {
        Self {
            signing_enabled: true,
            sequencing_enabled: true,
            sequence_interval_seconds: DEFAULT_SEQUENCE_INTERVAL_SECONDS,
        }
    }
}

/// Admin store over tree metadata.
#[derive(Clone)]
pub struct AdminStorage {
    engine: StorageEngine,
}

impl AdminStorage {
    /// Creates an admin store sharing the given engine.
    pub fn new(engine: StorageEngine) -> Self {
        Self { engine }
    }

    /// Validates and persists a new tree, assigning a fresh id and
    /// creation timestamps truncated to whole milliseconds.
    pub fn create_tree(&self, tree: &Tree) -> Result<Tree> {
        validate_tree_for_creation(tree)?;

        let txn = self.engine.db().begin_write().map_err(txn_err)?;
        let created = {
            let mut trees = txn.open_table(Tables::TREES).map_err(table_err)?;

            let mut created = tree.clone();
            created.id = new_tree_id(&trees)?;
            let now_millis = chrono::Utc::now().timestamp_millis();
            created.create_time_millis = now_millis;
            created.update_time_millis = now_millis;
            // Always persist options for new trees so readers can tell
            // "written with defaults" from "predates the setting".
            if created.storage_options.is_none() {
                created.storage_options = Some(StorageOptions::default());
            }

            let record = postcard::to_allocvec(&created).map_err(codec_err)?;
            trees
                .insert(keys::tree_key(created.id).as_slice(), record.as_slice())
                .map_err(storage_err)?;

            let mut control = txn.open_table(Tables::TREE_CONTROL).map_err(table_err)?;
            let control_record =
                postcard::to_allocvec(&TreeControlRecord::default()).map_err(codec_err)?;
            control
                .insert(keys::tree_key(created.id).as_slice(), control_record.as_slice())
                .map_err(storage_err)?;
            created
        };
        txn.commit().map_err(commit_err)?;
        Ok(created)
    }

    /// Fetches a tree by id. Soft-deleted trees are returned with their
    /// tombstone set.
    pub fn get_tree(&self, tree_id: TreeId) -> Result<Tree> {
        let txn = self.engine.db().begin_read().map_err(txn_err)?;
        let trees = txn.open_table(Tables::TREES).map_err(table_err)?;
        read_tree(&trees, tree_id)?.ok_or_else(|| TreeNotFoundSnafu { tree_id }.build())
    }

    /// Lists all trees, optionally including soft-deleted ones.
    pub fn list_trees(&self, include_deleted: bool) -> Result<Vec<Tree>> {
        let txn = self.engine.db().begin_read().map_err(txn_err)?;
        let trees = txn.open_table(Tables::TREES).map_err(table_err)?;
        let mut result = Vec::new();
        for entry in trees.iter().map_err(storage_err)? {
            let (_, value) = entry.map_err(storage_err)?;
            let tree: Tree = postcard::from_bytes(value.value()).map_err(codec_err)?;
            if include_deleted || !tree.deleted {
                result.push(tree);
            }
        }
        Ok(result)
    }

    /// Loads a tree, applies the caller's mutator, validates the
    /// transition, and rewrites the record with a fresh update time.
    pub fn update_tree(
        &self,
        tree_id: TreeId,
        mutator: impl FnOnce(&mut Tree),
    ) -> Result<Tree> {
        let txn = self.engine.db().begin_write().map_err(txn_err)?;
        let updated = {
            let mut trees = txn.open_table(Tables::TREES).map_err(table_err)?;
            let before = read_tree(&trees, tree_id)?
                .ok_or_else(|| TreeNotFoundSnafu { tree_id }.build())?;
            if before.deleted {
                return FailedPreconditionSnafu {
                    message: format!("{tree_id} is soft deleted"),
                }
                .fail();
            }

            let mut updated = before.clone();
            mutator(&mut updated);
            validate_tree_for_update(&before, &updated)?;
            updated.update_time_millis = chrono::Utc::now().timestamp_millis();

            let record = postcard::to_allocvec(&updated).map_err(codec_err)?;
            trees
                .insert(keys::tree_key(tree_id).as_slice(), record.as_slice())
                .map_err(storage_err)?;
            updated
        };
        txn.commit().map_err(commit_err)?;
        Ok(updated)
    }

    /// Sets the soft-deletion tombstone. The tree must not already be
    /// deleted.
    pub fn soft_delete_tree(&self, tree_id: TreeId) -> Result<Tree> {
        self.update_deleted(tree_id, true)
    }

    /// Clears the soft-deletion tombstone. The tree must be soft-deleted.
    pub fn undelete_tree(&self, tree_id: TreeId) -> Result<Tree> {
        self.update_deleted(tree_id, false)
    }

    fn update_deleted(&self, tree_id: TreeId, deleted: bool) -> Result<Tree> {
        let txn = self.engine.db().begin_write().map_err(txn_err)?;
        let updated = {
            let mut trees = txn.open_table(Tables::TREES).map_err(table_err)?;
            let mut tree = validate_deleted_state(&trees, tree_id, !deleted)?;
            tree.deleted = deleted;
            tree.delete_time_millis =
                deleted.then(|| chrono::Utc::now().timestamp_millis());
            let record = postcard::to_allocvec(&tree).map_err(codec_err)?;
            trees
                .insert(keys::tree_key(tree_id).as_slice(), record.as_slice())
                .map_err(storage_err)?;
            tree
        };
        txn.commit().map_err(commit_err)?;
        Ok(updated)
    }

    /// Permanently removes a soft-deleted tree and every row belonging to
    /// it. The cascade is explicit: control and head rows first, then the
    /// leaf, sequence, queue, and subtree ranges.
    pub fn hard_delete_tree(&self, tree_id: TreeId) -> Result<()> {
        let txn = self.engine.db().begin_write().map_err(txn_err)?;
        {
            let mut trees = txn.open_table(Tables::TREES).map_err(table_err)?;
            validate_deleted_state(&trees, tree_id, true)?;
            trees
                .remove(keys::tree_key(tree_id).as_slice())
                .map_err(storage_err)?;
        }
        for def in [
            Tables::TREE_CONTROL,
            Tables::TREE_HEADS,
            Tables::SUBTREES,
            Tables::LEAF_DATA,
            Tables::SEQUENCED_LEAF,
            Tables::SEQ_BY_IDENTITY,
            Tables::SEQ_BY_MERKLE,
            Tables::UNSEQUENCED,
        ] {
            let removed = remove_tree_rows(&txn, def, tree_id)?;
            if removed > 0 {
                debug!(tree_id = tree_id.value(), table = def.name(), rows = removed,
                    "hard delete removed rows");
            }
        }
        txn.commit().map_err(commit_err)
    }
}

/// Decodes the tree row, if present.
pub(crate) fn read_tree(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    tree_id: TreeId,
) -> Result<Option<Tree>> {
    match table.get(keys::tree_key(tree_id).as_slice()).map_err(storage_err)? {
        Some(value) => Ok(Some(postcard::from_bytes(value.value()).map_err(codec_err)?)),
        None => Ok(None),
    }
}

/// Checks the tombstone matches the expected state, returning the tree.
fn validate_deleted_state(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    tree_id: TreeId,
    want_deleted: bool,
) -> Result<Tree> {
    let tree =
        read_tree(table, tree_id)?.ok_or_else(|| TreeNotFoundSnafu { tree_id }.build())?;
    if want_deleted && !tree.deleted {
        return FailedPreconditionSnafu { message: format!("{tree_id} is not soft deleted") }
            .fail();
    }
    if !want_deleted && tree.deleted {
        return FailedPreconditionSnafu {
            message: format!("{tree_id} already soft deleted"),
        }
        .fail();
    }
    Ok(tree)
}

/// Generates a fresh random positive 63-bit id, retrying on collision.
fn new_tree_id(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
) -> Result<TreeId> {
    let mut rng = rand::thread_rng();
    loop {
        let candidate = TreeId::new(rng.gen_range(1..i64::MAX));
        let exists = table
            .get(keys::tree_key(candidate).as_slice())
            .map_err(storage_err)?
            .is_some();
        if !exists {
            return Ok(candidate);
        }
    }
}

fn validate_tree_for_creation(tree: &Tree) -> Result<()> {
    if tree.state != TreeState::Active {
        return InvalidArgumentSnafu {
            message: format!("new trees must be Active, got {:?}", tree.state),
        }
        .fail();
    }
    if tree.deleted || tree.delete_time_millis.is_some() {
        return InvalidArgumentSnafu { message: "new trees must not carry a tombstone" }
            .fail();
    }
    if tree.max_root_duration_millis < 0 {
        return InvalidArgumentSnafu {
            message: format!(
                "max_root_duration_millis must be >= 0, got {}",
                tree.max_root_duration_millis
            ),
        }
        .fail();
    }
    Ok(())
}

fn validate_tree_for_update(before: &Tree, after: &Tree) -> Result<()> {
    if after.id != before.id {
        return InvalidArgumentSnafu { message: "tree id is immutable" }.fail();
    }
    // The only permitted type change is promoting a pre-ordered log to a
    // normal log once its feed has stopped.
    if after.tree_type != before.tree_type
        && !(before.tree_type == TreeType::PreorderedLog
            && after.tree_type == TreeType::Log)
    {
        return InvalidArgumentSnafu {
            message: format!(
                "tree type change {:?} -> {:?} not allowed",
                before.tree_type, after.tree_type
            ),
        }
        .fail();
    }
    if after.create_time_millis != before.create_time_millis {
        return InvalidArgumentSnafu { message: "create time is immutable" }.fail();
    }
    if after.deleted != before.deleted
        || after.delete_time_millis != before.delete_time_millis
    {
        return InvalidArgumentSnafu {
            message: "deletion state changes only via soft_delete_tree/undelete_tree",
        }
        .fail();
    }
    if after.storage_options != before.storage_options {
        return InvalidArgumentSnafu {
            message: "storage options are fixed at creation",
        }
        .fail();
    }
    if after.max_root_duration_millis < 0 {
        return InvalidArgumentSnafu {
            message: format!(
                "max_root_duration_millis must be >= 0, got {}",
                after.max_root_duration_millis
            ),
        }
        .fail();
    }
    Ok(())
}

/// Deletes every row of the table whose key starts with the tree prefix.
fn remove_tree_rows(
    txn: &WriteTransaction,
    def: TableDefinition<'static, &'static [u8], &'static [u8]>,
    tree_id: TreeId,
) -> Result<u64> {
    let mut table = txn.open_table(def).map_err(table_err)?;
    let prefix = keys::tree_prefix(tree_id);
    let upper = keys::prefix_upper_bound(&prefix);
    let doomed: Vec<Vec<u8>> = {
        let start = Bound::Included(&prefix[..]);
        let end = match upper.as_deref() {
            Some(end) => Bound::Excluded(end),
            None => Bound::Unbounded,
        };
        let mut doomed = Vec::new();
        for entry in table
            .range::<&[u8]>((start, end))
            .map_err(storage_err)?
        {
            let (key, _) = entry.map_err(storage_err)?;
            doomed.push(key.value().to_vec());
        }
        doomed
    };
    let removed = doomed.len() as u64;
    for key in doomed {
        table.remove(key.as_slice()).map_err(storage_err)?;
    }
    Ok(removed)
}
