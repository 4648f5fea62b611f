//! Test harness for log storage integration tests.
//!
//! Provides an in-memory engine plus a minimal sequencer loop: dequeue a
//! batch, fold it into a compact range, record the assigned indices, stage
//! the new Merkle nodes, and store the next tree head.

#![allow(dead_code)]

use canopy_storage::{AdminStorage, LogStorage, StorageEngine};
use canopy_types::{
    frontier_node_ids, CompactRange, LogLeaf, LogRoot, Result, Tree, TreeType,
};

pub struct Harness {
    pub engine: StorageEngine,
    pub admin: AdminStorage,
    pub storage: LogStorage,
    clock_nanos: u64,
}

impl Harness {
    pub fn new() -> Self {
        let engine = StorageEngine::in_memory().expect("open in-memory engine");
        Self {
            admin: AdminStorage::new(engine.clone()),
            storage: LogStorage::new(engine.clone()),
            engine,
            clock_nanos: 1_000,
        }
    }

    /// A strictly increasing fake clock.
    pub fn tick(&mut self) -> u64 {
        self.clock_nanos += 1_000;
        self.clock_nanos
    }

    /// Creates a tree and stores its initial (size 0) head.
    pub fn create_initialized_tree(&mut self, tree_type: TreeType) -> Tree {
        let tree = self
            .admin
            .create_tree(&Tree::new(tree_type))
            .expect("create tree");
        let ts = self.tick();
        self.storage
            .read_write_transaction(&tree, |tx| {
                tx.store_signed_log_root(&LogRoot::initial(ts))
            })
            .expect("init tree");
        tree
    }

    /// Runs one sequencer pass: integrates up to `batch` queued leaves and
    /// stores the next head. Returns the new head.
    pub fn integrate(&mut self, tree: &Tree, batch: usize) -> LogRoot {
        let now = self.tick();
        self.storage
            .read_write_transaction(tree, |tx| {
                let prior = tx.latest_signed_log_root()?;
                let frontier = tx.get_merkle_nodes(&frontier_node_ids(prior.tree_size))?;
                let mut range = CompactRange::from_frontier(prior.tree_size, &frontier)?;

                let leaves = tx.dequeue_leaves(batch, i64::MAX)?;
                let mut updates = Vec::new();
                let mut sequenced = Vec::new();
                for (offset, mut leaf) in leaves.into_iter().enumerate() {
                    if tree.tree_type == TreeType::Log {
                        leaf.leaf_index = (prior.tree_size + offset as u64) as i64;
                    }
                    leaf.integrate_timestamp_nanos = now as i64;
                    updates.extend(range.append(leaf.merkle_leaf_hash));
                    sequenced.push(leaf);
                }
                // Pre-ordered leaves are already in the sequence store.
                if tree.tree_type == TreeType::Log {
                    tx.update_sequenced_leaves(&sequenced)?;
                }
                tx.set_merkle_nodes(&updates)?;

                let root = LogRoot {
                    tree_size: range.size(),
                    root_hash: range.root(),
                    timestamp_nanos: now,
                    revision: tx.write_revision(),
                    metadata: Vec::new(),
                    signature: Vec::new(),
                };
                tx.store_signed_log_root(&root)?;
                Ok(root)
            })
            .expect("integrate")
    }

    /// Recomputes the root of the committed tree purely from stored tiles.
    pub fn recompute_root_from_tiles(&self, tree: &Tree) -> Result<LogRoot> {
        let mut snapshot = self.storage.snapshot(tree)?;
        let stored = snapshot.latest_signed_log_root()?;
        let frontier = snapshot.get_merkle_nodes(&frontier_node_ids(stored.tree_size))?;
        let range = CompactRange::from_frontier(stored.tree_size, &frontier)?;
        Ok(LogRoot { root_hash: range.root(), ..stored })
    }
}

/// A deterministic test leaf.
pub fn leaf(n: u64) -> LogLeaf {
    LogLeaf::new(format!("leaf-{n}").into_bytes(), format!("extra-{n}").into_bytes())
}

/// A batch of deterministic test leaves covering `[first, first + num)`.
pub fn leaves(first: u64, num: u64) -> Vec<LogLeaf> {
    (first..first + num).map(leaf).collect()
}
