//! Subtree tiles: the persisted unit of Merkle node storage.
//!
//! The tree is cut into strata of 8 levels. A tile holds the 256 node
//! hashes of one stratum's bottom row; interior hashes are recomputed on
//! load rather than persisted. The root of a tile is not stored with it -
//! it is the bottom-row hash of the tile one stratum up.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use canopy_types::{node_hash, Hash, NodeId};

/// Number of tree levels per stratum.
pub(crate) const STRATUM_HEIGHT: u8 = 8;

/// Identifies a tile: `stratum` counts strata from the leaves, `index`
/// counts tiles left to right within the stratum.
///
/// Tile `(s, i)` holds bottom-row nodes `(8s, i*256) .. (8s, (i+1)*256)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct TileId {
    pub stratum: u8,
    pub index: u64,
}

impl TileId {
    /// The tile containing the given node, along with the node's local
    /// coordinates `(depth above the tile bottom row, local index)`.
    pub fn for_node(id: NodeId) -> (Self, u8, u8) {
        let stratum = id.level / STRATUM_HEIGHT;
        let depth = id.level % STRATUM_HEIGHT;
        let width_bits = STRATUM_HEIGHT - depth;
        let tile = Self { stratum, index: id.index >> width_bits };
        let local = (id.index & ((1u64 << width_bits) - 1)) as u8;
        (tile, depth, local)
    }

    /// Storage prefix for this tile: {stratum:1}{index:8BE}.
    pub fn prefix(&self) -> [u8; 9] {
        let mut prefix = [0u8; 9];
        prefix[0] = self.stratum;
        prefix[1..].copy_from_slice(&self.index.to_be_bytes());
        prefix
    }
}

/// Persisted form of a tile: only the bottom-row hashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SubtreeRecord {
    /// Bottom-row slot (0-255) to node hash.
    pub leaves: BTreeMap<u8, Hash>,
}

/// An in-memory tile with its recomputed interior.
#[derive(Debug, Clone, Default)]
pub(crate) struct Subtree {
    /// Bottom-row slot to node hash; the only persisted content.
    leaves: BTreeMap<u8, Hash>,
    /// `(depth, local index)` to hash, depths 1..8. Rebuilt by
    /// [`Self::populate`] and extended by in-transaction writes.
    internal: HashMap<(u8, u8), Hash>,
}

impl Subtree {
    /// Rebuilds a tile from its stored record, recomputing the interior.
    pub fn from_record(record: SubtreeRecord) -> Self {
        let mut subtree = Self { leaves: record.leaves, internal: HashMap::new() };
        subtree.populate();
        subtree
    }

    /// The persistable form of the tile.
    pub fn to_record(&self) -> SubtreeRecord {
        SubtreeRecord { leaves: self.leaves.clone() }
    }

    /// Recomputes every interior node whose two children are present.
    ///
    /// A populated interior node always has both children: the engine only
    /// ever stores roots of perfect subtrees, so an incomplete pair means
    /// the parent is not yet defined.
    pub fn populate(&mut self) {
        self.internal.clear();
        for depth in 1..STRATUM_HEIGHT {
            let width = 1u16 << (STRATUM_HEIGHT - depth);
            for local in 0..width as u8 {
                let left = self.node(depth - 1, 2 * local);
                let right = self.node(depth - 1, 2 * local + 1);
                if let (Some(left), Some(right)) = (left, right) {
                    self.internal.insert((depth, local), node_hash(&left, &right));
                }
            }
        }
    }

    /// Reads a node at `(depth, local)`; depth 0 is the bottom row.
    pub fn node(&self, depth: u8, local: u8) -> Option<Hash> {
        if depth == 0 {
            self.leaves.get(&local).copied()
        } else {
            self.internal.get(&(depth, local)).copied()
        }
    }

    /// Writes a node at `(depth, local)`.
    ///
    /// Returns true when the persisted content changed (bottom-row writes
    /// only); interior writes are cached for reads within the transaction
    /// and recomputed on the next load.
    pub fn set_node(&mut self, depth: u8, local: u8, hash: Hash) -> bool {
        if depth == 0 {
            self.leaves.insert(local, hash) != Some(hash)
        } else {
            self.internal.insert((depth, local), hash);
            false
        }
    }

    /// Whether the tile stores no bottom-row hashes.
    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_types::leaf_hash;

    #[test]
    fn test_tile_for_leaf_row_nodes() {
        let (tile, depth, local) = TileId::for_node(NodeId::new(0, 0));
        assert_eq!(tile, TileId { stratum: 0, index: 0 });
        assert_eq!((depth, local), (0, 0));

        let (tile, depth, local) = TileId::for_node(NodeId::new(0, 300));
        assert_eq!(tile, TileId { stratum: 0, index: 1 });
        assert_eq!((depth, local), (0, 44));
    }

    #[test]
    fn test_tile_for_interior_nodes() {
        // Node (3, 5) covers bottom-row nodes 40..48, all inside tile 0.
        let (tile, depth, local) = TileId::for_node(NodeId::new(3, 5));
        assert_eq!(tile, TileId { stratum: 0, index: 0 });
        assert_eq!((depth, local), (3, 5));

        // Node (9, 3) lives one stratum up.
        let (tile, depth, local) = TileId::for_node(NodeId::new(9, 3));
        assert_eq!(tile, TileId { stratum: 1, index: 0 });
        assert_eq!((depth, local), (1, 3));
    }

    #[test]
    fn test_stratum_boundary_node_is_bottom_row_of_next_tile() {
        // Level 8 is the bottom row of stratum 1, not the top of stratum 0.
        let (tile, depth, local) = TileId::for_node(NodeId::new(8, 257));
        assert_eq!(tile, TileId { stratum: 1, index: 1 });
        assert_eq!((depth, local), (0, 1));
    }

    #[test]
    fn test_prefix_distinct_per_tile() {
        let a = TileId { stratum: 0, index: 1 }.prefix();
        let b = TileId { stratum: 1, index: 0 }.prefix();
        let c = TileId { stratum: 0, index: 256 }.prefix();
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn test_populate_recomputes_interior() {
        let mut subtree = Subtree::default();
        let hashes: Vec<Hash> = (0..4u8).map(|i| leaf_hash(&[i])).collect();
        for (i, hash) in hashes.iter().enumerate() {
            subtree.set_node(0, i as u8, *hash);
        }
        subtree.populate();

        let n10 = node_hash(&hashes[0], &hashes[1]);
        let n11 = node_hash(&hashes[2], &hashes[3]);
        assert_eq!(subtree.node(1, 0), Some(n10));
        assert_eq!(subtree.node(1, 1), Some(n11));
        assert_eq!(subtree.node(2, 0), Some(node_hash(&n10, &n11)));
        // No parent over an incomplete pair.
        assert_eq!(subtree.node(1, 2), None);
        assert_eq!(subtree.node(3, 0), None);
    }

    #[test]
    fn test_record_roundtrip_drops_interior() {
        let mut subtree = Subtree::default();
        for i in 0..6u8 {
            subtree.set_node(0, i, leaf_hash(&[i]));
        }
        subtree.populate();

        let record = subtree.to_record();
        assert_eq!(record.leaves.len(), 6);

        let reloaded = Subtree::from_record(record);
        for depth in 0..STRATUM_HEIGHT {
            for local in 0..64u8 {
                assert_eq!(reloaded.node(depth, local), subtree.node(depth, local));
            }
        }
    }
}
