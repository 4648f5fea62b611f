//! In-transaction subtree cache.
//!
//! Batches Merkle node reads and writes against the tiled node store
//! within one log transaction. Reads go through an in-memory tile map,
//! loading the latest persisted tile at or below the transaction's read
//! revision on miss; writes mark tiles dirty, and commit writes each dirty
//! tile exactly once at the transaction's write revision.

use std::collections::{HashMap, HashSet};

use redb::{ReadableTable, Table};

use canopy_types::error::IntegritySnafu;
use canopy_types::{Hash, NodeId, Result, TreeId};

use crate::errors::{codec_err, storage_err};
use crate::keys;
use crate::subtree::{Subtree, SubtreeRecord, TileId};

/// Revision tiles are written at when per-tree subtree revisions are
/// disabled: the tile is overwritten in place.
const UNREVISIONED: u64 = 0;

/// Write-through cache over the subtree table, scoped to one transaction.
pub(crate) struct SubtreeCache {
    tree_id: TreeId,
    /// Pinned read revision; no tile is ever read from a higher revision.
    read_revision: u64,
    tiles: HashMap<TileId, Subtree>,
    dirty: HashSet<TileId>,
}

impl SubtreeCache {
    pub fn new(tree_id: TreeId, read_revision: u64) -> Self {
        Self { tree_id, read_revision, tiles: HashMap::new(), dirty: HashSet::new() }
    }

    /// Resolves the requested nodes at the read revision.
    ///
    /// Every requested node must exist: the callers ask only for nodes the
    /// sequencer previously wrote, so a miss is an integrity failure.
    pub fn get_nodes(
        &mut self,
        ids: &[NodeId],
        table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    ) -> Result<Vec<Hash>> {
        let mut hashes = Vec::with_capacity(ids.len());
        for id in ids {
            let (tile_id, depth, local) = TileId::for_node(*id);
            let tile = self.tile(tile_id, table)?;
            match tile.node(depth, local) {
                Some(hash) => hashes.push(hash),
                None => {
                    return IntegritySnafu {
                        message: format!(
                            "missing merkle {id} in tree {} at revision {}",
                            self.tree_id.value(),
                            self.read_revision
                        ),
                    }
                    .fail()
                }
            }
        }
        Ok(hashes)
    }

    /// Applies node updates to the cached tiles.
    ///
    /// Bottom-row writes dirty their tile; interior writes only feed later
    /// reads in the same transaction, as the interior is recomputed from
    /// the bottom row on load.
    pub fn set_nodes(
        &mut self,
        updates: &[(NodeId, Hash)],
        table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    ) -> Result<()> {
        for (id, hash) in updates {
            let (tile_id, depth, local) = TileId::for_node(*id);
            let tile = self.tile(tile_id, table)?;
            if tile.set_node(depth, local, *hash) {
                self.dirty.insert(tile_id);
            }
        }
        Ok(())
    }

    /// Writes every dirty tile at the write revision and clears the dirty
    /// set. Each tile is written at most once per transaction; when
    /// `revisioned` is false the sentinel revision 0 is overwritten in
    /// place instead of extending history.
    ///
    /// Returns the number of tiles written.
    pub fn flush(
        &mut self,
        write_revision: u64,
        revisioned: bool,
        table: &mut Table<'_, &'static [u8], &'static [u8]>,
    ) -> Result<usize> {
        let revision = if revisioned { write_revision } else { UNREVISIONED };
        let mut tile_ids: Vec<TileId> = self.dirty.drain().collect();
        tile_ids.sort_unstable();
        for tile_id in &tile_ids {
            // Flush only touches ids recorded as dirty, which always have
            // a cached tile.
            let Some(tile) = self.tiles.get(tile_id) else { continue };
            let record = postcard::to_allocvec(&tile.to_record()).map_err(codec_err)?;
            let key = keys::subtree_key(self.tree_id, &tile_id.prefix(), revision);
            table.insert(key.as_slice(), record.as_slice()).map_err(storage_err)?;
        }
        Ok(tile_ids.len())
    }

    /// Returns the cached tile, loading the latest persisted revision at
    /// or below the read revision on miss. Absent tiles start empty.
    fn tile(
        &mut self,
        tile_id: TileId,
        table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    ) -> Result<&mut Subtree> {
        if !self.tiles.contains_key(&tile_id) {
            let loaded = load_tile(table, self.tree_id, tile_id, self.read_revision)?;
            self.tiles.insert(tile_id, loaded.unwrap_or_default());
        }
        Ok(self.tiles.entry(tile_id).or_default())
    }
}

/// Loads the tile with the largest revision <= `read_revision`, rebuilding
/// its interior hashes.
fn load_tile(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    tree_id: TreeId,
    tile_id: TileId,
    read_revision: u64,
) -> Result<Option<Subtree>> {
    let prefix = tile_id.prefix();
    let start = keys::subtree_key(tree_id, &prefix, 0);
    let end = keys::subtree_key(tree_id, &prefix, read_revision);
    let mut range = table
        .range(start.as_slice()..=end.as_slice())
        .map_err(storage_err)?;
    match range.next_back() {
        Some(entry) => {
            let (_, value) = entry.map_err(storage_err)?;
            let record: SubtreeRecord =
                postcard::from_bytes(value.value()).map_err(codec_err)?;
            Ok(Some(Subtree::from_record(record)))
        }
        None => Ok(None),
    }
}
