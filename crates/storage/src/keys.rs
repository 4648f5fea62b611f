//! Key encoding for the storage tables.
//!
//! All keys are prefixed with the tree id so every table supports
//! efficient tree-scoped prefix scans. Numeric components are big-endian,
//! making lexicographic key order equal numeric order; the unsequenced key
//! embeds (bucket, queue_timestamp, identity hash) so that plain key order
//! is the dequeue order.

use canopy_types::{Hash, TreeId, HASH_SIZE};

/// Prefix for scanning all rows of one tree.
pub fn tree_prefix(tree_id: TreeId) -> [u8; 8] {
    tree_id.value().to_be_bytes()
}

/// Key into the trees and tree-control tables.
pub fn tree_key(tree_id: TreeId) -> [u8; 8] {
    tree_prefix(tree_id)
}

/// Key into the tree-head table: {tree_id:8BE}{revision:8BE}.
pub fn tree_head_key(tree_id: TreeId, revision: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&tree_prefix(tree_id));
    key[8..].copy_from_slice(&revision.to_be_bytes());
    key
}

/// Key into the leaf-data and seq-by-identity tables:
/// {tree_id:8BE}{leaf_identity_hash:32}.
pub fn leaf_data_key(tree_id: TreeId, leaf_identity_hash: &Hash) -> [u8; 40] {
    let mut key = [0u8; 40];
    key[..8].copy_from_slice(&tree_prefix(tree_id));
    key[8..].copy_from_slice(leaf_identity_hash);
    key
}

/// Key into the sequence store: {tree_id:8BE}{sequence_number:8BE}.
pub fn sequenced_leaf_key(tree_id: TreeId, sequence_number: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&tree_prefix(tree_id));
    key[8..].copy_from_slice(&sequence_number.to_be_bytes());
    key
}

/// Sequence number stored as a seq-by-identity value.
pub fn encode_sequence_number(sequence_number: u64) -> [u8; 8] {
    sequence_number.to_be_bytes()
}

/// Decodes a seq-by-identity value.
pub fn decode_sequence_number(value: &[u8]) -> Option<u64> {
    Some(u64::from_be_bytes(value.try_into().ok()?))
}

/// Key into the Merkle-hash index:
/// {tree_id:8BE}{merkle_leaf_hash:32}{sequence_number:8BE}.
pub fn seq_by_merkle_key(
    tree_id: TreeId,
    merkle_leaf_hash: &Hash,
    sequence_number: u64,
) -> [u8; 48] {
    let mut key = [0u8; 48];
    key[..8].copy_from_slice(&tree_prefix(tree_id));
    key[8..40].copy_from_slice(merkle_leaf_hash);
    key[40..].copy_from_slice(&sequence_number.to_be_bytes());
    key
}

/// Prefix covering every sequence number for one Merkle hash.
pub fn seq_by_merkle_prefix(tree_id: TreeId, merkle_leaf_hash: &Hash) -> [u8; 40] {
    let mut prefix = [0u8; 40];
    prefix[..8].copy_from_slice(&tree_prefix(tree_id));
    prefix[8..].copy_from_slice(merkle_leaf_hash);
    prefix
}

/// Key into the unsequenced queue:
/// {tree_id:8BE}{bucket:4BE}{queue_ts:8BE}{leaf_identity_hash:32}.
pub fn unsequenced_key(
    tree_id: TreeId,
    bucket: u32,
    queue_timestamp_nanos: i64,
    leaf_identity_hash: &Hash,
) -> [u8; 52] {
    let mut key = [0u8; 52];
    key[..8].copy_from_slice(&tree_prefix(tree_id));
    key[8..12].copy_from_slice(&bucket.to_be_bytes());
    // Queue timestamps are non-negative, so the BE bit pattern orders
    // correctly as unsigned bytes.
    key[12..20].copy_from_slice(&(queue_timestamp_nanos as u64).to_be_bytes());
    key[20..].copy_from_slice(leaf_identity_hash);
    key
}

/// Decoded unsequenced-queue key components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsequencedKey {
    /// Owning tree.
    pub tree_id: TreeId,
    /// Shard key used by the dequeue policy.
    pub bucket: u32,
    /// Enqueue time, nanoseconds since the Unix epoch.
    pub queue_timestamp_nanos: i64,
    /// Dedup key of the queued leaf.
    pub leaf_identity_hash: Hash,
}

/// Decodes an unsequenced-queue key.
///
/// Returns None if the key has the wrong length.
pub fn decode_unsequenced_key(key: &[u8]) -> Option<UnsequencedKey> {
    if key.len() != 20 + HASH_SIZE {
        return None;
    }
    let tree_id = TreeId::new(i64::from_be_bytes(key[..8].try_into().ok()?));
    let bucket = u32::from_be_bytes(key[8..12].try_into().ok()?);
    let queue_timestamp_nanos = u64::from_be_bytes(key[12..20].try_into().ok()?) as i64;
    let leaf_identity_hash: Hash = key[20..].try_into().ok()?;
    Some(UnsequencedKey { tree_id, bucket, queue_timestamp_nanos, leaf_identity_hash })
}

/// Key into the subtree table:
/// {tree_id:8BE}{prefix_len:1}{prefix}{revision:8BE}.
///
/// The length byte keeps tiles with different prefix lengths from
/// interleaving in one range scan.
pub fn subtree_key(tree_id: TreeId, prefix: &[u8], revision: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(17 + prefix.len());
    key.extend_from_slice(&tree_prefix(tree_id));
    key.push(prefix.len() as u8);
    key.extend_from_slice(prefix);
    key.extend_from_slice(&revision.to_be_bytes());
    key
}

/// Smallest key strictly greater than every key starting with `prefix`,
/// or None when no such key exists.
pub fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < u8::MAX {
            upper.push(last + 1);
            return Some(upper);
        }
    }
    None
}
