//! Cryptographic hashing for Canopy.
//!
//! All hashing uses SHA-256 with the RFC 6962 domain separation prefixes:
//! - Leaf hash: SHA-256(0x00 || leaf_value)
//! - Node hash: SHA-256(0x01 || left || right)
//!
//! The root of the empty tree is SHA-256 of the empty string.

use sha2::{Digest, Sha256};

/// SHA-256 hash output (32 bytes).
pub type Hash = [u8; 32];

/// Size in bytes of every hash the engine stores.
pub const HASH_SIZE: usize = 32;

/// Root hash of an empty tree: SHA-256("").
///
/// NOT zero bytes - callers comparing roots across implementations depend
/// on this exact value.
pub const EMPTY_ROOT_HASH: Hash = [
    0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9, 0x24,
    0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52, 0xb8, 0x55,
];

/// RFC 6962 domain prefix for leaf hashes.
const LEAF_PREFIX: u8 = 0x00;

/// RFC 6962 domain prefix for interior node hashes.
const NODE_PREFIX: u8 = 0x01;

/// Compute SHA-256 of arbitrary data, without domain separation.
#[inline]
pub fn sha256(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute the RFC 6962 Merkle leaf hash of a leaf value.
#[inline]
pub fn leaf_hash(leaf_value: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(leaf_value);
    hasher.finalize().into()
}

/// Compute the RFC 6962 Merkle interior node hash of two children.
#[inline]
pub fn node_hash(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_root_constant() {
        assert_eq!(sha256(b""), EMPTY_ROOT_HASH);
    }

    #[test]
    fn test_leaf_hash_empty_leaf() {
        // RFC 6962 test vector: the leaf hash of the empty string is
        // SHA-256(0x00).
        let expected: Hash = [
            0x6e, 0x34, 0x0b, 0x9c, 0xff, 0xb3, 0x7a, 0x98, 0x9c, 0xa5, 0x44, 0xe6, 0xbb, 0x78,
            0x0a, 0x2c, 0x78, 0x90, 0x1d, 0x3f, 0xb3, 0x37, 0x38, 0x76, 0x85, 0x11, 0xa3, 0x06,
            0x17, 0xaf, 0xa0, 0x1d,
        ];
        assert_eq!(leaf_hash(b""), expected);
    }

    #[test]
    fn test_leaf_and_node_domains_differ() {
        // The same bytes hashed as a leaf and as raw data must not collide.
        let data = [0u8; 64];
        assert_ne!(leaf_hash(&data), sha256(&data));

        let left = leaf_hash(b"left");
        let right = leaf_hash(b"right");
        let mut concat = Vec::new();
        concat.extend_from_slice(&left);
        concat.extend_from_slice(&right);
        assert_ne!(node_hash(&left, &right), sha256(&concat));
    }

    #[test]
    fn test_node_hash_order_matters() {
        let a = leaf_hash(b"a");
        let b = leaf_hash(b"b");
        assert_ne!(node_hash(&a, &b), node_hash(&b, &a));
    }
}
