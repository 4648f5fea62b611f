//! Core types, errors, and cryptographic primitives for Canopy.
//!
//! This crate provides the foundational types used throughout the log
//! storage engine:
//! - Identifier and record types for trees, leaves, and tree heads
//! - Cryptographic hashing (RFC 6962 SHA-256)
//! - Merkle node addressing and the compact-range appender
//! - Error types using snafu
//! - Engine configuration

pub mod config;
pub mod error;
pub mod hash;
pub mod leaf;
pub mod merkle;
pub mod root;
pub mod tree;

// Re-export commonly used types at crate root
pub use error::{ErrorKind, LogError, Result};
pub use hash::{leaf_hash, node_hash, sha256, Hash, EMPTY_ROOT_HASH, HASH_SIZE};
pub use leaf::{LogLeaf, QueueStatus, QueuedLogLeaf};
pub use merkle::{frontier_node_ids, merkle_root, CompactRange, NodeId};
pub use root::LogRoot;
pub use tree::{StorageOptions, Tree, TreeId, TreeState, TreeType};
