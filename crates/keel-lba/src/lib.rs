#![forbid(unsafe_code)]
//! Transactional copy-on-write LBA→PBA B+tree.
//!
//! This crate is the index at the heart of KeelStore's log-structured
//! object store: it maps logical block addresses to physical extents and
//! is consulted on every read, write, and relocation. Three pieces fit
//! together:
//!
//! 1. A **node model** (`node`): internal and leaf nodes with key-range
//!    metadata, capacity discipline, and the split/merge/balance
//!    primitives. Structural primitives allocate fresh pending nodes and
//!    never mutate their inputs, so they are safe to call on shared nodes.
//! 2. A **cursor** (`cursor`): the full root-to-leaf path with one
//!    position per level, so insertion, deletion, and range scans never
//!    re-descend from the root.
//! 3. The **tree engine** (`tree`): lookup, mutation with cascading
//!    splits and merges under copy-on-write, and the extent lifecycle
//!    hooks (`mkfs`, liveness init, node rewrite).
//!
//! The tree is written against a narrow transactional cache interface;
//! `cache` provides the in-memory, log-structured implementation used by
//! the rest of the store and by the test suites. All tree and cache data
//! is shard-local: transactions on one shard are serialized, and
//! concurrent transactions get snapshot isolation through copy-on-write
//! clones plus optimistic conflict detection at commit.

pub mod cache;
pub mod cursor;
pub mod node;
pub mod pin;
pub mod tree;

pub use cache::{
    CachedExtent, CommitError, CommitRecord, ExtentCache, LogicalExtent, Transaction, TreeStats,
};
pub use cursor::Cursor;
pub use node::{
    InternalNodeRef, LbaMapVal, LeafNodeRef, NodeExtent, NodeMeta, NodeRef,
    INTERNAL_NODE_CAPACITY, LEAF_NODE_CAPACITY,
};
pub use pin::{NodePin, PinBoard};
pub use tree::{LbaBtree, LbaRoot};

use keel_types::Paddr;

/// Context threaded through every tree operation: the current
/// transaction, the extent cache, and the pin registry.
#[derive(Clone, Copy)]
pub struct OpContext<'a> {
    pub trans: &'a Transaction,
    pub cache: &'a ExtentCache,
    pub pins: &'a PinBoard,
}

/// Callback observing every node entered during a descent, used by
/// callers to account mapped physical space.
pub type SpaceVisitor<'a> = dyn FnMut(Paddr, u32) + 'a;
