//! In-memory node model for the LBA tree.
//!
//! Internal and leaf nodes share one representation: an ordered entry
//! vector plus key-range metadata, wrapped in a cache extent that tracks
//! the node's physical address, pending/clean state, and pin. The
//! structural primitives (`make_split_children`, `make_full_merge`,
//! `make_balanced`) allocate fresh pending nodes through the cache and
//! never mutate their inputs, so they tolerate shared (clean) receivers;
//! the caller retires the originals afterwards.

use crate::cache::CachedExtent;
use crate::pin::NodePin;
use crate::{tree, OpContext};
use keel_error::Result;
use keel_types::{Laddr, Paddr, LBA_BLOCK_SIZE};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

const NODE_HEADER_SIZE: u32 = 32;
// Encoded entry sizes: laddr + map value for leaves, laddr + paddr for
// internal nodes. The node block layout itself is owned by the
// serialization layer; only the derived capacities matter here.
const LEAF_ENTRY_SIZE: u32 = 28;
const INTERNAL_ENTRY_SIZE: u32 = 16;

/// Maximum entries in a leaf node.
pub const LEAF_NODE_CAPACITY: usize =
    ((LBA_BLOCK_SIZE - NODE_HEADER_SIZE) / LEAF_ENTRY_SIZE) as usize;
/// Maximum entries in an internal node.
pub const INTERNAL_NODE_CAPACITY: usize =
    ((LBA_BLOCK_SIZE - NODE_HEADER_SIZE) / INTERNAL_ENTRY_SIZE) as usize;

/// A mapped physical extent: the value type of the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbaMapVal {
    pub paddr: Paddr,
    pub len: u32,
    pub refcount: u32,
    pub checksum: u32,
}

impl LbaMapVal {
    #[must_use]
    pub fn new(paddr: Paddr, len: u32) -> Self {
        Self {
            paddr,
            len,
            refcount: 1,
            checksum: 0,
        }
    }
}

/// Key-range metadata of a node: the subtree owns every key in
/// `[begin, end)` and sits at `depth` (leaves are depth 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMeta {
    pub begin: Laddr,
    pub end: Laddr,
    pub depth: u8,
}

impl NodeMeta {
    #[must_use]
    pub fn is_in_range(&self, addr: Laddr) -> bool {
        self.begin <= addr && addr < self.end
    }

    /// Halve this range at `pivot` for a node split.
    #[must_use]
    pub fn split_into(self, pivot: Laddr) -> (Self, Self) {
        debug_assert!(self.begin < pivot && pivot < self.end);
        (
            Self {
                begin: self.begin,
                end: pivot,
                depth: self.depth,
            },
            Self {
                begin: pivot,
                end: self.end,
                depth: self.depth,
            },
        )
    }

    /// Joined range of two adjacent siblings.
    #[must_use]
    pub fn merge_from(l: Self, r: Self) -> Self {
        debug_assert_eq!(l.end, r.begin);
        debug_assert_eq!(l.depth, r.depth);
        Self {
            begin: l.begin,
            end: r.end,
            depth: l.depth,
        }
    }

    /// Ranges of two siblings after redistribution at `pivot`.
    #[must_use]
    pub fn rebalance_into(l: Self, r: Self, pivot: Laddr) -> (Self, Self) {
        debug_assert_eq!(l.end, r.begin);
        NodeMeta::merge_from(l, r).split_into(pivot)
    }
}

impl fmt::Display for NodeMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})@{}", self.begin, self.end, self.depth)
    }
}

/// Behavior a node value type contributes: capacity, address
/// resolution, and how the cache allocates/fetches/wraps extents of the
/// corresponding node kind. Implemented by `LbaMapVal` (leaves) and
/// `Paddr` (internal nodes); everything else about nodes is generic.
pub trait NodeVal: Copy + PartialEq + fmt::Debug + 'static {
    const CAPACITY: usize;
    const KIND: &'static str;

    /// Map the physical address(es) stored in this value.
    #[must_use]
    fn resolve(self, f: &dyn Fn(Paddr) -> Paddr) -> Self;

    fn alloc_extent(c: OpContext<'_>, meta: NodeMeta) -> NodeRef<Self>;
    fn fetch_extent(c: OpContext<'_>, depth: u8, paddr: Paddr) -> Result<NodeRef<Self>>;
    fn wrap_extent(node: NodeRef<Self>) -> CachedExtent;
}

impl NodeVal for LbaMapVal {
    const CAPACITY: usize = LEAF_NODE_CAPACITY;
    const KIND: &'static str = "leaf";

    fn resolve(self, f: &dyn Fn(Paddr) -> Paddr) -> Self {
        Self {
            paddr: f(self.paddr),
            ..self
        }
    }

    fn alloc_extent(c: OpContext<'_>, meta: NodeMeta) -> NodeRef<Self> {
        c.cache.alloc_new_extent::<Self>(c.trans, meta)
    }

    fn fetch_extent(c: OpContext<'_>, depth: u8, paddr: Paddr) -> Result<NodeRef<Self>> {
        debug_assert_eq!(depth, 1);
        tree::get_leaf_node(c, paddr)
    }

    fn wrap_extent(node: NodeRef<Self>) -> CachedExtent {
        CachedExtent::Leaf(node)
    }
}

impl NodeVal for Paddr {
    const CAPACITY: usize = INTERNAL_NODE_CAPACITY;
    const KIND: &'static str = "internal";

    fn resolve(self, f: &dyn Fn(Paddr) -> Paddr) -> Self {
        f(self)
    }

    fn alloc_extent(c: OpContext<'_>, meta: NodeMeta) -> NodeRef<Self> {
        c.cache.alloc_new_extent::<Self>(c.trans, meta)
    }

    fn fetch_extent(c: OpContext<'_>, depth: u8, paddr: Paddr) -> Result<NodeRef<Self>> {
        tree::get_internal_node(c, depth, paddr)
    }

    fn wrap_extent(node: NodeRef<Self>) -> CachedExtent {
        CachedExtent::Internal(node)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry<V> {
    key: Laddr,
    val: V,
}

/// Ordered entries plus metadata: the payload of one node block.
#[derive(Debug, Clone)]
pub struct NodeEntries<V> {
    meta: NodeMeta,
    entries: Vec<Entry<V>>,
}

pub type LeafData = NodeEntries<LbaMapVal>;
pub type InternalData = NodeEntries<Paddr>;

impl<V: NodeVal> NodeEntries<V> {
    #[must_use]
    pub fn new(meta: NodeMeta) -> Self {
        Self {
            meta,
            entries: Vec::new(),
        }
    }

    #[must_use]
    pub fn meta(&self) -> NodeMeta {
        self.meta
    }

    pub fn set_meta(&mut self, meta: NodeMeta) {
        self.meta = meta;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn key_at(&self, pos: usize) -> Laddr {
        self.entries[pos].key
    }

    #[must_use]
    pub fn val_at(&self, pos: usize) -> V {
        self.entries[pos].val
    }

    /// First position whose key is >= `key`.
    #[must_use]
    pub fn lower_bound(&self, key: Laddr) -> usize {
        self.entries.partition_point(|e| e.key < key)
    }

    /// First position whose key is > `key`.
    #[must_use]
    pub fn upper_bound(&self, key: Laddr) -> usize {
        self.entries.partition_point(|e| e.key <= key)
    }

    pub fn insert(&mut self, pos: usize, key: Laddr, val: V) {
        assert!(self.entries.len() < V::CAPACITY, "inserting into a full node");
        debug_assert!(pos == 0 || self.entries[pos - 1].key < key);
        debug_assert!(pos == self.entries.len() || key < self.entries[pos].key);
        self.entries.insert(pos, Entry { key, val });
    }

    pub fn update(&mut self, pos: usize, val: V) {
        self.entries[pos].val = val;
    }

    /// Overwrite both key and value of one entry.
    pub fn replace(&mut self, pos: usize, key: Laddr, val: V) {
        self.entries[pos] = Entry { key, val };
    }

    pub fn remove(&mut self, pos: usize) {
        self.entries.remove(pos);
    }

    /// Re-encode every physical address stored in the entries.
    pub fn resolve_addrs(&mut self, f: &dyn Fn(Paddr) -> Paddr) {
        for entry in &mut self.entries {
            entry.val = entry.val.resolve(f);
        }
    }

    fn extend_from(&mut self, src: &Self, range: std::ops::Range<usize>) {
        self.entries.extend_from_slice(&src.entries[range]);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExtentState {
    /// Cloned into a transaction; exclusively owned and mutable.
    Pending,
    /// Committed and shared; must be duplicated before mutation.
    Clean,
    /// Replaced or superseded; kept only by stale references.
    Retired,
}

/// A node block as the cache holds it: payload plus address, state, and
/// pin. Node identity (for liveness checks) is `Arc` identity.
pub struct NodeExtent<V: NodeVal> {
    paddr: RwLock<Paddr>,
    state: RwLock<ExtentState>,
    pin: Arc<NodePin>,
    data: RwLock<NodeEntries<V>>,
}

pub type NodeRef<V> = Arc<NodeExtent<V>>;
pub type LeafNodeRef = NodeRef<LbaMapVal>;
pub type InternalNodeRef = NodeRef<Paddr>;

impl<V: NodeVal> NodeExtent<V> {
    pub(crate) fn new_pending(paddr: Paddr, meta: NodeMeta) -> NodeRef<V> {
        let pin = NodePin::new();
        pin.set_range(meta);
        Arc::new(Self {
            paddr: RwLock::new(paddr),
            state: RwLock::new(ExtentState::Pending),
            pin,
            data: RwLock::new(NodeEntries::new(meta)),
        })
    }

    #[must_use]
    pub fn paddr(&self) -> Paddr {
        *self.paddr.read()
    }

    pub(crate) fn set_paddr(&self, paddr: Paddr) {
        *self.paddr.write() = paddr;
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        *self.state.read() == ExtentState::Pending
    }

    pub(crate) fn set_state(&self, state: ExtentState) {
        *self.state.write() = state;
    }

    #[must_use]
    pub fn length(&self) -> u32 {
        LBA_BLOCK_SIZE
    }

    #[must_use]
    pub fn pin(&self) -> &Arc<NodePin> {
        &self.pin
    }

    pub fn with_data<R>(&self, f: impl FnOnce(&NodeEntries<V>) -> R) -> R {
        f(&self.data.read())
    }

    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut NodeEntries<V>) -> R) -> R {
        debug_assert!(self.is_pending(), "mutating a shared node");
        f(&mut self.data.write())
    }

    #[must_use]
    pub fn meta(&self) -> NodeMeta {
        self.data.read().meta()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.data.read().len()
    }

    #[must_use]
    pub fn at_capacity(&self) -> bool {
        self.size() >= V::CAPACITY
    }

    #[must_use]
    pub fn at_min_capacity(&self) -> bool {
        self.size() <= V::CAPACITY / 2
    }

    /// Exclusively owned copy at the same address, for copy-on-write.
    pub(crate) fn duplicate(&self) -> NodeRef<V> {
        let data = self.data.read().clone();
        let pin = NodePin::new();
        pin.set_range(data.meta());
        Arc::new(Self {
            paddr: RwLock::new(self.paddr()),
            state: RwLock::new(ExtentState::Pending),
            pin,
            data: RwLock::new(data),
        })
    }

    /// Split into two fresh pending children holding half the entries
    /// each; the pivot is the first key of the right child.
    pub fn make_split_children(&self, c: OpContext<'_>) -> (NodeRef<V>, NodeRef<V>, Laddr) {
        let data = self.data.read();
        let size = data.len();
        assert!(size >= 2, "splitting a node with fewer than two entries");
        let left_count = size.div_ceil(2);
        let pivot = data.key_at(left_count);
        let (lmeta, rmeta) = data.meta().split_into(pivot);
        let left = V::alloc_extent(c, lmeta);
        let right = V::alloc_extent(c, rmeta);
        left.with_data_mut(|d| d.extend_from(&data, 0..left_count));
        right.with_data_mut(|d| d.extend_from(&data, left_count..size));
        debug!(
            target: "keel::lba::node",
            event = "split_children",
            kind = V::KIND,
            pivot = %pivot,
            left_size = left_count,
            right_size = size - left_count,
        );
        (left, right, pivot)
    }

    /// Merge this node with its right sibling into one fresh pending
    /// node.
    pub fn make_full_merge(&self, c: OpContext<'_>, right: &NodeRef<V>) -> NodeRef<V> {
        let ldata = self.data.read();
        let rdata = right.data.read();
        let meta = NodeMeta::merge_from(ldata.meta(), rdata.meta());
        assert!(
            ldata.len() + rdata.len() <= V::CAPACITY,
            "full merge would overflow node capacity"
        );
        let merged = V::alloc_extent(c, meta);
        merged.with_data_mut(|d| {
            d.extend_from(&ldata, 0..ldata.len());
            d.extend_from(&rdata, 0..rdata.len());
        });
        debug!(
            target: "keel::lba::node",
            event = "full_merge",
            kind = V::KIND,
            meta = %meta,
            size = ldata.len() + rdata.len(),
        );
        merged
    }

    /// Redistribute entries between this node and its right sibling so
    /// both end up above minimum capacity. `prefer_left` gives the left
    /// replacement the extra entry when the total is odd.
    pub fn make_balanced(
        &self,
        c: OpContext<'_>,
        right: &NodeRef<V>,
        prefer_left: bool,
    ) -> (NodeRef<V>, NodeRef<V>, Laddr) {
        let ldata = self.data.read();
        let rdata = right.data.read();
        let lsize = ldata.len();
        let total = lsize + rdata.len();
        let left_count = (total + usize::from(prefer_left)) / 2;
        assert!(left_count >= 1 && left_count < total);
        let pivot = if left_count < lsize {
            ldata.key_at(left_count)
        } else {
            rdata.key_at(left_count - lsize)
        };
        let (lmeta, rmeta) = NodeMeta::rebalance_into(ldata.meta(), rdata.meta(), pivot);
        let repl_left = V::alloc_extent(c, lmeta);
        let repl_right = V::alloc_extent(c, rmeta);
        repl_left.with_data_mut(|d| {
            d.extend_from(&ldata, 0..lsize.min(left_count));
            if left_count > lsize {
                d.extend_from(&rdata, 0..left_count - lsize);
            }
        });
        repl_right.with_data_mut(|d| {
            if left_count < lsize {
                d.extend_from(&ldata, left_count..lsize);
            }
            d.extend_from(&rdata, left_count.saturating_sub(lsize)..rdata.len());
        });
        debug!(
            target: "keel::lba::node",
            event = "rebalance",
            kind = V::KIND,
            pivot = %pivot,
            left_size = left_count,
            right_size = total - left_count,
        );
        (repl_left, repl_right, pivot)
    }
}

impl<V: NodeVal> fmt::Debug for NodeExtent<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeExtent")
            .field("kind", &V::KIND)
            .field("paddr", &self.paddr())
            .field("state", &*self.state.read())
            .field("meta", &self.meta())
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(begin: u64, end: u64, depth: u8) -> NodeMeta {
        NodeMeta {
            begin: Laddr(begin),
            end: Laddr(end),
            depth,
        }
    }

    fn leaf_entries(meta_: NodeMeta, keys: &[u64]) -> LeafData {
        let mut data = LeafData::new(meta_);
        for (i, k) in keys.iter().enumerate() {
            data.insert(i, Laddr(*k), LbaMapVal::new(Paddr::Absolute(k * 0x1000), 0x1000));
        }
        data
    }

    #[test]
    fn capacities_derive_from_block_size() {
        assert_eq!(LEAF_NODE_CAPACITY, 145);
        assert_eq!(INTERNAL_NODE_CAPACITY, 254);
    }

    #[test]
    fn bounds_on_sorted_entries() {
        let data = leaf_entries(meta(0, u64::MAX, 1), &[2, 4, 6, 8]);
        assert_eq!(data.lower_bound(Laddr(4)), 1);
        assert_eq!(data.lower_bound(Laddr(5)), 2);
        assert_eq!(data.upper_bound(Laddr(4)), 2);
        assert_eq!(data.lower_bound(Laddr(9)), 4);
        assert_eq!(data.lower_bound(Laddr(0)), 0);
    }

    #[test]
    fn replace_overwrites_key_and_value() {
        let mut data = leaf_entries(meta(0, u64::MAX, 1), &[2, 4, 6]);
        data.replace(1, Laddr(5), LbaMapVal::new(Paddr::Absolute(0x9000), 0x1000));
        assert_eq!(data.key_at(1), Laddr(5));
        assert_eq!(data.val_at(1).paddr, Paddr::Absolute(0x9000));
    }

    #[test]
    fn meta_split_and_merge_round_trip() {
        let m = meta(16, 64, 2);
        let (l, r) = m.split_into(Laddr(40));
        assert_eq!(l, meta(16, 40, 2));
        assert_eq!(r, meta(40, 64, 2));
        assert_eq!(NodeMeta::merge_from(l, r), m);
    }

    #[test]
    fn resolve_addrs_touches_only_relative_entries() {
        let mut data = InternalData::new(meta(0, u64::MAX, 2));
        data.insert(0, Laddr::MIN, Paddr::Absolute(0x1000));
        data.insert(1, Laddr(100), Paddr::RecordRelative(0x2000));
        data.resolve_addrs(&|p| p.resolved_at(0x10000));
        assert_eq!(data.val_at(0), Paddr::Absolute(0x1000));
        assert_eq!(data.val_at(1), Paddr::Absolute(0x12000));
    }
}
