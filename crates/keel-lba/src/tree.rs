//! The LBA B+tree engine: lookup, copy-on-write mutation with cascading
//! splits and merges, and the extent lifecycle hooks.
//!
//! Every operation takes an [`OpContext`] and works against whatever the
//! transaction can see: clean committed nodes until the first write,
//! pending copies afterwards. The root handle is the only state owned by
//! the tree value itself; a `LbaBtree` is constructed per transaction
//! from the last committed root and hands the (possibly updated) root
//! back at commit time.

use crate::cache::CachedExtent;
use crate::cursor::{Cursor, NodePosition};
use crate::node::{
    InternalData, InternalNodeRef, LbaMapVal, LeafData, LeafNodeRef, NodeMeta, NodeRef, NodeVal,
};
use crate::{OpContext, SpaceVisitor};
use keel_error::{KeelError, Result};
use keel_types::{Laddr, Paddr};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, trace};

/// The persisted root handle: root node address plus tree depth. Stored
/// out-of-band by the transaction layer; everything else lives in nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbaRoot {
    location: Paddr,
    depth: u8,
}

impl LbaRoot {
    #[must_use]
    pub fn new(location: Paddr, depth: u8) -> Self {
        Self { location, depth }
    }

    #[must_use]
    pub fn location(&self) -> Paddr {
        self.location
    }

    #[must_use]
    pub fn depth(&self) -> u8 {
        self.depth
    }

    /// Resolve a record-relative root location once the owning
    /// transaction has committed.
    pub fn after_commit(&mut self, record: &crate::cache::CommitRecord) {
        self.location = record.resolve(self.location);
    }
}

/// The LBA→PBA index tree for one transaction.
pub struct LbaBtree {
    root: LbaRoot,
    root_dirty: bool,
}

impl LbaBtree {
    /// Construct a tree handle from the last committed root. The dirty
    /// flag is per transaction and starts cleared.
    #[must_use]
    pub fn new(root: LbaRoot) -> Self {
        Self {
            root,
            root_dirty: false,
        }
    }

    #[must_use]
    pub fn root(&self) -> LbaRoot {
        self.root
    }

    /// True iff the root's location or depth changed in this
    /// transaction and the handle must be re-persisted.
    #[must_use]
    pub fn is_root_dirty(&self) -> bool {
        self.root_dirty
    }

    /// Create an empty tree: a single empty leaf covering the whole key
    /// space.
    pub fn mkfs(c: OpContext<'_>) -> LbaRoot {
        let meta = NodeMeta {
            begin: Laddr::MIN,
            end: Laddr::MAX,
            depth: 1,
        };
        let leaf: LeafNodeRef = c.cache.alloc_new_extent(c.trans, meta);
        c.trans.set_tree_depth(1);
        debug!(
            target: "keel::lba",
            event = "mkfs",
            txn = c.trans.id().0,
            root = %leaf.paddr(),
        );
        LbaRoot::new(leaf.paddr(), 1)
    }

    /// Cursor at the first entry with key >= `addr`, or the end cursor.
    pub fn lower_bound(
        &self,
        c: OpContext<'_>,
        addr: Laddr,
        mut visitor: Option<&mut SpaceVisitor<'_>>,
    ) -> Result<Cursor> {
        let mut ret = self.lookup(
            c,
            |internal: &InternalData| {
                assert!(!internal.is_empty());
                let iter = internal.upper_bound(addr);
                assert!(iter > 0, "internal node missing its left sentinel pivot");
                iter - 1
            },
            |leaf: &LeafData| leaf.lower_bound(addr),
            visitor.as_deref_mut(),
        )?;
        if ret.leaf.pos == ret.leaf.node.size() {
            // The target sits in the gap at the tail of this leaf's
            // range; the first key >= addr, if any, starts the next leaf.
            ret.handle_boundary(c, visitor.as_deref_mut())?;
        }
        trace!(
            target: "keel::lba",
            event = "lower_bound",
            txn = c.trans.id().0,
            addr = %addr,
            leaf_pos = ret.leaf.pos,
            is_end = ret.is_end(),
        );
        Ok(ret)
    }

    /// Insert `laddr → val` at the position hinted by `iter` (obtained
    /// from [`Self::lower_bound`]). Idempotent on duplicates: if a live
    /// mapping for `laddr` exists the tree is unchanged and the flag is
    /// false.
    pub fn insert(
        &mut self,
        c: OpContext<'_>,
        iter: Cursor,
        laddr: Laddr,
        val: LbaMapVal,
    ) -> Result<(Cursor, bool)> {
        debug!(
            target: "keel::lba",
            event = "insert",
            txn = c.trans.id().0,
            laddr = %laddr,
            paddr = %val.paddr,
            len = val.len,
        );
        let mut ret = iter;
        self.find_insertion(c, laddr, &mut ret)?;
        if !ret.is_end() && ret.get_key() == laddr {
            return Ok((ret, false));
        }
        self.handle_split(c, &mut ret)?;

        if !ret.leaf.node.is_pending() {
            ret.leaf.node = c.cache.duplicate_for_write(c.trans, &ret.leaf.node);
        }
        let (pos, exists) = ret.leaf.node.with_data(|d| {
            let pos = d.lower_bound(laddr);
            (pos, pos < d.len() && d.key_at(pos) == laddr)
        });
        ret.leaf.pos = pos;
        if exists {
            return Ok((ret, false));
        }
        let meta = ret.leaf.node.meta();
        assert!(
            meta.is_in_range(laddr),
            "insertion point leaf {meta} does not cover {laddr}"
        );
        ret.leaf.node.with_data_mut(|d| d.insert(pos, laddr, val));
        Ok((ret, true))
    }

    /// Overwrite the mapping at `iter`. No structural change.
    pub fn update(&self, c: OpContext<'_>, iter: Cursor, val: LbaMapVal) -> Result<Cursor> {
        assert!(!iter.is_end());
        debug!(
            target: "keel::lba",
            event = "update",
            txn = c.trans.id().0,
            laddr = %iter.get_key(),
            paddr = %val.paddr,
        );
        let mut ret = iter;
        if !ret.leaf.node.is_pending() {
            ret.leaf.node = c.cache.duplicate_for_write(c.trans, &ret.leaf.node);
        }
        ret.leaf
            .node
            .with_data_mut(|d| d.update(ret.leaf.pos, val));
        Ok(ret)
    }

    /// Remove the mapping at `iter`, merging underfull nodes upward.
    pub fn remove(&mut self, c: OpContext<'_>, iter: Cursor) -> Result<()> {
        assert!(!iter.is_end());
        debug!(
            target: "keel::lba",
            event = "remove",
            txn = c.trans.id().0,
            laddr = %iter.get_key(),
        );
        let mut ret = iter;
        if !ret.leaf.node.is_pending() {
            ret.leaf.node = c.cache.duplicate_for_write(c.trans, &ret.leaf.node);
        }
        ret.leaf.node.with_data_mut(|d| d.remove(ret.leaf.pos));
        self.handle_merge(c, &mut ret)
    }

    /// Decide whether a cache-resident extent is still referenced by the
    /// current tree; not-live extents are dropped from the cache and
    /// `None` is returned.
    pub fn init_cached_extent(
        &self,
        c: OpContext<'_>,
        extent: CachedExtent,
    ) -> Result<Option<CachedExtent>> {
        match &extent {
            CachedExtent::Logical(log) => {
                let iter = self.lower_bound(c, log.laddr(), None)?;
                let live = !iter.is_end()
                    && iter.get_key() == log.laddr()
                    && iter.get_val().paddr == log.paddr();
                if live {
                    assert_eq!(iter.get_val().len, log.length());
                    let pin = iter.make_pin();
                    log.set_pin(pin.clone());
                    c.pins.add_pin(&pin);
                    debug!(
                        target: "keel::lba",
                        event = "init_extent_live",
                        kind = "logical",
                        laddr = %log.laddr(),
                    );
                    Ok(Some(extent))
                } else {
                    debug!(
                        target: "keel::lba",
                        event = "init_extent_stale",
                        kind = "logical",
                        laddr = %log.laddr(),
                    );
                    c.cache.drop_from_cache(&extent);
                    Ok(None)
                }
            }
            CachedExtent::Internal(node) => {
                let meta = node.meta();
                let iter = self.lower_bound(c, meta.begin, None)?;
                // Valid even if the cursor is at end: the path is intact.
                let live = meta.depth >= 2
                    && meta.depth <= iter.get_depth()
                    && Arc::ptr_eq(&iter.internal_at(meta.depth).node, node);
                self.finish_node_liveness(c, extent, live)
            }
            CachedExtent::Leaf(node) => {
                let meta = node.meta();
                let iter = self.lower_bound(c, meta.begin, None)?;
                let live = Arc::ptr_eq(&iter.leaf.node, node);
                self.finish_node_liveness(c, extent, live)
            }
        }
    }

    fn finish_node_liveness(
        &self,
        c: OpContext<'_>,
        extent: CachedExtent,
        live: bool,
    ) -> Result<Option<CachedExtent>> {
        if live {
            debug!(
                target: "keel::lba",
                event = "init_extent_live",
                kind = extent.kind(),
                paddr = %extent.paddr(),
            );
            Ok(Some(extent))
        } else {
            debug!(
                target: "keel::lba",
                event = "init_extent_stale",
                kind = extent.kind(),
                paddr = %extent.paddr(),
            );
            c.cache.drop_from_cache(&extent);
            Ok(None)
        }
    }

    /// Relocate a tree node for compaction: clone it to a fresh pending
    /// extent, re-point the parent, retire the original.
    pub fn rewrite_lba_extent(&mut self, c: OpContext<'_>, extent: CachedExtent) -> Result<()> {
        match &extent {
            CachedExtent::Internal(node) => self.rewrite_node(c, node),
            CachedExtent::Leaf(node) => self.rewrite_node(c, node),
            CachedExtent::Logical(_) => {
                panic!("rewrite_lba_extent requires an LBA node extent")
            }
        }
    }

    fn rewrite_node<V: NodeVal>(&mut self, c: OpContext<'_>, node: &NodeRef<V>) -> Result<()> {
        let meta = node.meta();
        let fresh = V::alloc_extent(c, meta);
        fresh.with_data_mut(|d| *d = node.with_data(Clone::clone));
        let new_paddr = fresh.paddr();
        // Any relative addresses in the source are necessarily record
        // relative (it is a dirty extent being rewritten); re-encode
        // them block-relative against the clone's own location so that
        // commit interprets them at the final address.
        fresh.with_data_mut(|d| {
            d.resolve_addrs(&move |p| {
                if p.is_record_relative() {
                    p.block_relative_to(new_paddr)
                } else {
                    p
                }
            });
        });
        debug!(
            target: "keel::lba",
            event = "rewrite_extent",
            txn = c.trans.id().0,
            kind = V::KIND,
            from = %node.paddr(),
            to = %new_paddr,
            meta = %meta,
        );
        self.update_internal_mapping(c, meta.depth, meta.begin, node.paddr(), new_paddr)?;
        c.cache
            .retire_extent(c.trans, V::wrap_extent(node.clone()));
        Ok(())
    }

    /// Shared descent: at every internal level pick an entry with
    /// `chooser_internal`, at the leaf pick the final position with
    /// `chooser_leaf`, recording the whole path in the cursor.
    fn lookup<FI, FL>(
        &self,
        c: OpContext<'_>,
        chooser_internal: FI,
        chooser_leaf: FL,
        mut visitor: Option<&mut SpaceVisitor<'_>>,
    ) -> Result<Cursor>
    where
        FI: Fn(&InternalData) -> usize,
        FL: Fn(&LeafData) -> usize,
    {
        let root_depth = self.root.depth();
        assert!(root_depth >= 1);
        let mut internal: Vec<NodePosition<Paddr>> = Vec::new();
        let mut leaf = None;
        let mut addr = self.root.location();
        for depth in (1..=root_depth).rev() {
            if depth > 1 {
                let node = get_internal_node(c, depth, addr)?;
                if let Some(v) = visitor.as_deref_mut() {
                    v(node.paddr(), node.length());
                }
                let pos = node.with_data(|d| chooser_internal(d));
                addr = node
                    .with_data(|d| d.val_at(pos))
                    .maybe_relative_to(node.paddr());
                internal.push(NodePosition { node, pos });
            } else {
                let node = get_leaf_node(c, addr)?;
                if let Some(v) = visitor.as_deref_mut() {
                    v(node.paddr(), node.length());
                }
                let pos = node.with_data(|d| chooser_leaf(d));
                leaf = Some(NodePosition { node, pos });
            }
        }
        internal.reverse();
        let cursor = Cursor {
            internal,
            leaf: leaf.expect("descent always reaches a leaf"),
        };
        cursor.assert_valid();
        Ok(cursor)
    }

    /// Normalize a `lower_bound` cursor into an insertion cursor for
    /// `laddr`. The result may hold a one-past-the-end leaf position
    /// when the insertion point is at the end of the previous leaf; the
    /// immediate insert or split repairs that.
    fn find_insertion(&self, c: OpContext<'_>, laddr: Laddr, iter: &mut Cursor) -> Result<()> {
        debug_assert!(iter.is_end() || iter.get_key() >= laddr);
        if !iter.is_end() && iter.get_key() == laddr {
            return Ok(());
        }
        if iter.leaf.node.meta().begin <= laddr {
            #[cfg(debug_assertions)]
            if iter.leaf.pos > 0 {
                let prev_key = iter.leaf.node.with_data(|d| d.key_at(iter.leaf.pos - 1));
                debug_assert!(prev_key < laddr);
            }
            return Ok(());
        }
        assert_eq!(iter.leaf.pos, 0);
        let mut p = iter.prev(c)?;
        assert!(p.leaf.node.meta().begin <= laddr);
        debug_assert!(p.get_key() < laddr);
        p.leaf.pos += 1;
        *iter = p;
        Ok(())
    }

    /// Pre-emptively split every at-capacity level on the cursor's
    /// path, growing a new root first if the cascade reaches it. The
    /// cursor tracks the insertion point through every split.
    fn handle_split(&mut self, c: OpContext<'_>, iter: &mut Cursor) -> Result<()> {
        let mut split_from = iter.check_split();
        debug!(
            target: "keel::lba",
            event = "handle_split",
            txn = c.trans.id().0,
            split_from,
            depth = iter.get_depth(),
        );

        if split_from > 0 && split_from == iter.get_depth() {
            let new_depth = iter.get_depth() + 1;
            let meta = NodeMeta {
                begin: Laddr::MIN,
                end: Laddr::MAX,
                depth: new_depth,
            };
            let nroot: InternalNodeRef = c.cache.alloc_new_extent(c.trans, meta);
            nroot.with_data_mut(|d| d.insert(0, Laddr::MIN, self.root.location()));
            iter.internal.push(NodePosition {
                node: nroot.clone(),
                pos: 0,
            });
            self.root.set_location(nroot.paddr());
            self.root.set_depth(new_depth);
            c.trans.set_tree_depth(new_depth);
            self.root_dirty = true;
            debug!(
                target: "keel::lba",
                event = "root_grown",
                txn = c.trans.id().0,
                depth = new_depth,
                root = %nroot.paddr(),
            );
        }

        while split_from > 0 {
            let parent_depth = split_from + 1;
            {
                let ppos = iter.internal_at_mut(parent_depth);
                if !ppos.node.is_pending() {
                    ppos.node = c.cache.duplicate_for_write(c.trans, &ppos.node);
                }
            }
            if split_from > 1 {
                let parent_idx = usize::from(split_from) - 1;
                let (below, above) = iter.internal.split_at_mut(parent_idx);
                split_level(c, &mut above[0], &mut below[parent_idx - 1]);
            } else {
                let Cursor { internal, leaf } = iter;
                split_level(c, &mut internal[0], leaf);
            }
            split_from -= 1;
        }
        Ok(())
    }

    /// Walk upward from the leaf merging or rebalancing every
    /// at-minimum level, collapsing the root when it is left with a
    /// single child.
    fn handle_merge(&mut self, c: OpContext<'_>, iter: &mut Cursor) -> Result<()> {
        if iter.get_depth() == 1 || !iter.leaf.node.at_min_capacity() {
            debug!(
                target: "keel::lba",
                event = "merge_not_needed",
                txn = c.trans.id().0,
                leaf_size = iter.leaf.node.size(),
                depth = iter.get_depth(),
            );
            return Ok(());
        }

        let mut to_merge: u8 = 1;
        loop {
            debug!(
                target: "keel::lba",
                event = "merge_level",
                txn = c.trans.id().0,
                depth = to_merge,
            );
            if to_merge > 1 {
                let parent_idx = usize::from(to_merge) - 1;
                let (below, above) = iter.internal.split_at_mut(parent_idx);
                merge_level(c, to_merge, &mut above[0], &mut below[parent_idx - 1])?;
            } else {
                let Cursor { internal, leaf } = iter;
                merge_level(c, 1, &mut internal[0], leaf)?;
            }

            to_merge += 1;
            if to_merge == iter.get_depth() {
                let root_pos = iter.internal_at(to_merge);
                if root_pos.node.size() == 1 {
                    assert_eq!(root_pos.pos, 0);
                    let root_node = root_pos.node.clone();
                    let child = root_node
                        .with_data(|d| d.val_at(0))
                        .maybe_relative_to(root_node.paddr());
                    c.cache
                        .retire_extent(c.trans, CachedExtent::Internal(root_node));
                    iter.internal.pop();
                    self.root.set_location(child);
                    self.root.set_depth(iter.get_depth());
                    c.trans.set_tree_depth(iter.get_depth());
                    self.root_dirty = true;
                    debug!(
                        target: "keel::lba",
                        event = "root_collapsed",
                        txn = c.trans.id().0,
                        depth = iter.get_depth(),
                        root = %child,
                    );
                }
                break;
            }
            if !iter.internal_at(to_merge).node.at_min_capacity() {
                break;
            }
        }
        Ok(())
    }

    /// Re-point the parent entry of a node rewritten at `laddr`/`depth`
    /// from `old_addr` to `new_addr`. Any mismatch is a bug in the
    /// caller: only a just-rewritten, parent-reachable node may be
    /// passed here. The scratch cursor used for the descent is invalid
    /// afterwards and never escapes.
    fn update_internal_mapping(
        &mut self,
        c: OpContext<'_>,
        depth: u8,
        laddr: Laddr,
        old_addr: Paddr,
        new_addr: Paddr,
    ) -> Result<()> {
        debug!(
            target: "keel::lba",
            event = "update_internal_mapping",
            txn = c.trans.id().0,
            laddr = %laddr,
            depth,
            from = %old_addr,
            to = %new_addr,
        );
        let iter = self.lower_bound(c, laddr, None)?;
        assert!(iter.get_depth() >= depth);
        if depth == iter.get_depth() {
            if laddr != Laddr::MIN {
                error!(
                    target: "keel::lba",
                    event = "root_remap_bad_laddr",
                    laddr = %laddr,
                    depth,
                );
                panic!("rewriting the root with nonzero laddr {laddr}");
            }
            if self.root.location() != old_addr {
                error!(
                    target: "keel::lba",
                    event = "root_remap_bad_addr",
                    expected = %old_addr,
                    actual = %self.root.location(),
                );
                panic!("root location does not match the rewritten extent");
            }
            self.root.set_location(new_addr);
            self.root_dirty = true;
        } else {
            let parent = iter.internal_at(depth + 1);
            assert!(parent.pos < parent.node.size());
            let (pivot_key, pivot_val) = parent
                .node
                .with_data(|d| (d.key_at(parent.pos), d.val_at(parent.pos)));
            if pivot_key != laddr {
                error!(
                    target: "keel::lba",
                    event = "parent_remap_bad_pivot",
                    expected = %laddr,
                    actual = %pivot_key,
                    parent = ?parent.node,
                );
                panic!("parent pivot does not match the rewritten extent");
            }
            if pivot_val != old_addr {
                error!(
                    target: "keel::lba",
                    event = "parent_remap_bad_addr",
                    expected = %old_addr,
                    actual = %pivot_val,
                    parent = ?parent.node,
                );
                panic!("parent entry does not point at the rewritten extent");
            }
            let pos = parent.pos;
            let mparent = c.cache.duplicate_for_write(c.trans, &parent.node);
            mparent.with_data_mut(|d| d.update(pos, new_addr));
            // `iter` is stale from here: neither the parent reference
            // nor the child pointer were refreshed. It is dropped on
            // return and must not be reused.
        }
        Ok(())
    }
}

impl LbaRoot {
    fn set_location(&mut self, location: Paddr) {
        self.location = location;
    }

    fn set_depth(&mut self, depth: u8) {
        self.depth = depth;
    }
}

/// Split the node at `pos`, fix up the parent, and re-point the cursor
/// at whichever half now holds its position. Relies on the pivot being
/// the right child's first key.
fn split_level<V: NodeVal>(
    c: OpContext<'_>,
    parent_pos: &mut NodePosition<Paddr>,
    pos: &mut NodePosition<V>,
) {
    let (left, right, pivot) = pos.node.make_split_children(c);
    debug_assert!(parent_pos.node.is_pending());
    parent_pos.node.with_data_mut(|d| {
        d.update(parent_pos.pos, left.paddr());
        d.insert(parent_pos.pos + 1, pivot, right.paddr());
    });
    c.cache
        .retire_extent(c.trans, V::wrap_extent(pos.node.clone()));

    // pivot == right's first key, so a cursor position of exactly
    // left.size() stays on the left node: an insertion there sorts
    // before the right node's key range.
    let left_size = left.size();
    if pos.pos <= left_size {
        pos.node = left;
    } else {
        pos.node = right;
        pos.pos -= left_size;
        parent_pos.pos += 1;
    }
}

/// Merge or rebalance the node at `pos` with a sibling. The sibling is
/// the left one only when `pos` is its parent's last child. At minimum
/// capacity on both sides the pair fully merges; otherwise entries are
/// redistributed and the parent's right slot gets the new pivot.
fn merge_level<V: NodeVal>(
    c: OpContext<'_>,
    depth: u8,
    parent_pos: &mut NodePosition<Paddr>,
    pos: &mut NodePosition<V>,
) -> Result<()> {
    if !parent_pos.node.is_pending() {
        parent_pos.node = c.cache.duplicate_for_write(c.trans, &parent_pos.node);
    }
    let parent = parent_pos.node.clone();
    let parent_size = parent.size();
    assert!(parent_pos.pos < parent_size);
    assert!(parent_size >= 2, "merge target has no sibling");

    let donor_is_left = parent_pos.pos + 1 == parent_size;
    let donor_idx = if donor_is_left {
        parent_pos.pos - 1
    } else {
        parent_pos.pos + 1
    };
    let donor_addr = parent
        .with_data(|d| d.val_at(donor_idx))
        .maybe_relative_to(parent.paddr());
    let donor = V::fetch_extent(c, depth, donor_addr)?;

    let (l, r) = if donor_is_left {
        (donor.clone(), pos.node.clone())
    } else {
        (pos.node.clone(), donor.clone())
    };
    let (liter, riter) = if donor_is_left {
        (donor_idx, parent_pos.pos)
    } else {
        (parent_pos.pos, donor_idx)
    };
    let left_size = l.size();

    if donor.at_min_capacity() {
        let replacement = l.make_full_merge(c, &r);
        parent.with_data_mut(|d| {
            d.update(liter, replacement.paddr());
            d.remove(riter);
        });
        pos.node = replacement;
        if donor_is_left {
            pos.pos += left_size;
            parent_pos.pos -= 1;
        }
        c.cache.retire_extent(c.trans, V::wrap_extent(l));
        c.cache.retire_extent(c.trans, V::wrap_extent(r));
    } else {
        let (repl_left, repl_right, pivot) = l.make_balanced(c, &r, !donor_is_left);
        parent.with_data_mut(|d| {
            d.update(liter, repl_left.paddr());
            d.replace(riter, pivot, repl_right.paddr());
        });
        if donor_is_left {
            assert!(parent_pos.pos > 0);
            parent_pos.pos -= 1;
        }
        let orig_pos = if donor_is_left {
            left_size + pos.pos
        } else {
            pos.pos
        };
        let repl_left_size = repl_left.size();
        if orig_pos < repl_left_size {
            pos.node = repl_left;
            pos.pos = orig_pos;
        } else {
            parent_pos.pos += 1;
            pos.node = repl_right;
            pos.pos = orig_pos - repl_left_size;
        }
        c.cache.retire_extent(c.trans, V::wrap_extent(l));
        c.cache.retire_extent(c.trans, V::wrap_extent(r));
    }
    Ok(())
}

/// Read an internal node, sanity-check it against its metadata, and
/// link its pin if this is the first clean read.
pub(crate) fn get_internal_node(
    c: OpContext<'_>,
    depth: u8,
    offset: Paddr,
) -> Result<InternalNodeRef> {
    trace!(
        target: "keel::lba",
        event = "read_internal_node",
        txn = c.trans.id().0,
        depth,
        offset = %offset,
    );
    let extent = c.cache.get_extent(c.trans, offset)?;
    let node = match extent {
        CachedExtent::Internal(node) => node,
        other => {
            return Err(KeelError::Corruption {
                paddr: offset,
                detail: format!("expected internal node, found {} extent", other.kind()),
            })
        }
    };
    let meta = node.meta();
    assert_eq!(meta.depth, depth, "internal node depth mismatch");
    node.with_data(|d| {
        if !d.is_empty() {
            assert!(meta.begin <= d.key_at(0));
            assert!(meta.end > d.key_at(d.len() - 1));
        }
    });
    if !node.is_pending() && !node.pin().is_linked() {
        node.pin().set_range(meta);
        c.pins.add_pin(node.pin());
    }
    Ok(node)
}

/// Read a leaf node; same checks and pin linking as internal reads.
pub(crate) fn get_leaf_node(c: OpContext<'_>, offset: Paddr) -> Result<LeafNodeRef> {
    trace!(
        target: "keel::lba",
        event = "read_leaf_node",
        txn = c.trans.id().0,
        offset = %offset,
    );
    let extent = c.cache.get_extent(c.trans, offset)?;
    let node = match extent {
        CachedExtent::Leaf(node) => node,
        other => {
            return Err(KeelError::Corruption {
                paddr: offset,
                detail: format!("expected leaf node, found {} extent", other.kind()),
            })
        }
    };
    let meta = node.meta();
    assert_eq!(meta.depth, 1, "leaf node depth mismatch");
    node.with_data(|d| {
        if !d.is_empty() {
            assert!(meta.begin <= d.key_at(0));
            assert!(meta.end > d.key_at(d.len() - 1));
        }
    });
    if !node.is_pending() && !node.pin().is_linked() {
        node.pin().set_range(meta);
        c.pins.add_pin(node.pin());
    }
    Ok(node)
}
