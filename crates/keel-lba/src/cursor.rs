//! Root-to-leaf cursor over the LBA tree.
//!
//! A cursor remembers the entire descent path — one `(node, position)`
//! pair per level — so advancing, retreating, and mutating never
//! re-descend from the root unless a level boundary is crossed. The
//! level vector is indexed by depth: `internal[d - 2]` holds the node at
//! depth `d`, the leaf sits at depth 1.
//!
//! Invariants: every internal position indexes a real entry; the leaf
//! position may additionally equal the leaf's size, which encodes both
//! the end cursor and a one-step-ahead insertion point (repaired by the
//! insert or split that follows).

use crate::node::{LbaMapVal, NodeMeta, NodeRef, NodeVal};
use crate::pin::NodePin;
use crate::tree::{get_internal_node, get_leaf_node};
use crate::{OpContext, SpaceVisitor};
use keel_error::Result;
use keel_types::{Laddr, Paddr};
use std::sync::Arc;

#[derive(Clone)]
pub(crate) struct NodePosition<V: NodeVal> {
    pub(crate) node: NodeRef<V>,
    pub(crate) pos: usize,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum Edge {
    First,
    Last,
}

/// A materialized root-to-leaf path with one position per level.
#[derive(Clone)]
pub struct Cursor {
    pub(crate) internal: Vec<NodePosition<Paddr>>,
    pub(crate) leaf: NodePosition<LbaMapVal>,
}

impl Cursor {
    #[must_use]
    pub fn get_depth(&self) -> u8 {
        u8::try_from(self.internal.len() + 1).expect("tree depth fits u8")
    }

    pub(crate) fn internal_at(&self, depth: u8) -> &NodePosition<Paddr> {
        assert!(depth >= 2 && depth <= self.get_depth());
        &self.internal[usize::from(depth) - 2]
    }

    pub(crate) fn internal_at_mut(&mut self, depth: u8) -> &mut NodePosition<Paddr> {
        assert!(depth >= 2 && depth <= self.get_depth());
        &mut self.internal[usize::from(depth) - 2]
    }

    /// True iff the cursor sits one past the last leaf entry.
    #[must_use]
    pub fn is_end(&self) -> bool {
        self.leaf.pos == self.leaf.node.size()
    }

    /// True iff every level sits at its first entry.
    #[must_use]
    pub fn is_begin(&self) -> bool {
        self.leaf.pos == 0 && self.internal.iter().all(|p| p.pos == 0)
    }

    #[must_use]
    pub fn get_key(&self) -> Laddr {
        assert!(!self.is_end());
        self.leaf.node.with_data(|d| d.key_at(self.leaf.pos))
    }

    #[must_use]
    pub fn get_val(&self) -> LbaMapVal {
        assert!(!self.is_end());
        self.leaf.node.with_data(|d| d.val_at(self.leaf.pos))
    }

    /// The leaf node the cursor currently rests on.
    #[must_use]
    pub fn leaf_node(&self) -> &NodeRef<LbaMapVal> {
        &self.leaf.node
    }

    /// The internal node on the cursor's path at `depth` (>= 2).
    #[must_use]
    pub fn internal_node(&self, depth: u8) -> &NodeRef<Paddr> {
        &self.internal_at(depth).node
    }

    /// Build a depth-0 pin for the logical extent mapped at the cursor,
    /// resolvable against the containing leaf.
    #[must_use]
    pub fn make_pin(&self) -> Arc<NodePin> {
        let key = self.get_key();
        let val = self.get_val();
        let pin = NodePin::new();
        pin.set_range(NodeMeta {
            begin: key,
            end: key.extent_end(val.len),
            depth: 0,
        });
        pin.set_parent(self.leaf.node.paddr());
        pin
    }

    /// Number of consecutive at-capacity levels starting at the leaf:
    /// the depth a pre-emptive split cascade must start from (0 means no
    /// split is needed).
    #[must_use]
    pub fn check_split(&self) -> u8 {
        if !self.leaf.node.at_capacity() {
            return 0;
        }
        let mut split_from = 1;
        for depth in 2..=self.get_depth() {
            if self.internal_at(depth).node.at_capacity() {
                split_from = depth;
            } else {
                break;
            }
        }
        split_from
    }

    pub(crate) fn assert_valid(&self) {
        #[cfg(debug_assertions)]
        {
            for (idx, pos) in self.internal.iter().enumerate() {
                assert!(
                    pos.pos < pos.node.size(),
                    "internal position out of bounds at depth {}",
                    idx + 2
                );
            }
            assert!(self.leaf.pos <= self.leaf.node.size());
            // Each level's node is the child picked by the level above.
            for depth in 1..self.get_depth() {
                let parent = self.internal_at(depth + 1);
                let child_addr = parent
                    .node
                    .with_data(|d| d.val_at(parent.pos))
                    .maybe_relative_to(parent.node.paddr());
                let actual = if depth == 1 {
                    self.leaf.node.paddr()
                } else {
                    self.internal_at(depth).node.paddr()
                };
                assert_eq!(child_addr, actual, "cursor link broken at depth {depth}");
            }
        }
    }

    /// Cursor at the next leaf entry, or the end cursor. `visitor`
    /// observes any node entered while crossing a leaf boundary.
    pub fn next(
        &self,
        c: OpContext<'_>,
        mut visitor: Option<&mut SpaceVisitor<'_>>,
    ) -> Result<Cursor> {
        self.assert_valid();
        assert!(!self.is_end());

        let mut ret = self.clone();
        if ret.leaf.pos + 1 < ret.leaf.node.size() {
            ret.leaf.pos += 1;
            return Ok(ret);
        }

        let mut depth_with_space = 0;
        for depth in 2..=self.get_depth() {
            let pos = self.internal_at(depth);
            if pos.pos + 1 < pos.node.size() {
                depth_with_space = depth;
                break;
            }
        }

        if depth_with_space == 0 {
            ret.leaf.pos = ret.leaf.node.size();
            return Ok(ret);
        }

        ret.internal_at_mut(depth_with_space).pos += 1;
        descend_edge(
            c,
            &mut ret,
            depth_with_space - 1,
            Edge::First,
            visitor.as_deref_mut(),
        )?;
        ret.assert_valid();
        Ok(ret)
    }

    /// Cursor at the previous leaf entry.
    pub fn prev(&self, c: OpContext<'_>) -> Result<Cursor> {
        self.assert_valid();
        assert!(!self.is_begin());

        let mut ret = self.clone();
        if ret.leaf.pos > 0 {
            ret.leaf.pos -= 1;
            return Ok(ret);
        }

        let mut depth_with_space = 0;
        for depth in 2..=self.get_depth() {
            if self.internal_at(depth).pos > 0 {
                depth_with_space = depth;
                break;
            }
        }
        assert!(depth_with_space > 0, "prev on a begin cursor");

        ret.internal_at_mut(depth_with_space).pos -= 1;
        descend_edge(c, &mut ret, depth_with_space - 1, Edge::Last, None)?;
        ret.assert_valid();
        Ok(ret)
    }

    /// Repair a descent that landed one past the last entry of an
    /// intermediate leaf (the target key falls in the gap at the tail of
    /// the leaf's range): advance to the first entry of the next leaf.
    /// A cursor already at the true end is left alone.
    pub(crate) fn handle_boundary(
        &mut self,
        c: OpContext<'_>,
        mut visitor: Option<&mut SpaceVisitor<'_>>,
    ) -> Result<()> {
        debug_assert_eq!(self.leaf.pos, self.leaf.node.size());
        let mut depth_with_space = 0;
        for depth in 2..=self.get_depth() {
            let pos = self.internal_at(depth);
            if pos.pos + 1 < pos.node.size() {
                depth_with_space = depth;
                break;
            }
        }
        if depth_with_space == 0 {
            return Ok(());
        }
        self.internal_at_mut(depth_with_space).pos += 1;
        descend_edge(
            c,
            self,
            depth_with_space - 1,
            Edge::First,
            visitor.as_deref_mut(),
        )?;
        self.assert_valid();
        Ok(())
    }
}

/// Re-descend from `from_depth` down to the leaf, following the first
/// or last entry at every level and overwriting the cursor's positions
/// below the already-adjusted level.
pub(crate) fn descend_edge(
    c: OpContext<'_>,
    cursor: &mut Cursor,
    from_depth: u8,
    edge: Edge,
    mut visitor: Option<&mut SpaceVisitor<'_>>,
) -> Result<()> {
    for depth in (1..=from_depth).rev() {
        let child_addr = {
            let parent = cursor.internal_at(depth + 1);
            parent
                .node
                .with_data(|d| d.val_at(parent.pos))
                .maybe_relative_to(parent.node.paddr())
        };
        if depth > 1 {
            let node = get_internal_node(c, depth, child_addr)?;
            if let Some(v) = visitor.as_deref_mut() {
                v(node.paddr(), node.length());
            }
            let pos = match edge {
                Edge::First => 0,
                Edge::Last => node.size() - 1,
            };
            *cursor.internal_at_mut(depth) = NodePosition { node, pos };
        } else {
            let node = get_leaf_node(c, child_addr)?;
            if let Some(v) = visitor.as_deref_mut() {
                v(node.paddr(), node.length());
            }
            let pos = match edge {
                Edge::First => 0,
                Edge::Last => node.size() - 1,
            };
            cursor.leaf = NodePosition { node, pos };
        }
    }
    Ok(())
}
