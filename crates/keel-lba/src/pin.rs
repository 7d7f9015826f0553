//! Pin registry: cache-resident handles linking a node to its key range.
//!
//! Every resident node (and every live logical extent, at depth 0) owns a
//! `NodePin`. While linked into the `PinBoard` the pin makes the extent
//! discoverable by key range and carries the parent address against which
//! relative child addresses resolve. Two linked pins at the same depth
//! must never overlap.

use crate::node::NodeMeta;
use keel_types::{Laddr, Paddr};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tracing::trace;

/// A pin keyed by the node's current key range.
///
/// The range is set when the owning extent learns its metadata and stays
/// fixed for the extent's lifetime (structural changes produce new
/// extents, not new ranges). The pin unlinks itself on drop.
#[derive(Debug)]
pub struct NodePin {
    range: Mutex<Option<NodeMeta>>,
    parent: Mutex<Option<Paddr>>,
    link: Mutex<Option<PinLink>>,
}

#[derive(Debug)]
struct PinLink {
    board: Weak<PinBoardInner>,
    key: (u8, u64),
}

impl NodePin {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            range: Mutex::new(None),
            parent: Mutex::new(None),
            link: Mutex::new(None),
        })
    }

    pub fn set_range(&self, meta: NodeMeta) {
        *self.range.lock() = Some(meta);
    }

    #[must_use]
    pub fn range(&self) -> Option<NodeMeta> {
        *self.range.lock()
    }

    pub fn set_parent(&self, parent: Paddr) {
        *self.parent.lock() = Some(parent);
    }

    /// Address of the extent this pin's relative addresses resolve
    /// against (the containing node for logical extents).
    #[must_use]
    pub fn parent(&self) -> Option<Paddr> {
        *self.parent.lock()
    }

    #[must_use]
    pub fn is_linked(&self) -> bool {
        self.link.lock().is_some()
    }

    /// Remove this pin from its board, if linked.
    pub fn unlink(&self) {
        if let Some(link) = self.link.lock().take() {
            if let Some(board) = link.board.upgrade() {
                board.slots.lock().remove(&link.key);
            }
        }
    }
}

impl Drop for NodePin {
    fn drop(&mut self) {
        self.unlink();
    }
}

struct PinSlot {
    end: u64,
    _pin: Weak<NodePin>,
}

struct PinBoardInner {
    // Keyed by (depth, range begin); depth 0 is the logical-extent level.
    slots: Mutex<BTreeMap<(u8, u64), PinSlot>>,
}

/// Per-cache index of linked pins, one namespace per depth.
pub struct PinBoard {
    inner: Arc<PinBoardInner>,
}

impl Default for PinBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl PinBoard {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PinBoardInner {
                slots: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Link `pin` into the board under its current range.
    ///
    /// The range must already be set. Overlapping ranges at the same
    /// depth indicate a bug in the caller and panic.
    pub fn add_pin(&self, pin: &Arc<NodePin>) {
        let meta = pin.range().expect("pin range must be set before linking");
        assert!(!pin.is_linked(), "pin already linked");
        let key = (meta.depth, meta.begin.0);
        let mut slots = self.inner.slots.lock();
        if let Some(((depth, begin), slot)) = slots.range(..=key).next_back() {
            assert!(
                *depth != meta.depth || slot.end <= meta.begin.0,
                "pin overlap at depth {depth}: [{begin:#x}, {:#x}) vs [{:#x}, {:#x})",
                slot.end,
                meta.begin.0,
                meta.end.0,
            );
        }
        if let Some(((depth, begin), _)) = slots
            .range((std::ops::Bound::Excluded(key), std::ops::Bound::Unbounded))
            .next()
        {
            assert!(
                *depth != meta.depth || meta.end.0 <= *begin,
                "pin overlap at depth {depth}: [{:#x}, {:#x}) vs [{begin:#x}, ..)",
                meta.begin.0,
                meta.end.0,
            );
        }
        slots.insert(
            key,
            PinSlot {
                end: meta.end.0,
                _pin: Arc::downgrade(pin),
            },
        );
        *pin.link.lock() = Some(PinLink {
            board: Arc::downgrade(&self.inner),
            key,
        });
        trace!(
            target: "keel::lba::pin",
            event = "pin_linked",
            depth = meta.depth,
            begin = %meta.begin,
            end = %meta.end,
        );
    }

    #[must_use]
    pub fn pin_count(&self) -> usize {
        self.inner.slots.lock().len()
    }

    /// Range of the linked pin covering `laddr` at `depth`, if any.
    #[must_use]
    pub fn pinned_range(&self, depth: u8, laddr: Laddr) -> Option<(Laddr, Laddr)> {
        let slots = self.inner.slots.lock();
        let ((found_depth, begin), slot) = slots.range(..=(depth, laddr.0)).next_back()?;
        if *found_depth == depth && laddr.0 < slot.end {
            Some((Laddr(*begin), Laddr(slot.end)))
        } else {
            None
        }
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

    fn pin_with_range(m: NodeMeta) -> Arc<NodePin> {
        let pin = NodePin::new();
        pin.set_range(m);
        pin
    }

    #[test]
    fn pins_link_and_unlink_on_drop() {
        let board = PinBoard::new();
        let pin = pin_with_range(meta(0, 100, 1));
        board.add_pin(&pin);
        assert!(pin.is_linked());
        assert_eq!(board.pin_count(), 1);
        drop(pin);
        assert_eq!(board.pin_count(), 0);
    }

    #[test]
    fn adjacent_ranges_at_same_depth_are_fine() {
        let board = PinBoard::new();
        let a = pin_with_range(meta(0, 100, 1));
        let b = pin_with_range(meta(100, 200, 1));
        board.add_pin(&a);
        board.add_pin(&b);
        assert_eq!(board.pin_count(), 2);
        assert_eq!(
            board.pinned_range(1, Laddr(150)),
            Some((Laddr(100), Laddr(200)))
        );
    }

    #[test]
    fn same_range_at_different_depths_is_fine() {
        let board = PinBoard::new();
        let a = pin_with_range(meta(0, u64::MAX, 1));
        let b = pin_with_range(meta(0, u64::MAX, 2));
        board.add_pin(&a);
        board.add_pin(&b);
        assert_eq!(board.pin_count(), 2);
    }

    #[test]
    #[should_panic(expected = "pin overlap")]
    fn overlapping_pins_at_same_depth_panic() {
        let board = PinBoard::new();
        let a = pin_with_range(meta(0, 100, 1));
        let b = pin_with_range(meta(50, 150, 1));
        board.add_pin(&a);
        board.add_pin(&b);
    }

    #[test]
    fn unlinked_pin_can_be_relinked() {
        let board = PinBoard::new();
        let pin = pin_with_range(meta(0, 10, 0));
        board.add_pin(&pin);
        pin.unlink();
        assert!(!pin.is_linked());
        board.add_pin(&pin);
        assert!(pin.is_linked());
    }
}
