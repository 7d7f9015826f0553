//! Extent lifecycle: liveness checks after cache reads, node rewrite
//! for compaction, and snapshot isolation across transactions.

mod common;

use common::{val, Harness};
use keel_lba::{CachedExtent, CommitError, LbaBtree, LogicalExtent, OpContext};
use keel_types::{Laddr, Paddr};

#[test]
fn live_logical_extent_is_initialized_and_pinned() {
    let mut h = Harness::mkfs();
    let mapping = val(7);
    h.insert(100, mapping);
    let outcome = h.read(|c, tree| {
        let extent = LogicalExtent::new(Laddr(100), mapping.paddr, mapping.len);
        tree.init_cached_extent(c, CachedExtent::Logical(extent.clone()))
            .expect("init")
            .map(|_| extent)
    });
    let extent = outcome.expect("extent is live");
    assert!(extent.pin().expect("pin installed").is_linked());
    assert_eq!(
        h.pins.pinned_range(0, Laddr(100)),
        Some((Laddr(100), Laddr(100 + u64::from(mapping.len))))
    );
}

#[test]
fn stale_logical_extent_is_dropped() {
    let mut h = Harness::mkfs();
    h.insert(100, val(7));
    // Wrong physical address: a superseded version of the extent.
    let stale = h.read(|c, tree| {
        let extent = LogicalExtent::new(Laddr(100), Paddr::Absolute(0xdead_b000), 0x1000);
        tree.init_cached_extent(c, CachedExtent::Logical(extent))
            .expect("init")
    });
    assert!(stale.is_none());
    // Unmapped address entirely.
    let unmapped = h.read(|c, tree| {
        let extent = LogicalExtent::new(Laddr(999), val(1).paddr, 0x1000);
        tree.init_cached_extent(c, CachedExtent::Logical(extent))
            .expect("init")
    });
    assert!(unmapped.is_none());
}

#[test]
fn live_leaf_and_internal_nodes_pass_liveness_init() {
    let mut h = Harness::mkfs();
    h.mutate(|c, tree| {
        for k in 0..400u64 {
            let cur = tree.lower_bound(c, Laddr(k), None).expect("lower_bound");
            tree.insert(c, cur, Laddr(k), val(k)).expect("insert");
        }
    });
    assert_eq!(h.depth(), 2);
    h.read(|c, tree| {
        let cur = tree.lower_bound(c, Laddr(200), None).expect("lower_bound");
        let leaf = cur.leaf_node().clone();
        let root = cur.internal_node(2).clone();
        assert!(tree
            .init_cached_extent(c, CachedExtent::Leaf(leaf))
            .expect("init leaf")
            .is_some());
        assert!(tree
            .init_cached_extent(c, CachedExtent::Internal(root))
            .expect("init internal")
            .is_some());
    });
}

#[test]
fn rewriting_a_leaf_repoints_the_parent_and_retires_the_original() {
    let mut h = Harness::mkfs();
    h.mutate(|c, tree| {
        for k in 0..400u64 {
            let cur = tree.lower_bound(c, Laddr(k), None).expect("lower_bound");
            tree.insert(c, cur, Laddr(k), val(k)).expect("insert");
        }
    });
    assert_eq!(h.depth(), 2);

    let (old_paddr, leaf_begin) = h.read(|c, tree| {
        let cur = tree.lower_bound(c, Laddr(200), None).expect("lower_bound");
        (cur.leaf_node().paddr(), cur.leaf_node().meta().begin)
    });

    let stale_leaf = h.mutate(|c, tree| {
        let cur = tree.lower_bound(c, Laddr(200), None).expect("lower_bound");
        let leaf = cur.leaf_node().clone();
        assert_eq!(leaf.paddr(), old_paddr);
        tree.rewrite_lba_extent(c, CachedExtent::Leaf(leaf.clone()))
            .expect("rewrite");
        leaf
    });

    // The mapping still resolves, through a relocated leaf.
    assert_eq!(h.get(200), Some(val(200)));
    h.check_invariants();
    let new_paddr = h.read(|c, tree| {
        let cur = tree.lower_bound(c, Laddr(200), None).expect("lower_bound");
        let new_paddr = cur.leaf_node().paddr();
        assert_ne!(new_paddr, old_paddr);
        // Parent entry for the leaf's range start now holds the new
        // address.
        let parent = cur.internal_node(2);
        parent.with_data(|d| {
            let slot = d.upper_bound(leaf_begin) - 1;
            assert_eq!(d.key_at(slot), leaf_begin);
            assert_eq!(
                d.val_at(slot).maybe_relative_to(parent.paddr()),
                new_paddr
            );
        });
        new_paddr
    });
    assert!(new_paddr.is_absolute());

    // The original extent is gone from the cache ...
    let trans = h.cache.begin();
    assert!(h.cache.get_extent(&trans, old_paddr).is_err());
    // ... and a retained reference to it now fails liveness init.
    let stale = h.read(|c, tree| {
        tree.init_cached_extent(c, CachedExtent::Leaf(stale_leaf.clone()))
            .expect("init")
    });
    assert!(stale.is_none());
}

#[test]
fn rewriting_the_root_updates_the_root_handle() {
    let mut h = Harness::mkfs();
    h.insert(1, val(1));
    let old_root = h.root;
    h.mutate(|c, tree| {
        let cur = tree.lower_bound(c, Laddr(1), None).expect("lower_bound");
        let leaf = cur.leaf_node().clone();
        assert_eq!(leaf.paddr(), old_root.location());
        tree.rewrite_lba_extent(c, CachedExtent::Leaf(leaf))
            .expect("rewrite");
        assert!(tree.is_root_dirty());
    });
    assert_ne!(h.root.location(), old_root.location());
    assert_eq!(h.root.depth(), 1);
    assert_eq!(h.get(1), Some(val(1)));
    h.check_invariants();
}

#[test]
fn rewriting_an_internal_node_keeps_children_reachable() {
    let mut h = Harness::mkfs();
    let mut last = 0u64;
    h.mutate(|c, tree| {
        for k in 0.. {
            let cur = tree.lower_bound(c, Laddr(k * 2), None).expect("lower_bound");
            tree.insert(c, cur, Laddr(k * 2), val(k)).expect("insert");
            last = k * 2;
            if tree.root().depth() == 3 {
                break;
            }
        }
    });
    assert_eq!(h.depth(), 3);
    let old_paddr = h.mutate(|c, tree| {
        let cur = tree.lower_bound(c, Laddr(0), None).expect("lower_bound");
        let node = cur.internal_node(2).clone();
        let old = node.paddr();
        tree.rewrite_lba_extent(c, CachedExtent::Internal(node))
            .expect("rewrite");
        old
    });
    h.check_invariants();
    h.read(|c, tree| {
        let cur = tree.lower_bound(c, Laddr(0), None).expect("lower_bound");
        assert_ne!(cur.internal_node(2).paddr(), old_paddr);
        assert_eq!(cur.get_key(), Laddr(0));
    });
    assert_eq!(h.get(last), Some(val(last / 2)));
}

#[test]
fn snapshot_isolation_conflicts_then_succeeds_on_retry() {
    let mut h = Harness::mkfs();
    h.insert(10, val(10));
    h.insert(20, val(20));

    // Two transactions start from the same snapshot and insert disjoint
    // keys into the same leaf.
    let trans_a = h.cache.begin();
    let trans_b = h.cache.begin();
    let mut tree_a = LbaBtree::new(h.root);
    let mut tree_b = LbaBtree::new(h.root);
    {
        let c = OpContext {
            trans: &trans_a,
            cache: &h.cache,
            pins: &h.pins,
        };
        let cur = tree_a.lower_bound(c, Laddr(11), None).expect("lower_bound");
        let (_, inserted) = tree_a.insert(c, cur, Laddr(11), val(11)).expect("insert");
        assert!(inserted);
    }
    {
        let c = OpContext {
            trans: &trans_b,
            cache: &h.cache,
            pins: &h.pins,
        };
        let cur = tree_b.lower_bound(c, Laddr(12), None).expect("lower_bound");
        let (_, inserted) = tree_b.insert(c, cur, Laddr(12), val(12)).expect("insert");
        assert!(inserted);
    }

    // First committer wins.
    let record_a = h.cache.commit(trans_a, &h.pins).expect("commit a");
    let mut root_a = tree_a.root();
    root_a.after_commit(&record_a);
    h.root = root_a;

    // The second conflicts on the shared leaf and retries on a fresh
    // snapshot, which sees the first writer's key.
    let err = h.cache.commit(trans_b, &h.pins);
    assert!(matches!(err, Err(CommitError::Conflict(_))));

    h.mutate(|c, tree| {
        let cur = tree.lower_bound(c, Laddr(12), None).expect("lower_bound");
        let (_, inserted) = tree.insert(c, cur, Laddr(12), val(12)).expect("insert");
        assert!(inserted);
    });

    assert_eq!(h.keys(), vec![10, 11, 12, 20]);
    h.check_invariants();
}
