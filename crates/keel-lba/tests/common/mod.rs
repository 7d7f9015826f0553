#![allow(dead_code)]
//! Shared harness for the LBA tree integration suites: an in-memory
//! cache plus root handle, with one-transaction-per-call helpers and a
//! whole-tree invariant checker.

use keel_lba::{
    CachedExtent, ExtentCache, LbaBtree, LbaMapVal, LbaRoot, OpContext, PinBoard,
    INTERNAL_NODE_CAPACITY, LEAF_NODE_CAPACITY,
};
use keel_types::{Laddr, Paddr};

pub struct Harness {
    pub cache: ExtentCache,
    pub pins: PinBoard,
    pub root: LbaRoot,
}

impl Harness {
    pub fn mkfs() -> Self {
        let cache = ExtentCache::new();
        let pins = PinBoard::new();
        let trans = cache.begin();
        let mut root = LbaBtree::mkfs(OpContext {
            trans: &trans,
            cache: &cache,
            pins: &pins,
        });
        let record = cache.commit(trans, &pins).expect("mkfs commit");
        root.after_commit(&record);
        Self { cache, pins, root }
    }

    /// Run `f` in one transaction, commit it, and adopt the new root.
    pub fn mutate<R>(&mut self, f: impl FnOnce(OpContext<'_>, &mut LbaBtree) -> R) -> R {
        let trans = self.cache.begin();
        let mut tree = LbaBtree::new(self.root);
        let out = f(
            OpContext {
                trans: &trans,
                cache: &self.cache,
                pins: &self.pins,
            },
            &mut tree,
        );
        let record = self.cache.commit(trans, &self.pins).expect("commit");
        let mut root = tree.root();
        root.after_commit(&record);
        self.root = root;
        out
    }

    /// Run `f` read-only; the transaction is abandoned afterwards.
    pub fn read<R>(&self, f: impl FnOnce(OpContext<'_>, &LbaBtree) -> R) -> R {
        let trans = self.cache.begin();
        let tree = LbaBtree::new(self.root);
        f(
            OpContext {
                trans: &trans,
                cache: &self.cache,
                pins: &self.pins,
            },
            &tree,
        )
    }

    pub fn insert(&mut self, key: u64, val: LbaMapVal) -> bool {
        self.mutate(|c, tree| {
            let cur = tree.lower_bound(c, Laddr(key), None).expect("lower_bound");
            tree.insert(c, cur, Laddr(key), val).expect("insert").1
        })
    }

    pub fn update(&mut self, key: u64, val: LbaMapVal) {
        self.mutate(|c, tree| {
            let cur = tree.lower_bound(c, Laddr(key), None).expect("lower_bound");
            assert!(!cur.is_end() && cur.get_key() == Laddr(key));
            tree.update(c, cur, val).expect("update");
        });
    }

    pub fn remove(&mut self, key: u64) {
        self.mutate(|c, tree| {
            let cur = tree.lower_bound(c, Laddr(key), None).expect("lower_bound");
            assert!(
                !cur.is_end() && cur.get_key() == Laddr(key),
                "removing a missing key {key:#x}"
            );
            tree.remove(c, cur).expect("remove");
        });
    }

    pub fn get(&self, key: u64) -> Option<LbaMapVal> {
        self.read(|c, tree| {
            let cur = tree.lower_bound(c, Laddr(key), None).expect("lower_bound");
            (!cur.is_end() && cur.get_key() == Laddr(key)).then(|| cur.get_val())
        })
    }

    /// All entries front to back via cursor walking.
    pub fn walk(&self) -> Vec<(u64, LbaMapVal)> {
        self.read(|c, tree| {
            let mut out = Vec::new();
            let mut cur = tree.lower_bound(c, Laddr::MIN, None).expect("lower_bound");
            while !cur.is_end() {
                out.push((cur.get_key().0, cur.get_val()));
                cur = cur.next(c, None).expect("next");
            }
            out
        })
    }

    pub fn keys(&self) -> Vec<u64> {
        self.walk().into_iter().map(|(k, _)| k).collect()
    }

    pub fn depth(&self) -> u8 {
        self.root.depth()
    }

    /// Verify the structural invariants of the whole committed tree:
    /// parent pivots equal child range starts, ranges tile the key
    /// space, leaf keys are strictly sorted, and every non-root node is
    /// at or above minimum capacity.
    pub fn check_invariants(&self) {
        self.read(|c, _| {
            check_node(
                c,
                self.root.location(),
                self.root.depth(),
                Laddr::MIN,
                Laddr::MAX,
                true,
            );
        });
    }
}

fn check_node(c: OpContext<'_>, addr: Paddr, depth: u8, begin: Laddr, end: Laddr, is_root: bool) {
    let extent = c.cache.get_extent(c.trans, addr).expect("node reachable");
    match extent {
        CachedExtent::Leaf(node) => {
            assert_eq!(depth, 1, "leaf found above depth 1");
            let meta = node.meta();
            assert_eq!(meta.depth, 1);
            assert_eq!(meta.begin, begin);
            assert_eq!(meta.end, end);
            node.with_data(|d| {
                for i in 0..d.len() {
                    assert!(meta.is_in_range(d.key_at(i)));
                    if i > 0 {
                        assert!(d.key_at(i - 1) < d.key_at(i), "leaf keys out of order");
                    }
                }
                if !is_root {
                    assert!(
                        d.len() >= LEAF_NODE_CAPACITY / 2,
                        "non-root leaf below minimum capacity: {}",
                        d.len()
                    );
                }
            });
        }
        CachedExtent::Internal(node) => {
            assert!(depth >= 2, "internal node at leaf depth");
            let meta = node.meta();
            assert_eq!(meta.depth, depth);
            assert_eq!(meta.begin, begin);
            assert_eq!(meta.end, end);
            let entries: Vec<(Laddr, Paddr)> = node.with_data(|d| {
                assert!(!d.is_empty());
                if is_root {
                    assert!(d.len() >= 2, "single-entry root escaped collapse");
                } else {
                    assert!(
                        d.len() >= INTERNAL_NODE_CAPACITY / 2,
                        "non-root internal node below minimum capacity: {}",
                        d.len()
                    );
                }
                assert_eq!(d.key_at(0), meta.begin, "first pivot must open the range");
                (0..d.len()).map(|i| (d.key_at(i), d.val_at(i))).collect()
            });
            for (i, (child_begin, child_addr)) in entries.iter().enumerate() {
                let child_end = entries.get(i + 1).map_or(meta.end, |(k, _)| *k);
                check_node(
                    c,
                    child_addr.maybe_relative_to(node.paddr()),
                    depth - 1,
                    *child_begin,
                    child_end,
                    false,
                );
            }
        }
        CachedExtent::Logical(_) => panic!("logical extent on the node path"),
    }
}

pub fn val(tag: u64) -> LbaMapVal {
    LbaMapVal::new(Paddr::Absolute(0x4000_0000 + tag * 0x1000), 0x1000)
}
