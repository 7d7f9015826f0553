//! In-memory transactional extent cache.
//!
//! The committed store keeps the latest version of every extent, keyed by
//! physical address. Transactions snapshot the commit sequence at begin,
//! collect pending extents (new allocations and copy-on-write
//! duplicates) privately, and publish them at commit as one contiguous
//! record. Allocation hands out record-relative addresses; the record
//! base assigned at commit makes them absolute, which is also what lets
//! block-relative child addresses written by node rewrite survive commit
//! arithmetically.
//!
//! Conflict detection is optimistic: any extent in the transaction's
//! read, write, or retired footprint that was superseded or removed
//! since the snapshot aborts the commit with [`CommitError::Conflict`];
//! the caller retries against a fresh snapshot. Abandoning a transaction
//! (dropping it uncommitted) discards its pending extents.

use crate::node::{ExtentState, NodeExtent, NodeMeta, NodeRef, NodeVal};
use crate::pin::{NodePin, PinBoard};
use keel_error::{KeelError, Result};
use keel_types::{CommitSeq, Laddr, Paddr, TxnId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// Per-transaction LBA tree statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub depth: u8,
}

/// Commit failure surfaced to the caller.
#[derive(Debug, Error)]
pub enum CommitError {
    #[error("transaction {0:?} lost a write-write race; retry against a fresh snapshot")]
    Conflict(TxnId),
}

/// Outcome of a successful commit: the sequence number and the record
/// base against which the transaction's record-relative addresses (the
/// root handle included) resolve.
#[derive(Debug, Clone, Copy)]
pub struct CommitRecord {
    pub seq: CommitSeq,
    pub record_base: u64,
}

impl CommitRecord {
    #[must_use]
    pub fn resolve(&self, paddr: Paddr) -> Paddr {
        paddr.resolved_at(self.record_base)
    }
}

/// A client-data extent as the cache sees it: the mapped logical
/// address, physical location, and length, plus the pin installed when
/// the extent is found live.
pub struct LogicalExtent {
    laddr: Laddr,
    paddr: Paddr,
    len: u32,
    pin: Mutex<Option<Arc<NodePin>>>,
}

impl LogicalExtent {
    #[must_use]
    pub fn new(laddr: Laddr, paddr: Paddr, len: u32) -> Arc<Self> {
        Arc::new(Self {
            laddr,
            paddr,
            len,
            pin: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn laddr(&self) -> Laddr {
        self.laddr
    }

    #[must_use]
    pub fn paddr(&self) -> Paddr {
        self.paddr
    }

    #[must_use]
    pub fn length(&self) -> u32 {
        self.len
    }

    pub(crate) fn set_pin(&self, pin: Arc<NodePin>) {
        *self.pin.lock() = Some(pin);
    }

    #[must_use]
    pub fn pin(&self) -> Option<Arc<NodePin>> {
        self.pin.lock().clone()
    }
}

impl fmt::Debug for LogicalExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalExtent")
            .field("laddr", &self.laddr)
            .field("paddr", &self.paddr)
            .field("len", &self.len)
            .finish()
    }
}

/// Any extent kind the cache can hold.
#[derive(Clone)]
pub enum CachedExtent {
    Internal(NodeRef<Paddr>),
    Leaf(NodeRef<crate::node::LbaMapVal>),
    Logical(Arc<LogicalExtent>),
}

impl CachedExtent {
    #[must_use]
    pub fn paddr(&self) -> Paddr {
        match self {
            Self::Internal(n) => n.paddr(),
            Self::Leaf(n) => n.paddr(),
            Self::Logical(e) => e.paddr(),
        }
    }

    #[must_use]
    pub fn length(&self) -> u32 {
        match self {
            Self::Internal(n) => n.length(),
            Self::Leaf(n) => n.length(),
            Self::Logical(e) => e.length(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Internal(_) => "internal",
            Self::Leaf(_) => "leaf",
            Self::Logical(_) => "logical",
        }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        match self {
            Self::Internal(n) => n.is_pending(),
            Self::Leaf(n) => n.is_pending(),
            Self::Logical(_) => false,
        }
    }

    /// Identity comparison: do both handles refer to the same cached
    /// object?
    #[must_use]
    pub fn same_extent(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Internal(a), Self::Internal(b)) => Arc::ptr_eq(a, b),
            (Self::Leaf(a), Self::Leaf(b)) => Arc::ptr_eq(a, b),
            (Self::Logical(a), Self::Logical(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    fn pin(&self) -> Option<Arc<NodePin>> {
        match self {
            Self::Internal(n) => Some(n.pin().clone()),
            Self::Leaf(n) => Some(n.pin().clone()),
            Self::Logical(e) => e.pin(),
        }
    }

    fn set_state(&self, state: ExtentState) {
        match self {
            Self::Internal(n) => n.set_state(state),
            Self::Leaf(n) => n.set_state(state),
            Self::Logical(_) => {}
        }
    }

    fn install_at(&self, record_base: u64) {
        let own_final = self.paddr().resolved_at(record_base);
        let resolve = move |p: Paddr| p.maybe_relative_to(own_final).resolved_at(record_base);
        match self {
            Self::Internal(n) => {
                n.with_data_mut(|d| d.resolve_addrs(&resolve));
                n.set_paddr(own_final);
                n.pin().set_parent(own_final);
            }
            Self::Leaf(n) => {
                n.with_data_mut(|d| d.resolve_addrs(&resolve));
                n.set_paddr(own_final);
                n.pin().set_parent(own_final);
            }
            Self::Logical(_) => {}
        }
        self.set_state(ExtentState::Clean);
    }
}

impl fmt::Debug for CachedExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal(n) => n.fmt(f),
            Self::Leaf(n) => n.fmt(f),
            Self::Logical(e) => e.fmt(f),
        }
    }
}

impl From<NodeRef<Paddr>> for CachedExtent {
    fn from(node: NodeRef<Paddr>) -> Self {
        Self::Internal(node)
    }
}

impl From<NodeRef<crate::node::LbaMapVal>> for CachedExtent {
    fn from(node: NodeRef<crate::node::LbaMapVal>) -> Self {
        Self::Leaf(node)
    }
}

impl From<Arc<LogicalExtent>> for CachedExtent {
    fn from(extent: Arc<LogicalExtent>) -> Self {
        Self::Logical(extent)
    }
}

/// One shard-local transaction: a snapshot plus a private footprint.
pub struct Transaction {
    id: TxnId,
    snapshot: CommitSeq,
    next_record_off: Mutex<i64>,
    pending: Mutex<HashMap<Paddr, CachedExtent>>,
    reads: Mutex<BTreeSet<Paddr>>,
    retired: Mutex<Vec<CachedExtent>>,
    stats: Mutex<TreeStats>,
}

impl Transaction {
    #[must_use]
    pub fn id(&self) -> TxnId {
        self.id
    }

    #[must_use]
    pub fn snapshot(&self) -> CommitSeq {
        self.snapshot
    }

    #[must_use]
    pub fn tree_stats(&self) -> TreeStats {
        *self.stats.lock()
    }

    pub fn set_tree_depth(&self, depth: u8) {
        self.stats.lock().depth = depth;
    }

    fn bump_record(&self, len: u32) -> i64 {
        let mut off = self.next_record_off.lock();
        let assigned = *off;
        *off += i64::from(len);
        assigned
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("snapshot", &self.snapshot)
            .finish()
    }
}

struct CommittedSlot {
    extent: CachedExtent,
    last_commit: CommitSeq,
}

struct CacheInner {
    next_txn: u64,
    next_commit: u64,
    next_block: u64,
    committed: BTreeMap<Paddr, CommittedSlot>,
}

/// The shard-local extent cache: committed extents plus the allocator
/// of physical addresses and commit sequence numbers.
pub struct ExtentCache {
    inner: Mutex<CacheInner>,
}

impl Default for ExtentCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtentCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                next_txn: 1,
                next_commit: 1,
                // Address zero is left unmapped so a zero paddr always
                // means a bug.
                next_block: u64::from(keel_types::LBA_BLOCK_SIZE),
                committed: BTreeMap::new(),
            }),
        }
    }

    pub fn begin(&self) -> Transaction {
        let mut inner = self.inner.lock();
        let id = TxnId(inner.next_txn);
        inner.next_txn += 1;
        let snapshot = CommitSeq(inner.next_commit - 1);
        trace!(
            target: "keel::lba::cache",
            event = "txn_begin",
            txn = id.0,
            snapshot = snapshot.0,
        );
        Transaction {
            id,
            snapshot,
            next_record_off: Mutex::new(0),
            pending: Mutex::new(HashMap::new()),
            reads: Mutex::new(BTreeSet::new()),
            retired: Mutex::new(Vec::new()),
            stats: Mutex::new(TreeStats::default()),
        }
    }

    /// Allocate a fresh pending node extent at the next record-relative
    /// address.
    pub fn alloc_new_extent<V: NodeVal>(&self, t: &Transaction, meta: NodeMeta) -> NodeRef<V> {
        let off = t.bump_record(keel_types::LBA_BLOCK_SIZE);
        let paddr = Paddr::RecordRelative(off);
        let node = NodeExtent::<V>::new_pending(paddr, meta);
        t.pending.lock().insert(paddr, V::wrap_extent(node.clone()));
        trace!(
            target: "keel::lba::cache",
            event = "alloc_extent",
            txn = t.id.0,
            kind = V::KIND,
            paddr = %paddr,
            meta = %meta,
        );
        node
    }

    /// Read an extent. The address must already be resolved (no
    /// block-relative encodings). The transaction's own writes shadow
    /// the committed store; committed reads join the conflict footprint.
    pub fn get_extent(&self, t: &Transaction, paddr: Paddr) -> Result<CachedExtent> {
        if let Some(extent) = t.pending.lock().get(&paddr) {
            return Ok(extent.clone());
        }
        let inner = self.inner.lock();
        match inner.committed.get(&paddr) {
            Some(slot) => {
                t.reads.lock().insert(paddr);
                Ok(slot.extent.clone())
            }
            None => Err(KeelError::ExtentNotFound(paddr)),
        }
    }

    /// Copy-on-write: hand back a mutable version of `node` owned by
    /// this transaction. Pending nodes pass through unchanged.
    pub fn duplicate_for_write<V: NodeVal>(&self, t: &Transaction, node: &NodeRef<V>) -> NodeRef<V> {
        if node.is_pending() {
            return node.clone();
        }
        let dup = node.duplicate();
        t.pending
            .lock()
            .insert(dup.paddr(), V::wrap_extent(dup.clone()));
        debug!(
            target: "keel::lba::cache",
            event = "duplicate_for_write",
            txn = t.id.0,
            kind = V::KIND,
            paddr = %dup.paddr(),
        );
        dup
    }

    /// Retire an extent this transaction has replaced. Pending extents
    /// vanish from the write set; committed ones are removed at commit.
    pub fn retire_extent(&self, t: &Transaction, extent: CachedExtent) {
        extent.set_state(ExtentState::Retired);
        let paddr = extent.paddr();
        let was_pending = {
            let mut pending = t.pending.lock();
            match pending.get(&paddr) {
                Some(existing) if existing.same_extent(&extent) => {
                    pending.remove(&paddr);
                    true
                }
                _ => false,
            }
        };
        trace!(
            target: "keel::lba::cache",
            event = "retire_extent",
            txn = t.id.0,
            kind = extent.kind(),
            paddr = %paddr,
            was_pending,
        );
        // A duplicate carries the committed original's address: retiring
        // it must also retire the original underneath.
        if paddr.is_absolute() {
            t.retired.lock().push(extent);
        }
    }

    /// Immediately drop a not-live extent discovered by liveness init.
    pub fn drop_from_cache(&self, extent: &CachedExtent) {
        if let Some(pin) = extent.pin() {
            pin.unlink();
        }
        let mut inner = self.inner.lock();
        let remove = match inner.committed.get(&extent.paddr()) {
            Some(slot) => slot.extent.same_extent(extent),
            None => false,
        };
        if remove {
            inner.committed.remove(&extent.paddr());
        }
        debug!(
            target: "keel::lba::cache",
            event = "drop_from_cache",
            kind = extent.kind(),
            paddr = %extent.paddr(),
            removed = remove,
        );
    }

    /// Publish a transaction. On success the pending extents become the
    /// committed versions (laid out as one contiguous record) and the
    /// retired ones disappear; on conflict nothing changes and the
    /// caller retries.
    pub fn commit(&self, t: Transaction, pins: &PinBoard) -> std::result::Result<CommitRecord, CommitError> {
        let mut inner = self.inner.lock();
        let pending = {
            let mut entries: Vec<(Paddr, CachedExtent)> =
                t.pending.lock().drain().collect();
            entries.sort_by_key(|(paddr, _)| *paddr);
            entries
        };
        let retired = std::mem::take(&mut *t.retired.lock());
        let reads = std::mem::take(&mut *t.reads.lock());

        // Conflict check over the whole footprint: reads, overwrites of
        // committed extents, and retirements.
        let footprint = reads
            .iter()
            .copied()
            .chain(pending.iter().map(|(p, _)| *p))
            .chain(retired.iter().map(CachedExtent::paddr))
            .filter(|p| p.is_absolute());
        for paddr in footprint {
            let superseded = match inner.committed.get(&paddr) {
                Some(slot) => slot.last_commit > t.snapshot,
                None => true,
            };
            if superseded {
                debug!(
                    target: "keel::lba::cache",
                    event = "commit_conflict",
                    txn = t.id.0,
                    snapshot = t.snapshot.0,
                    paddr = %paddr,
                );
                return Err(CommitError::Conflict(t.id));
            }
        }

        let record_len = u64::try_from(*t.next_record_off.lock()).unwrap_or(0);
        let record_base = inner.next_block;
        inner.next_block += record_len;
        let seq = CommitSeq(inner.next_commit);
        inner.next_commit += 1;

        for extent in &retired {
            let slot = inner.committed.remove(&extent.paddr());
            debug_assert!(slot.is_some(), "retired extent vanished before commit");
            if let Some(slot) = slot {
                if let Some(pin) = slot.extent.pin() {
                    pin.unlink();
                }
                slot.extent.set_state(ExtentState::Retired);
            }
        }

        let installed = pending.len();
        for (_, extent) in pending {
            extent.install_at(record_base);
            let own_final = extent.paddr();
            if let Some(replaced) = inner.committed.insert(
                own_final,
                CommittedSlot {
                    extent: extent.clone(),
                    last_commit: seq,
                },
            ) {
                if let Some(pin) = replaced.extent.pin() {
                    pin.unlink();
                }
                replaced.extent.set_state(ExtentState::Retired);
            }
            if let Some(pin) = extent.pin() {
                if !pin.is_linked() {
                    pins.add_pin(&pin);
                }
            }
        }

        debug!(
            target: "keel::lba::cache",
            event = "txn_commit",
            txn = t.id.0,
            seq = seq.0,
            record_base,
            installed,
            retired = retired.len(),
        );
        Ok(CommitRecord { seq, record_base })
    }
}
