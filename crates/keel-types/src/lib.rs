#![forbid(unsafe_code)]
//! Address and identifier newtypes for KeelStore.
//!
//! Logical addresses (`Laddr`) key the LBA tree; physical addresses
//! (`Paddr`) locate extents in the log-structured store and may be encoded
//! relative to a commit record or to a parent node until resolved.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed size in bytes of every LBA tree node block.
pub const LBA_BLOCK_SIZE: u32 = 4096;

/// Logical block address: the key space of the LBA tree.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Laddr(pub u64);

impl Laddr {
    /// Left sentinel: pivot of the first entry of every internal node.
    pub const MIN: Self = Self(0);
    /// Exclusive right bound of the whole key space.
    pub const MAX: Self = Self(u64::MAX);

    #[must_use]
    pub fn checked_add(self, delta: u64) -> Option<Self> {
        self.0.checked_add(delta).map(Self)
    }

    /// End address of an extent of `len` bytes mapped at `self`, saturating
    /// at the key-space bound.
    #[must_use]
    pub fn extent_end(self, len: u32) -> Self {
        self.checked_add(u64::from(len)).unwrap_or(Self::MAX)
    }
}

impl fmt::Display for Laddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::MAX {
            write!(f, "L_ADDR_MAX")
        } else {
            write!(f, "{:#x}", self.0)
        }
    }
}

/// Physical address of an extent.
///
/// `Absolute` addresses are final, committed locations. `RecordRelative`
/// addresses are offsets within the owning transaction's commit record,
/// assigned at allocation and resolved when the record is laid out.
/// `BlockRelative` addresses are offsets against the containing node's own
/// address and are produced when a node is rewritten; they must be passed
/// through [`Paddr::maybe_relative_to`] before use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Paddr {
    Absolute(u64),
    RecordRelative(i64),
    BlockRelative(i64),
}

impl Paddr {
    #[must_use]
    pub fn is_absolute(self) -> bool {
        matches!(self, Self::Absolute(_))
    }

    #[must_use]
    pub fn is_relative(self) -> bool {
        !self.is_absolute()
    }

    #[must_use]
    pub fn is_record_relative(self) -> bool {
        matches!(self, Self::RecordRelative(_))
    }

    #[must_use]
    pub fn is_block_relative(self) -> bool {
        matches!(self, Self::BlockRelative(_))
    }

    /// Shift this address by `delta` bytes, keeping the encoding.
    #[must_use]
    pub fn add_offset(self, delta: i64) -> Self {
        match self {
            Self::Absolute(a) => {
                let shifted = i64::try_from(a).expect("absolute paddr fits i64") + delta;
                debug_assert!(shifted >= 0, "absolute paddr underflow");
                Self::Absolute(shifted.unsigned_abs())
            }
            Self::RecordRelative(off) => Self::RecordRelative(off + delta),
            Self::BlockRelative(off) => Self::BlockRelative(off + delta),
        }
    }

    /// Resolve a block-relative address against the containing node's
    /// address `base`; absolute and record-relative addresses pass through.
    #[must_use]
    pub fn maybe_relative_to(self, base: Self) -> Self {
        match self {
            Self::BlockRelative(off) => base.add_offset(off),
            _ => self,
        }
    }

    /// Re-encode an in-record address as block-relative against `base`,
    /// another address in the same record.
    #[must_use]
    pub fn block_relative_to(self, base: Self) -> Self {
        match (self, base) {
            (Self::RecordRelative(off), Self::RecordRelative(b)) => Self::BlockRelative(off - b),
            _ => panic!("block_relative_to requires two record-relative addresses"),
        }
    }

    /// Materialize a record-relative address once the record's base is
    /// known; other encodings pass through.
    #[must_use]
    pub fn resolved_at(self, record_base: u64) -> Self {
        match self {
            Self::RecordRelative(off) => {
                let abs = i64::try_from(record_base).expect("record base fits i64") + off;
                debug_assert!(abs >= 0, "record-relative paddr resolves below zero");
                Self::Absolute(abs.unsigned_abs())
            }
            _ => self,
        }
    }
}

impl fmt::Display for Paddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absolute(a) => write!(f, "paddr({a:#x})"),
            Self::RecordRelative(off) => write!(f, "paddr(rec{off:+#x})"),
            Self::BlockRelative(off) => write!(f, "paddr(blk{off:+#x})"),
        }
    }
}

/// Transaction identifier, unique per cache instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

/// Monotonic commit sequence number; doubles as the snapshot horizon.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct CommitSeq(pub u64);
