//! Core types for the VERSO versioned object store.
//!
//! Everything here is shared vocabulary between the storage layers: epochs
//! and epoch ranges, object identifiers with their key-class feature bits,
//! extents over record indices, and the two address spaces (PM offsets and
//! block-I/O addresses). Policy lives in the crates above; these types only
//! enforce their own construction invariants.

pub mod config;
pub mod cx;
pub mod fault;
pub mod limits;

pub use config::{BdevClass, ConfigError, InstanceConfig, ScmClass};
pub use cx::{Cancelled, Cx};
pub use fault::{FaultHook, FaultInjector, FaultMode, FaultSite, NoFault};

use std::cmp::Ordering;
use std::fmt;

// ---------------------------------------------------------------------------
// Epochs
// ---------------------------------------------------------------------------

/// Versioning timestamp. Every write carries one; every reader specifies one.
pub type Epoch = u64;

/// Sentinel denoting the unbounded future.
pub const EPOCH_MAX: Epoch = u64::MAX;

/// Inclusive epoch range `[lo, hi]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EpochRange {
    pub lo: Epoch,
    pub hi: Epoch,
}

impl EpochRange {
    /// Create a range, returning `None` when `lo > hi`.
    #[inline]
    pub const fn new(lo: Epoch, hi: Epoch) -> Option<Self> {
        if lo > hi { None } else { Some(Self { lo, hi }) }
    }

    /// The degenerate range `[e, e]` used by point-in-time readers.
    #[inline]
    pub const fn point(e: Epoch) -> Self {
        Self { lo: e, hi: e }
    }

    /// The full range `[0, EPOCH_MAX]`.
    #[inline]
    pub const fn all() -> Self {
        Self {
            lo: 0,
            hi: EPOCH_MAX,
        }
    }

    #[inline]
    pub const fn contains(&self, e: Epoch) -> bool {
        self.lo <= e && e <= self.hi
    }

    #[inline]
    pub const fn is_point(&self) -> bool {
        self.lo == self.hi
    }
}

impl fmt::Display for EpochRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.lo, self.hi)
    }
}

// ---------------------------------------------------------------------------
// Object identifiers and feature bits
// ---------------------------------------------------------------------------

/// Feature flag: dkeys compare as native u64 values.
pub const OF_DKEY_UINT64: u64 = 1 << 48;
/// Feature flag: dkeys compare lexicographically over fixed-width bytes.
pub const OF_DKEY_LEXICAL: u64 = 1 << 49;
/// Feature flag: akeys compare as native u64 values.
pub const OF_AKEY_UINT64: u64 = 1 << 50;
/// Feature flag: akeys compare lexicographically over fixed-width bytes.
pub const OF_AKEY_LEXICAL: u64 = 1 << 51;

const OF_MASK: u64 = OF_DKEY_UINT64 | OF_DKEY_LEXICAL | OF_AKEY_UINT64 | OF_AKEY_LEXICAL;

/// 128-bit object identifier. The upper word carries the key-class feature
/// bits; the rest is opaque to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    pub hi: u64,
    pub lo: u64,
}

/// Error returned when an object id carries conflicting feature bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictingFeatureBits;

impl fmt::Display for ConflictingFeatureBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UINT64 and LEXICAL feature bits are mutually exclusive")
    }
}

impl std::error::Error for ConflictingFeatureBits {}

impl ObjectId {
    #[inline]
    pub const fn new(hi: u64, lo: u64) -> Self {
        Self { hi, lo }
    }

    /// Attach feature bits to the upper word.
    #[inline]
    #[must_use]
    pub const fn with_features(self, feats: u64) -> Self {
        Self {
            hi: self.hi | (feats & OF_MASK),
            lo: self.lo,
        }
    }

    #[inline]
    pub const fn features(&self) -> u64 {
        self.hi & OF_MASK
    }

    /// Key class used for this object's dkeys.
    pub fn dkey_class(&self) -> Result<KeyClass, ConflictingFeatureBits> {
        class_from_bits(
            self.hi & OF_DKEY_UINT64 != 0,
            self.hi & OF_DKEY_LEXICAL != 0,
        )
    }

    /// Key class used for this object's akeys.
    pub fn akey_class(&self) -> Result<KeyClass, ConflictingFeatureBits> {
        class_from_bits(
            self.hi & OF_AKEY_UINT64 != 0,
            self.hi & OF_AKEY_LEXICAL != 0,
        )
    }

    /// Big-endian 16-byte form used as the object-index key, so that the
    /// index iterates objects in numeric `(hi, lo)` order.
    #[inline]
    pub fn to_key_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.hi.to_be_bytes());
        out[8..].copy_from_slice(&self.lo.to_be_bytes());
        out
    }
}

fn class_from_bits(uint64: bool, lexical: bool) -> Result<KeyClass, ConflictingFeatureBits> {
    match (uint64, lexical) {
        (true, true) => Err(ConflictingFeatureBits),
        (true, false) => Ok(KeyClass::Uint64),
        (false, true) => Ok(KeyClass::Lexical64),
        (false, false) => Ok(KeyClass::Opaque),
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}.{:016x}", self.hi, self.lo)
    }
}

// ---------------------------------------------------------------------------
// Key classes
// ---------------------------------------------------------------------------

/// Comparator class for a key dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum KeyClass {
    /// Arbitrary bytes, compared lexicographically.
    Opaque,
    /// Exactly eight bytes holding a native-endian u64, compared numerically.
    Uint64,
    /// Exactly eight bytes, compared lexicographically.
    Lexical64,
}

impl KeyClass {
    /// Validate a key against this class and the global length limits.
    pub fn validate(&self, key: &[u8]) -> Result<(), KeyError> {
        if key.is_empty() {
            return Err(KeyError::Empty);
        }
        if key.len() > limits::MAX_KEY_LEN {
            return Err(KeyError::TooLong { len: key.len() });
        }
        match self {
            Self::Opaque => Ok(()),
            Self::Uint64 | Self::Lexical64 => {
                if key.len() == 8 {
                    Ok(())
                } else {
                    Err(KeyError::BadWidth { len: key.len() })
                }
            }
        }
    }

    /// Total order over validated keys of this class.
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            Self::Opaque | Self::Lexical64 => a.cmp(b),
            Self::Uint64 => {
                debug_assert!(a.len() == 8 && b.len() == 8);
                let ka = u64::from_le_bytes(a.try_into().unwrap_or([0; 8]));
                let kb = u64::from_le_bytes(b.try_into().unwrap_or([0; 8]));
                ka.cmp(&kb)
            }
        }
    }
}

/// Key validation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyError {
    /// Zero-length keys are rejected everywhere.
    Empty,
    /// Longer than [`limits::MAX_KEY_LEN`].
    TooLong { len: usize },
    /// Fixed-width class given a key that is not eight bytes.
    BadWidth { len: usize },
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("zero-length key"),
            Self::TooLong { len } => {
                write!(f, "key length {len} exceeds {}", limits::MAX_KEY_LEN)
            }
            Self::BadWidth { len } => {
                write!(f, "fixed-width key class requires 8 bytes, got {len}")
            }
        }
    }
}

impl std::error::Error for KeyError {}

// ---------------------------------------------------------------------------
// Extents
// ---------------------------------------------------------------------------

/// Closed interval `[lo, hi]` over record indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent {
    lo: u64,
    hi: u64,
}

impl Extent {
    /// Create an extent; `None` when `lo > hi`.
    #[inline]
    pub const fn new(lo: u64, hi: u64) -> Option<Self> {
        if lo > hi { None } else { Some(Self { lo, hi }) }
    }

    #[inline]
    pub const fn lo(&self) -> u64 {
        self.lo
    }

    #[inline]
    pub const fn hi(&self) -> u64 {
        self.hi
    }

    /// Number of records covered. Saturates at `u64::MAX` for the full range.
    #[inline]
    pub const fn width(&self) -> u64 {
        (self.hi - self.lo).saturating_add(1)
    }

    #[inline]
    pub const fn overlaps(&self, other: &Extent) -> bool {
        self.lo <= other.hi && other.lo <= self.hi
    }

    #[inline]
    pub const fn contains(&self, pos: u64) -> bool {
        self.lo <= pos && pos <= self.hi
    }

    /// Intersection with `other`, if any.
    pub fn intersect(&self, other: &Extent) -> Option<Extent> {
        Extent::new(self.lo.max(other.lo), self.hi.min(other.hi))
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.lo, self.hi)
    }
}

/// Caller-facing record extent: an index and a record count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Recx {
    pub idx: u64,
    pub nr: u64,
}

/// Error converting a [`Recx`] to an [`Extent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecxError {
    /// Zero-record extents carry no information.
    ZeroWidth,
    /// `idx + nr - 1` exceeds the index space.
    IndexOverflow,
}

impl fmt::Display for RecxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroWidth => f.write_str("zero-width record extent"),
            Self::IndexOverflow => f.write_str("record extent overflows the index space"),
        }
    }
}

impl std::error::Error for RecxError {}

impl Recx {
    #[inline]
    pub const fn new(idx: u64, nr: u64) -> Self {
        Self { idx, nr }
    }

    /// Convert to the closed-interval form used by the extent tree.
    pub fn to_extent(&self) -> Result<Extent, RecxError> {
        if self.nr == 0 {
            return Err(RecxError::ZeroWidth);
        }
        let hi = self
            .idx
            .checked_add(self.nr - 1)
            .ok_or(RecxError::IndexOverflow)?;
        Ok(Extent { lo: self.idx, hi })
    }
}

impl From<Extent> for Recx {
    fn from(ext: Extent) -> Self {
        Self {
            idx: ext.lo,
            nr: ext.width(),
        }
    }
}

// ---------------------------------------------------------------------------
// Addresses
// ---------------------------------------------------------------------------

/// Opaque offset into the PM arena.
///
/// The same structure is read as an offset when persisted and resolved to a
/// live reference through the pool; the two views never mix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct PmAddr(u64);

impl PmAddr {
    /// The null address. Slot zero is never handed out.
    pub const NULL: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(&self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for PmAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pm:{:#x}", self.0)
    }
}

/// Which medium a record payload lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    /// Storage-class memory: the payload is PM-resident and directly
    /// addressable.
    Scm,
    /// NVMe blob: the payload is staged through DMA buffers.
    Nvme,
}

/// Tagged payload address: a medium, an offset within it, and a hole bit.
///
/// A hole address never reaches the device; readers of a hole receive
/// zero-filled buffers synthesized by the I/O layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BioAddr {
    pub media: MediaType,
    pub off: u64,
    hole: bool,
}

impl BioAddr {
    #[inline]
    pub const fn new(media: MediaType, off: u64) -> Self {
        Self {
            media,
            off,
            hole: false,
        }
    }

    /// A hole: no backing storage, reads yield zeros.
    #[inline]
    pub const fn hole() -> Self {
        Self {
            media: MediaType::Scm,
            off: 0,
            hole: true,
        }
    }

    #[inline]
    pub const fn is_hole(&self) -> bool {
        self.hole
    }
}

impl fmt::Display for BioAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hole {
            return f.write_str("hole");
        }
        match self.media {
            MediaType::Scm => write!(f, "scm:{:#x}", self.off),
            MediaType::Nvme => write!(f, "nvme:{:#x}", self.off),
        }
    }
}

// ---------------------------------------------------------------------------
// DTX seam
// ---------------------------------------------------------------------------

/// Identifier of a distributed transaction, opaque to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct DtxId(pub u64);

/// Reader/writer intent supplied by the DTX layer on lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Intent {
    /// Plain read: uncommitted entries block the reader.
    #[default]
    Default,
    /// Probing on behalf of an update.
    Update,
    /// Probing on behalf of a punch.
    Punch,
}

/// Resolution state of a distributed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DtxState {
    Committed,
    Prepared,
    Aborted,
}

/// Commit-state oracle supplied by the DTX layer.
///
/// The store never retries through this seam; an unresolved entry surfaces
/// as `InProgress` and the coordinator decides.
pub trait DtxResolver {
    fn state(&self, id: DtxId) -> DtxState;
}

/// Default resolver for standalone operation: everything is committed.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllCommitted;

impl DtxResolver for AllCommitted {
    fn state(&self, _id: DtxId) -> DtxState {
        DtxState::Committed
    }
}
