//! Global limits and thresholds.

/// Maximum key length in bytes, applied to dkeys and akeys alike.
pub const MAX_KEY_LEN: usize = 4096;

/// Payloads at or below this size stay PM-resident; larger ones go to the
/// NVMe blob.
pub const INLINE_PAYLOAD_MAX: usize = 4096;

/// Default capacity of the per-xstream object handle cache.
pub const OBJ_CACHE_CAPACITY: usize = 512;

/// Fan-out of a key-btree node: split when a node reaches `2 * BTR_ORDER`
/// entries.
pub const BTR_ORDER: usize = 8;

/// Maximum descent depth of a key btree. Bounds the iterator stack.
pub const BTR_MAX_DEPTH: usize = 20;

/// Block size of the NVMe blob.
pub const BLOB_BLOCK_SIZE: u32 = 4096;

/// Reserved header blocks at the front of the NVMe blob.
pub const BLOB_HDR_BLOCKS: u32 = 1;
