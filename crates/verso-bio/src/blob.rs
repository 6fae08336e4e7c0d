//! NVMe blob layout and the per-xstream I/O context.
//!
//! The first reserved blocks of a blob hold a header that bootstraps
//! recovery: it names the pool and blobstore the blob belongs to so a
//! restarted target can match blobs back to pools before trusting any
//! payload data. The header is sealed with xxh3 and re-validated on open.

use tracing::debug;
use uuid::Uuid;
use xxhash_rust::xxh3::xxh3_64;

use verso_error::{Result, VosError};
use verso_types::limits::{BLOB_BLOCK_SIZE, BLOB_HDR_BLOCKS};

use crate::device::BlockDevice;

/// Magic stamped at the front of every blob.
pub const BLOB_MAGIC: u32 = 0xB10B_CAFE;

const HDR_ENCODED_LEN: usize = 4 + 4 + 4 + 4 + 8 + 16 + 16 + 8;

/// Blob bootstrap header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobHeader {
    pub magic: u32,
    pub block_size: u32,
    pub header_blocks: u32,
    pub xstream_id: u32,
    pub blob_id: u64,
    pub blobstore_uuid: Uuid,
    pub pool_uuid: Uuid,
}

impl BlobHeader {
    #[must_use]
    pub fn new(xstream_id: u32, blob_id: u64, blobstore_uuid: Uuid, pool_uuid: Uuid) -> Self {
        Self {
            magic: BLOB_MAGIC,
            block_size: BLOB_BLOCK_SIZE,
            header_blocks: BLOB_HDR_BLOCKS,
            xstream_id,
            blob_id,
            blobstore_uuid,
            pool_uuid,
        }
    }

    /// Serialize into one header block, sealed with xxh3.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HDR_ENCODED_LEN);
        out.extend_from_slice(&self.magic.to_le_bytes());
        out.extend_from_slice(&self.block_size.to_le_bytes());
        out.extend_from_slice(&self.header_blocks.to_le_bytes());
        out.extend_from_slice(&self.xstream_id.to_le_bytes());
        out.extend_from_slice(&self.blob_id.to_le_bytes());
        out.extend_from_slice(self.blobstore_uuid.as_bytes());
        out.extend_from_slice(self.pool_uuid.as_bytes());
        let csum = xxh3_64(&out);
        out.extend_from_slice(&csum.to_le_bytes());
        out.resize(BLOB_BLOCK_SIZE as usize, 0);
        out
    }

    /// Parse and validate a header block.
    pub fn decode(block: &[u8]) -> Result<Self> {
        if block.len() < HDR_ENCODED_LEN {
            return Err(VosError::io_inval("blob header block too short"));
        }
        let body = &block[..HDR_ENCODED_LEN - 8];
        let stored = u64::from_le_bytes(block[HDR_ENCODED_LEN - 8..HDR_ENCODED_LEN].try_into().expect("fixed width"));
        if xxh3_64(body) != stored {
            return Err(VosError::io_inval("blob header checksum mismatch"));
        }
        let magic = u32::from_le_bytes(body[0..4].try_into().expect("fixed width"));
        if magic != BLOB_MAGIC {
            return Err(VosError::io_inval("bad blob magic"));
        }
        Ok(Self {
            magic,
            block_size: u32::from_le_bytes(body[4..8].try_into().expect("fixed width")),
            header_blocks: u32::from_le_bytes(body[8..12].try_into().expect("fixed width")),
            xstream_id: u32::from_le_bytes(body[12..16].try_into().expect("fixed width")),
            blob_id: u64::from_le_bytes(body[16..24].try_into().expect("fixed width")),
            blobstore_uuid: Uuid::from_slice(&body[24..40]).expect("fixed width"),
            pool_uuid: Uuid::from_slice(&body[40..56]).expect("fixed width"),
        })
    }

    /// Byte offset where payload space begins.
    #[must_use]
    pub fn data_start(&self) -> u64 {
        u64::from(self.block_size) * u64::from(self.header_blocks)
    }
}

/// Per-xstream blob I/O context: header access plus payload space
/// management.
///
/// The extent allocator is a bump pointer with a first-fit free list; it is
/// rebuilt empty on open, which is sound here because the PM side (which
/// holds every live `BioAddr`) shares the process lifetime of this context.
#[derive(Debug)]
pub struct IoContext {
    dev: Box<dyn BlockDevice>,
    hdr: BlobHeader,
    next: u64,
    free: Vec<(u64, u64)>,
}

impl IoContext {
    /// Format a fresh blob on `dev` and open a context over it.
    pub fn format(
        mut dev: Box<dyn BlockDevice>,
        xstream_id: u32,
        blob_id: u64,
        blobstore_uuid: Uuid,
        pool_uuid: Uuid,
    ) -> Result<Self> {
        let hdr = BlobHeader::new(xstream_id, blob_id, blobstore_uuid, pool_uuid);
        dev.write_at(0, &hdr.encode())?;
        debug!(blob_id, %pool_uuid, "formatted blob");
        let next = hdr.data_start();
        Ok(Self {
            dev,
            hdr,
            next,
            free: Vec::new(),
        })
    }

    /// Open an existing blob, validating its header.
    pub fn open(dev: Box<dyn BlockDevice>, pool_uuid: Uuid) -> Result<Self> {
        let mut block = vec![0u8; BLOB_BLOCK_SIZE as usize];
        dev.read_at(0, &mut block)?;
        let hdr = BlobHeader::decode(&block)?;
        if hdr.pool_uuid != pool_uuid {
            return Err(VosError::io_inval(format!(
                "blob belongs to pool {}, not {}",
                hdr.pool_uuid, pool_uuid
            )));
        }
        let next = dev.len().max(hdr.data_start());
        Ok(Self {
            dev,
            hdr,
            next,
            free: Vec::new(),
        })
    }

    pub fn header(&self) -> &BlobHeader {
        &self.hdr
    }

    /// Allocate `len` bytes of payload space, first-fit from the free list.
    pub fn alloc(&mut self, len: u64) -> Result<u64> {
        if len == 0 {
            return Err(VosError::inval("zero-length blob allocation"));
        }
        if let Some(i) = self.free.iter().position(|&(_, flen)| flen >= len) {
            let (off, flen) = self.free[i];
            if flen == len {
                self.free.remove(i);
            } else {
                self.free[i] = (off + len, flen - len);
            }
            return Ok(off);
        }
        let off = self.next;
        self.next = off
            .checked_add(len)
            .ok_or(VosError::NoSpace)?;
        Ok(off)
    }

    /// Return payload space to the free list.
    pub fn free(&mut self, off: u64, len: u64) {
        if len > 0 {
            self.free.push((off, len));
        }
    }

    pub fn read(&self, off: u64, buf: &mut [u8]) -> Result<()> {
        self.dev.read_at(off, buf)
    }

    pub fn write(&mut self, off: u64, buf: &[u8]) -> Result<()> {
        self.dev.write_at(off, buf)
    }
}
