//! The I/O descriptor.
//!
//! A [`BioDesc`] binds the payload addresses of one operation to buffers
//! the caller may freely copy in and out of between `prep` and `post`.
//! For fetches, `prep` fills the buffers from the media (zeros for holes,
//! which never reach a device) and `post` releases them. For updates,
//! `prep` exposes empty staging buffers and `post` performs the write-back:
//! SCM buffers land in their PM cell inside the caller's transaction, NVMe
//! buffers go through the blob write path. The zero-copy flavor of update
//! and fetch is the same descriptor with the caller working directly in
//! the staged buffers.

use tracing::debug;

use verso_error::{Result, VosError};
use verso_mem::PmPool;
use verso_types::{BioAddr, FaultHook, FaultSite, MediaType, PmAddr};

/// Direction of the bound operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BioOp {
    Fetch,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DescState {
    Init,
    Prepared,
    Posted,
}

#[derive(Debug)]
struct BioIov {
    addr: BioAddr,
    /// Byte offset within the payload behind `addr`.
    skip: u64,
    len: u64,
    buf: Vec<u8>,
}

/// Scatter-gather I/O descriptor with a strict `prep -> post` pairing.
#[derive(Debug)]
pub struct BioDesc {
    op: BioOp,
    state: DescState,
    iovs: Vec<BioIov>,
}

impl BioDesc {
    #[must_use]
    pub fn new(op: BioOp) -> Self {
        Self {
            op,
            state: DescState::Init,
            iovs: Vec::new(),
        }
    }

    pub fn op(&self) -> BioOp {
        self.op
    }

    /// Bind one payload range. Only legal before `prep`.
    pub fn add_iov(&mut self, addr: BioAddr, skip: u64, len: u64) -> Result<()> {
        if self.state != DescState::Init {
            return Err(VosError::inval("iov added to a prepared descriptor"));
        }
        if self.op == BioOp::Update && addr.is_hole() {
            return Err(VosError::inval("hole address in an update descriptor"));
        }
        self.iovs.push(BioIov {
            addr,
            skip,
            len,
            buf: Vec::new(),
        });
        Ok(())
    }

    pub fn iov_count(&self) -> usize {
        self.iovs.len()
    }

    /// Total bytes bound by this descriptor.
    pub fn total_len(&self) -> u64 {
        self.iovs.iter().map(|iov| iov.len).sum()
    }

    /// Resolve every address to a buffer. Must be paired with exactly one
    /// [`post`](Self::post).
    pub fn prep(&mut self, pool: &PmPool, io: &crate::blob::IoContext) -> Result<()> {
        if self.state != DescState::Init {
            return Err(VosError::inval("descriptor prepared twice"));
        }
        for iov in &mut self.iovs {
            let len = usize::try_from(iov.len)
                .map_err(|_| VosError::inval("iov length exceeds the address space"))?;
            iov.buf = vec![0u8; len];
            if self.op == BioOp::Fetch && !iov.addr.is_hole() {
                match iov.addr.media {
                    MediaType::Scm => {
                        let cell = pool.get::<Vec<u8>>(PmAddr::from_raw(iov.addr.off))?;
                        let skip = iov.skip as usize;
                        let end = skip + len;
                        if end > cell.len() {
                            return Err(VosError::Trunc {
                                expected: iov.skip + iov.len,
                                actual: cell.len() as u64,
                            });
                        }
                        iov.buf.copy_from_slice(&cell[skip..end]);
                    }
                    MediaType::Nvme => {
                        io.read(iov.addr.off + iov.skip, &mut iov.buf)?;
                    }
                }
            }
        }
        self.state = DescState::Prepared;
        Ok(())
    }

    /// Read access to a prepared buffer.
    pub fn buf(&self, i: usize) -> Result<&[u8]> {
        if self.state != DescState::Prepared {
            return Err(VosError::inval("descriptor not prepared"));
        }
        self.iovs
            .get(i)
            .map(|iov| iov.buf.as_slice())
            .ok_or_else(|| VosError::inval("iov index out of range"))
    }

    /// Write access to a prepared buffer.
    pub fn buf_mut(&mut self, i: usize) -> Result<&mut [u8]> {
        if self.state != DescState::Prepared {
            return Err(VosError::inval("descriptor not prepared"));
        }
        self.iovs
            .get_mut(i)
            .map(|iov| iov.buf.as_mut_slice())
            .ok_or_else(|| VosError::inval("iov index out of range"))
    }

    /// Complete the descriptor: write-back for updates (the NVMe submit
    /// fault site), buffer release for fetches.
    pub fn post(
        &mut self,
        pool: &mut PmPool,
        io: &mut crate::blob::IoContext,
        fault: &dyn FaultHook,
    ) -> Result<()> {
        if self.state != DescState::Prepared {
            return Err(VosError::inval("post without a matching prep"));
        }
        if self.op == BioOp::Update {
            for iov in &self.iovs {
                match iov.addr.media {
                    MediaType::Scm => {
                        let cell = pool.get_mut::<Vec<u8>>(PmAddr::from_raw(iov.addr.off))?;
                        let skip = iov.skip as usize;
                        let end = skip + iov.buf.len();
                        if end > cell.len() {
                            return Err(VosError::inval("scm payload cell too small"));
                        }
                        cell[skip..end].copy_from_slice(&iov.buf);
                    }
                    MediaType::Nvme => {
                        if fault.should_fail(FaultSite::NvmeSubmit) {
                            debug!("injected nvme submit failure");
                            return Err(VosError::io("nvme write-back failed"));
                        }
                        io.write(iov.addr.off + iov.skip, &iov.buf)?;
                    }
                }
            }
        }
        for iov in &mut self.iovs {
            iov.buf = Vec::new();
        }
        self.state = DescState::Posted;
        Ok(())
    }
}
