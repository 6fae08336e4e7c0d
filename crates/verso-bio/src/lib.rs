//! BIO: the block-I/O bridge.
//!
//! Multiplexes two media behind one address type: SCM payloads are
//! PM-resident byte cells, NVMe payloads live in a blob on a
//! [`BlockDevice`] and move through staged DMA buffers. The
//! [`BioDesc`] descriptor binds a set of addresses to buffers with a strict
//! `prep -> post` lifecycle; holes never touch a device and always read as
//! zeros.

pub mod blob;
pub mod desc;
pub mod device;

pub use blob::{BlobHeader, IoContext, BLOB_MAGIC};
pub use desc::{BioDesc, BioOp};
pub use device::{BlockDevice, FileDev, MallocDev};
