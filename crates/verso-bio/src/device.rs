//! Block device backends.
//!
//! The blob sits on a [`BlockDevice`]; `malloc` class is an in-memory
//! vector, `file`/`kdev`/`nvme` classes resolve to a positioned file in
//! this single-node build.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use verso_error::{Result, VosError};

/// Random-access byte device backing a blob.
pub trait BlockDevice: fmt::Debug {
    fn read_at(&self, off: u64, buf: &mut [u8]) -> Result<()>;
    fn write_at(&mut self, off: u64, buf: &[u8]) -> Result<()>;
    /// Current device length in bytes.
    fn len(&self) -> u64;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory device (`bdev_class = malloc`). Grows on write.
#[derive(Debug, Default)]
pub struct MallocDev {
    data: Vec<u8>,
}

impl MallocDev {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockDevice for MallocDev {
    fn read_at(&self, off: u64, buf: &mut [u8]) -> Result<()> {
        let off = off as usize;
        let end = off.checked_add(buf.len()).ok_or_else(|| {
            VosError::io("read range overflows the device")
        })?;
        if end > self.data.len() {
            return Err(VosError::io(format!(
                "short read at {off}: device length {}",
                self.data.len()
            )));
        }
        buf.copy_from_slice(&self.data[off..end]);
        Ok(())
    }

    fn write_at(&mut self, off: u64, buf: &[u8]) -> Result<()> {
        let off = off as usize;
        let end = off
            .checked_add(buf.len())
            .ok_or_else(|| VosError::io("write range overflows the device"))?;
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[off..end].copy_from_slice(buf);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }
}

/// File-backed device (`bdev_class = file`, and the stand-in for `nvme` /
/// `kdev` in this build).
#[derive(Debug)]
pub struct FileDev {
    file: File,
    len: u64,
}

impl FileDev {
    /// Create or truncate the backing file.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self { file, len: 0 })
    }

    /// Open an existing backing file.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }
}

impl BlockDevice for FileDev {
    fn read_at(&self, off: u64, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buf, off)?;
        Ok(())
    }

    fn write_at(&mut self, off: u64, buf: &[u8]) -> Result<()> {
        self.file.write_all_at(buf, off)?;
        self.len = self.len.max(off + buf.len() as u64);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }
}
