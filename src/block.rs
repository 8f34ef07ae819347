//! Block device abstraction.
//!
//! Generalised from the teacher's `block::BlockDevice` trait (originally
//! scoped to VirtIO/AHCI sector devices) to the fixed 512-byte unit this
//! core requires, and returning the crate-wide [`Error`] instead of a
//! block-specific error type so callers compose it with `?` alongside every
//! other fallible operation in the crate.

use crate::error::{Error, Result};

/// The fixed block size this core operates on (spec §6).
pub const BLOCK_SIZE: usize = 512;

/// A generic block-addressed storage device.
pub trait BlockDevice: Send + Sync {
    /// Read block `block_num` into `buf`. `buf.len()` must equal [`BLOCK_SIZE`].
    fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `buf` to block `block_num`. `buf.len()` must equal [`BLOCK_SIZE`].
    fn write_block(&self, block_num: u64, buf: &[u8]) -> Result<()>;

    /// Size in bytes of one block on this device. Spec §6 fixes this at
    /// [`BLOCK_SIZE`]; an implementation backed by a differently-sized
    /// device overrides this so `Filesystem::mount` can reject the
    /// mismatch with [`Error::NoDevice`] instead of failing confusingly on
    /// the first mis-sized read.
    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    /// Total number of addressable blocks.
    fn num_blocks(&self) -> u64;

    /// Flush any cached writes to persistent storage.
    fn flush(&self) -> Result<()>;
}

/// Lets a filesystem share one underlying device between its buffer cache
/// and its journal container without either subsystem taking ownership.
impl<D: BlockDevice + ?Sized> BlockDevice for std::sync::Arc<D> {
    fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_block(block_num, buf)
    }

    fn write_block(&self, block_num: u64, buf: &[u8]) -> Result<()> {
        (**self).write_block(block_num, buf)
    }

    fn block_size(&self) -> usize {
        (**self).block_size()
    }

    fn num_blocks(&self) -> u64 {
        (**self).num_blocks()
    }

    fn flush(&self) -> Result<()> {
        (**self).flush()
    }
}

/// An in-memory block device for tests, backed by a single buffer behind a
/// sleep lock. Mirrors the role of `BlockDevice` test doubles used against
/// the ext2 superblock parser in the teacher codebase.
#[cfg(test)]
#[derive(Debug)]
pub struct MemBlockDevice {
    blocks: crate::sync::SleepLock<Vec<u8>>,
    num_blocks: u64,
    block_size: usize,
}

#[cfg(test)]
impl MemBlockDevice {
    pub fn new(num_blocks: u64) -> Self {
        MemBlockDevice {
            blocks: crate::sync::SleepLock::new(vec![0u8; num_blocks as usize * BLOCK_SIZE]),
            num_blocks,
            block_size: BLOCK_SIZE,
        }
    }

    /// A device that reports a different `block_size()` than it actually
    /// stores, for exercising `Filesystem::mount`'s block-size check.
    pub fn with_reported_block_size(num_blocks: u64, block_size: usize) -> Self {
        MemBlockDevice { block_size, ..MemBlockDevice::new(num_blocks) }
    }

    /// Snapshot the device's current contents into an independent copy, for
    /// tests that simulate remounting over the same on-disk bytes.
    pub fn snapshot(&self) -> Self {
        MemBlockDevice {
            blocks: crate::sync::SleepLock::new(self.blocks.lock().clone()),
            num_blocks: self.num_blocks,
            block_size: self.block_size,
        }
    }

    fn offset(&self, block_num: u64) -> Result<usize> {
        if block_num >= self.num_blocks {
            return Err(Error::Io);
        }
        Ok(block_num as usize * BLOCK_SIZE)
    }
}

#[cfg(test)]
impl BlockDevice for MemBlockDevice {
    fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<()> {
        if buf.len() != BLOCK_SIZE {
            return Err(Error::Invalid);
        }
        let off = self.offset(block_num)?;
        let blocks = self.blocks.lock();
        buf.copy_from_slice(&blocks[off..off + BLOCK_SIZE]);
        Ok(())
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn write_block(&self, block_num: u64, buf: &[u8]) -> Result<()> {
        if buf.len() != BLOCK_SIZE {
            return Err(Error::Invalid);
        }
        let off = self.offset(block_num)?;
        let mut blocks = self.blocks.lock();
        blocks[off..off + BLOCK_SIZE].copy_from_slice(buf);
        Ok(())
    }

    fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_block_size_matches_the_fixed_constant() {
        let dev = MemBlockDevice::new(4);
        assert_eq!(dev.block_size(), BLOCK_SIZE);
    }

    #[test]
    fn with_reported_block_size_overrides_it() {
        let dev = MemBlockDevice::with_reported_block_size(4, 4096);
        assert_eq!(dev.block_size(), 4096);
    }

    #[test]
    fn read_after_write_round_trips() {
        let dev = MemBlockDevice::new(4);
        let mut src = vec![0xAB; BLOCK_SIZE];
        src[0] = 0x01;
        dev.write_block(2, &src).unwrap();
        let mut dst = vec![0u8; BLOCK_SIZE];
        dev.read_block(2, &mut dst).unwrap();
        assert_eq!(src, dst);
    }

    #[test]
    fn out_of_bounds_block_is_io_error() {
        let dev = MemBlockDevice::new(4);
        let buf = vec![0u8; BLOCK_SIZE];
        assert_eq!(dev.read_block(4, &mut buf.clone()).unwrap_err(), Error::Io);
    }

    #[test]
    fn wrong_size_buffer_is_invalid() {
        let dev = MemBlockDevice::new(4);
        let mut buf = vec![0u8; BLOCK_SIZE - 1];
        assert_eq!(dev.read_block(0, &mut buf).unwrap_err(), Error::Invalid);
    }

    #[test]
    fn unwritten_blocks_start_zeroed() {
        let dev = MemBlockDevice::new(1);
        let mut buf = vec![0xFF; BLOCK_SIZE];
        dev.read_block(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }
}
