//! Disk-backed swap area: a page-aligned bitmap device.
//!
//! Ported from `original_source/kern/vm/coremap.c`'s `bs_*` functions
//! (`bs_bootstrap`, `bs_alloc_index`, `bs_dealloc_index`, `bs_read_page`,
//! `bs_write_page`): a single bitmap lock guards slot allocation, and each
//! slot holds exactly one page's worth of data on the backing block device.

use crate::block::{BlockDevice, BLOCK_SIZE};
use crate::error::{Error, Result};
use crate::memory::addr::PAGE_SIZE;
use crate::sync::SleepLock;

const BLOCKS_PER_PAGE: usize = PAGE_SIZE / BLOCK_SIZE;

/// A fixed-size swap area: `num_pages` page-sized slots on a block device,
/// tracked by a free/used bitmap.
#[derive(Debug)]
pub struct SwapDevice<D: BlockDevice> {
    device: D,
    num_pages: usize,
    bitmap: SleepLock<Vec<bool>>,
}

impl<D: BlockDevice> SwapDevice<D> {
    /// Build a swap device over `device`, sized to `num_pages` page slots.
    /// Fails with [`Error::NoDevice`] if the device does not have enough
    /// blocks to back that many pages.
    pub fn new(device: D, num_pages: usize) -> Result<Self> {
        if device.num_blocks() < (num_pages * BLOCKS_PER_PAGE) as u64 {
            return Err(Error::NoDevice);
        }
        Ok(SwapDevice { device, num_pages, bitmap: SleepLock::new(vec![false; num_pages]) })
    }

    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    /// Pages not currently allocated.
    pub fn free_pages(&self) -> usize {
        self.bitmap.lock().iter().filter(|used| !**used).count()
    }

    /// Reserve and return a fresh swap slot index.
    pub fn alloc_index(&self) -> Result<usize> {
        let mut bitmap = self.bitmap.lock();
        match bitmap.iter().position(|used| !used) {
            Some(idx) => {
                bitmap[idx] = true;
                log::trace!("swap: allocated slot {idx}");
                Ok(idx)
            }
            None => {
                log::warn!("swap: bitmap exhausted ({} slots)", self.num_pages);
                Err(Error::NoSpace)
            }
        }
    }

    /// Release a previously allocated slot.
    pub fn dealloc_index(&self, index: usize) {
        let mut bitmap = self.bitmap.lock();
        debug_assert!(bitmap[index], "double-free of swap slot {index}");
        bitmap[index] = false;
        log::trace!("swap: freed slot {index}");
    }

    /// Read one page's worth of data from `index` into `buf` (must be
    /// exactly [`PAGE_SIZE`] bytes).
    pub fn read_page(&self, index: usize, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        let base_block = (index * BLOCKS_PER_PAGE) as u64;
        for i in 0..BLOCKS_PER_PAGE {
            self.device.read_block(base_block + i as u64, &mut buf[i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE])?;
        }
        Ok(())
    }

    /// Write one page's worth of data to `index` from `buf` (must be
    /// exactly [`PAGE_SIZE`] bytes).
    pub fn write_page(&self, index: usize, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        let base_block = (index * BLOCKS_PER_PAGE) as u64;
        for i in 0..BLOCKS_PER_PAGE {
            self.device.write_block(base_block + i as u64, &buf[i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemBlockDevice;

    fn make_swap(num_pages: usize) -> SwapDevice<MemBlockDevice> {
        let dev = MemBlockDevice::new((num_pages * BLOCKS_PER_PAGE) as u64);
        SwapDevice::new(dev, num_pages).unwrap()
    }

    #[test]
    fn device_too_small_is_rejected() {
        let dev = MemBlockDevice::new(1);
        assert_eq!(SwapDevice::new(dev, 4).unwrap_err(), Error::NoDevice);
    }

    #[test]
    fn alloc_index_reuses_after_dealloc() {
        let swap = make_swap(2);
        let a = swap.alloc_index().unwrap();
        let b = swap.alloc_index().unwrap();
        assert_ne!(a, b);
        assert_eq!(swap.alloc_index().unwrap_err(), Error::NoSpace);
        swap.dealloc_index(a);
        let c = swap.alloc_index().unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn write_then_read_page_round_trips() {
        let swap = make_swap(2);
        let slot = swap.alloc_index().unwrap();
        let mut page = vec![0u8; PAGE_SIZE];
        for (i, b) in page.iter_mut().enumerate() {
            *b = (i % 256) as u8;
        }
        swap.write_page(slot, &page).unwrap();
        let mut out = vec![0u8; PAGE_SIZE];
        swap.read_page(slot, &mut out).unwrap();
        assert_eq!(page, out);
    }

    #[test]
    fn free_pages_reflects_allocations() {
        let swap = make_swap(4);
        assert_eq!(swap.free_pages(), 4);
        let a = swap.alloc_index().unwrap();
        assert_eq!(swap.free_pages(), 3);
        swap.dealloc_index(a);
        assert_eq!(swap.free_pages(), 4);
    }
}
