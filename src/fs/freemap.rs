//! Free-block bitmap (spec §6: "one bit per fs block, rounded up to a
//! multiple of 4096 bits").
//!
//! Grounded in `original_source/kern/fs/sfs/sfs_balloc.c`'s bitmap
//! allocator, generalised from SFS's specific on-disk bitmap format to a
//! plain in-memory bitmap with explicit `read_from`/`write_to`.

use crate::block::{BlockDevice, BLOCK_SIZE};
use crate::error::Result;
use crate::sync::SleepLock;

const BITS_PER_BLOCK: u64 = (BLOCK_SIZE * 8) as u64;

/// An allocation bitmap over `[0, num_blocks)`, persisted across
/// `freemap_blocks` contiguous blocks starting at `start_block`.
#[derive(Debug)]
pub struct Freemap {
    bits: SleepLock<Vec<u8>>,
    num_blocks: u64,
}

impl Freemap {
    pub fn new(num_blocks: u64) -> Self {
        let byte_len = (num_blocks as usize).div_ceil(8);
        Freemap { bits: SleepLock::new(vec![0u8; byte_len]), num_blocks }
    }

    pub fn is_marked(&self, block: u64) -> bool {
        if block >= self.num_blocks {
            return false;
        }
        let bits = self.bits.lock();
        bits[(block / 8) as usize] & (1 << (block % 8)) != 0
    }

    pub fn mark(&self, block: u64) {
        if block >= self.num_blocks {
            return;
        }
        let mut bits = self.bits.lock();
        bits[(block / 8) as usize] |= 1 << (block % 8);
    }

    pub fn unmark(&self, block: u64) {
        if block >= self.num_blocks {
            return;
        }
        let mut bits = self.bits.lock();
        bits[(block / 8) as usize] &= !(1 << (block % 8));
    }

    /// First free block, marked allocated before returning.
    pub fn alloc(&self) -> Option<u64> {
        let mut bits = self.bits.lock();
        for block in 0..self.num_blocks {
            let (byte, bit) = ((block / 8) as usize, block % 8);
            if bits[byte] & (1 << bit) == 0 {
                bits[byte] |= 1 << bit;
                return Some(block);
            }
        }
        None
    }

    pub fn read_from<D: BlockDevice>(device: &D, start_block: u64, freemap_blocks: u64, num_blocks: u64) -> Result<Self> {
        let mut bytes = Vec::with_capacity((freemap_blocks as usize) * BLOCK_SIZE);
        for i in 0..freemap_blocks {
            let mut block = vec![0u8; BLOCK_SIZE];
            device.read_block(start_block + i, &mut block)?;
            bytes.extend(block);
        }
        bytes.resize((num_blocks as usize).div_ceil(8), 0);
        Ok(Freemap { bits: SleepLock::new(bytes), num_blocks })
    }

    pub fn write_to<D: BlockDevice>(&self, device: &D, start_block: u64, freemap_blocks: u64) -> Result<()> {
        let bits = self.bits.lock();
        let mut padded = bits.clone();
        padded.resize((freemap_blocks as usize) * BLOCK_SIZE, 0);
        for i in 0..freemap_blocks {
            let start = (i as usize) * BLOCK_SIZE;
            device.write_block(start_block + i, &padded[start..start + BLOCK_SIZE])?;
        }
        Ok(())
    }

    pub fn blocks_needed(num_blocks: u64) -> u64 {
        num_blocks.div_ceil(BITS_PER_BLOCK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemBlockDevice;

    #[test]
    fn alloc_returns_first_free_block_and_marks_it() {
        let map = Freemap::new(8);
        map.mark(0);
        let block = map.alloc().unwrap();
        assert_eq!(block, 1);
        assert!(map.is_marked(1));
    }

    #[test]
    fn unmark_makes_a_block_available_again() {
        let map = Freemap::new(4);
        map.mark(2);
        map.unmark(2);
        assert!(!map.is_marked(2));
    }

    #[test]
    fn alloc_exhausted_returns_none() {
        let map = Freemap::new(2);
        map.alloc().unwrap();
        map.alloc().unwrap();
        assert_eq!(map.alloc(), None);
    }

    #[test]
    fn round_trips_through_a_block_device() {
        let dev = MemBlockDevice::new(16);
        let map = Freemap::new(10);
        map.mark(3);
        map.mark(9);
        map.write_to(&dev, 2, 1).unwrap();
        let reloaded = Freemap::read_from(&dev, 2, 1, 10).unwrap();
        assert!(reloaded.is_marked(3));
        assert!(reloaded.is_marked(9));
        assert!(!reloaded.is_marked(4));
    }

    #[test]
    fn blocks_needed_rounds_up_to_a_full_block_of_bits() {
        assert_eq!(Freemap::blocks_needed(1), 1);
        assert_eq!(Freemap::blocks_needed(BITS_PER_BLOCK), 1);
        assert_eq!(Freemap::blocks_needed(BITS_PER_BLOCK + 1), 2);
    }
}
