//! Buffer cache: per-block data plus the `{oldest_lsn, newest_lsn}` metadata
//! the WAL protocol needs to order journal flushes ahead of data writeback.
//!
//! Grounded in `original_source/kern/fs/sfs/sfs_trans.c`'s
//! `buffer_get_dirty_array`/`buffer_get_fsdata`/`buffer_set_info` usage: one
//! lock guarding a small map of resident blocks, each carrying its own LSN
//! watermark rather than a single cache-wide one.

use std::collections::BTreeMap;

use crate::block::{BlockDevice, BLOCK_SIZE};
use crate::error::Result;
use crate::sync::SleepLock;

/// Per-buffer bookkeeping (spec §3 "Buffer metadata").
#[derive(Debug, Clone, Copy)]
pub struct BufferMeta {
    pub disk_block: u64,
    /// LSN of the first journal record touching this buffer since it was
    /// last written back; zero means "not yet set".
    pub oldest_lsn: u64,
    /// LSN of the most recent journal record touching this buffer.
    pub newest_lsn: u64,
    pub dirty: bool,
}

#[derive(Debug)]
struct CachedBlock {
    data: Vec<u8>,
    meta: BufferMeta,
}

/// A small write-back cache of filesystem blocks.
#[derive(Debug)]
pub struct BufferCache<D: BlockDevice> {
    device: D,
    blocks: SleepLock<BTreeMap<u64, CachedBlock>>,
}

impl<D: BlockDevice> BufferCache<D> {
    pub fn new(device: D) -> Self {
        BufferCache { device, blocks: SleepLock::new(BTreeMap::new()) }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Read a block, filling the cache on miss. Returns a clone of the
    /// cached bytes; callers that mutate call [`BufferCache::mark_dirty`]
    /// with the result.
    pub fn read(&self, block_num: u64) -> Result<Vec<u8>> {
        let mut blocks = self.blocks.lock();
        if let Some(cached) = blocks.get(&block_num) {
            return Ok(cached.data.clone());
        }
        let mut data = vec![0u8; BLOCK_SIZE];
        self.device.read_block(block_num, &mut data)?;
        let meta = BufferMeta { disk_block: block_num, oldest_lsn: 0, newest_lsn: 0, dirty: false };
        blocks.insert(block_num, CachedBlock { data: data.clone(), meta });
        Ok(data)
    }

    /// Record a metadata mutation to `block_num` at `lsn`, replacing its
    /// cached bytes with `data` and marking it dirty. `oldest_lsn` is set
    /// only the first time a buffer goes dirty since its last writeback
    /// (spec §4.6 record-emission wrapper, step d).
    pub fn mark_dirty(&self, block_num: u64, data: Vec<u8>, lsn: u64) {
        let mut blocks = self.blocks.lock();
        let entry = blocks.entry(block_num).or_insert_with(|| CachedBlock {
            data: vec![0u8; BLOCK_SIZE],
            meta: BufferMeta { disk_block: block_num, oldest_lsn: 0, newest_lsn: 0, dirty: false },
        });
        entry.data = data;
        if !entry.meta.dirty || entry.meta.oldest_lsn == 0 {
            entry.meta.oldest_lsn = lsn;
        }
        entry.meta.newest_lsn = lsn;
        entry.meta.dirty = true;
    }

    /// Snapshot of every currently dirty buffer's metadata, for checkpoint's
    /// `min(oldest_lsn)` computation (spec §4.6).
    pub fn dirty_metas(&self) -> Vec<BufferMeta> {
        self.blocks.lock().values().filter(|c| c.meta.dirty).map(|c| c.meta).collect()
    }

    /// Write every dirty buffer back to the device, calling `flush_upto`
    /// with each buffer's `newest_lsn` before the corresponding
    /// `write_block` (WAL ordering, spec §4.6: "`flush(b.newest_lsn)` must
    /// precede `write_block(b)`").
    pub fn writeback_all(&self, mut flush_upto: impl FnMut(u64) -> Result<()>) -> Result<()> {
        let mut blocks = self.blocks.lock();
        for cached in blocks.values_mut() {
            if !cached.meta.dirty {
                continue;
            }
            flush_upto(cached.meta.newest_lsn)?;
            self.device.write_block(cached.meta.disk_block, &cached.data)?;
            cached.meta.dirty = false;
            cached.meta.oldest_lsn = 0;
            log::trace!("buffer: wrote back block={} lsn={}", cached.meta.disk_block, cached.meta.newest_lsn);
        }
        Ok(())
    }

    /// Discard the cache. Used after recovery replay, where blocks were
    /// touched through raw `write_block` calls rather than through the cache.
    pub fn invalidate_all(&self) {
        self.blocks.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemBlockDevice;

    #[test]
    fn read_misses_fill_cache_from_device() {
        let dev = MemBlockDevice::new(4);
        let cache = BufferCache::new(dev);
        let data = cache.read(1).unwrap();
        assert_eq!(data.len(), BLOCK_SIZE);
    }

    #[test]
    fn mark_dirty_sets_oldest_lsn_once() {
        let dev = MemBlockDevice::new(4);
        let cache = BufferCache::new(dev);
        cache.mark_dirty(1, vec![1u8; BLOCK_SIZE], 10);
        cache.mark_dirty(1, vec![2u8; BLOCK_SIZE], 20);
        let meta = cache.dirty_metas().into_iter().find(|m| m.disk_block == 1).unwrap();
        assert_eq!(meta.oldest_lsn, 10);
        assert_eq!(meta.newest_lsn, 20);
    }

    #[test]
    fn writeback_flushes_before_writing_and_clears_dirty() {
        let dev = MemBlockDevice::new(4);
        let cache = BufferCache::new(dev);
        cache.mark_dirty(2, vec![9u8; BLOCK_SIZE], 5);
        let mut flushed_upto = None;
        cache.writeback_all(|lsn| {
            flushed_upto = Some(lsn);
            Ok(())
        }).unwrap();
        assert_eq!(flushed_upto, Some(5));
        assert!(cache.dirty_metas().is_empty());
        let mut readback = vec![0u8; BLOCK_SIZE];
        cache.device().read_block(2, &mut readback).unwrap();
        assert_eq!(readback, vec![9u8; BLOCK_SIZE]);
    }
}
