//! Transaction manager: brackets each metadata-mutating filesystem
//! operation with `TransBegin`/`TransCommit`, tracks in-flight
//! transactions, and drives periodic checkpointing.
//!
//! Ported from `original_source/kern/fs/sfs/sfs_trans.c`'s
//! `sfs_trans_begin`/`sfs_trans_commit`/`sfs_checkpoint`.

use crate::block::BlockDevice;
use crate::error::Result;
use crate::fs::buffer::BufferCache;
use crate::fs::jphys::JournalContainer;
use crate::fs::record::ClientRecord;
use crate::sync::SleepLock;

/// A runtime record of one in-progress transaction (spec §3 "Transaction").
#[derive(Debug, Clone)]
pub struct Transaction {
    pub tx_id: u32,
    pub first_lsn: u64,
    pub lsns: Vec<u64>,
}

#[derive(Debug)]
struct Inner {
    next_tx_id: u32,
    active: Vec<Transaction>,
    oldest_freemap_lsn: u64,
    newest_freemap_lsn: u64,
}

/// Owns the active-transaction list and the freemap LSN watermark used by
/// [`TransactionManager::checkpoint`] (spec §4.6).
#[derive(Debug)]
pub struct TransactionManager {
    inner: SleepLock<Inner>,
    checkpoint_threshold: u64,
}

impl TransactionManager {
    pub fn new(checkpoint_threshold: u64) -> Self {
        TransactionManager {
            inner: SleepLock::new(Inner { next_tx_id: 1, active: Vec::new(), oldest_freemap_lsn: 0, newest_freemap_lsn: 0 }),
            checkpoint_threshold,
        }
    }

    /// Write `TransBegin` and register the transaction, via a callback that
    /// runs while the journal's write lock is held (spec §4.5/§4.6).
    pub fn begin<D: BlockDevice>(&self, journal: &JournalContainer<D>, tx_type: u32) -> Result<u32> {
        let tx_id = {
            let mut inner = self.inner.lock();
            let id = inner.next_tx_id;
            inner.next_tx_id += 1;
            id
        };
        let rec = ClientRecord::TransBegin { tx_type, tx_id };
        let mut first_lsn = 0u64;
        {
            let mut cb = |lsn: u64| first_lsn = lsn;
            journal.write(rec.type_code(), true, rec.encode_payload(), Some(&mut cb))?;
        }
        self.inner.lock().active.push(Transaction { tx_id, first_lsn, lsns: vec![first_lsn] });
        log::debug!("transaction: begin tx_id={tx_id} first_lsn={first_lsn}");
        Ok(tx_id)
    }

    pub fn commit<D: BlockDevice>(&self, journal: &JournalContainer<D>, tx_type: u32, tx_id: u32) -> Result<()> {
        let rec = ClientRecord::TransCommit { tx_type, tx_id };
        journal.write(rec.type_code(), true, rec.encode_payload(), None)?;
        self.inner.lock().active.retain(|t| t.tx_id != tx_id);
        log::debug!("transaction: commit tx_id={tx_id}");
        Ok(())
    }

    /// Emit one client record on behalf of `tx_id` (spec §4.6 "record
    /// emission helper"). Fails silently (returns the would-be LSN without
    /// writing) if the journal hasn't had writing enabled yet — e.g. calls
    /// that race filesystem mount before recovery completes.
    pub fn emit<D: BlockDevice>(
        &self,
        journal: &JournalContainer<D>,
        buffers: &BufferCache<D>,
        tx_id: u32,
        record: ClientRecord,
        new_block_bytes: Option<Vec<u8>>,
    ) -> Result<u64> {
        if !journal.is_writing_enabled() {
            log::debug!("transaction: emit dropped, writing disabled (tx_id={tx_id})");
            return Ok(journal.peek_next_lsn());
        }
        let is_freemap_record = matches!(record, ClientRecord::BlockAlloc { .. } | ClientRecord::BlockDealloc { .. });
        let target = record.target_block();
        let rec_type = record.type_code();
        let payload = record.encode_payload();
        let lsn = journal.write(rec_type, true, payload, None)?;

        {
            let mut inner = self.inner.lock();
            if let Some(tx) = inner.active.iter_mut().find(|t| t.tx_id == tx_id) {
                tx.lsns.push(lsn);
            }
            if is_freemap_record {
                if inner.oldest_freemap_lsn == 0 {
                    inner.oldest_freemap_lsn = lsn;
                }
                inner.newest_freemap_lsn = lsn;
            }
        }

        if let (Some(block), Some(bytes)) = (target, new_block_bytes) {
            buffers.mark_dirty(block, bytes, lsn);
        }

        if journal.odometer() >= self.checkpoint_threshold {
            self.checkpoint(journal, buffers)?;
        }
        Ok(lsn)
    }

    /// `oldest_lsn = min(active transactions' first_lsn, dirty buffers'
    /// oldest_lsn, the freemap watermark)`; falls back to `peek_next_lsn`
    /// when nothing is outstanding (spec §4.6).
    pub fn checkpoint<D: BlockDevice>(&self, journal: &JournalContainer<D>, buffers: &BufferCache<D>) -> Result<()> {
        let (min_active, freemap_floor) = {
            let inner = self.inner.lock();
            let min_active = inner.active.iter().map(|t| t.first_lsn).min();
            let freemap_floor = (inner.newest_freemap_lsn != 0).then_some(inner.oldest_freemap_lsn);
            (min_active, freemap_floor)
        };
        let min_buf = buffers.dirty_metas().into_iter().map(|m| m.oldest_lsn).filter(|&l| l != 0).min();
        let oldest =
            [min_active, min_buf, freemap_floor].into_iter().flatten().min().unwrap_or_else(|| journal.peek_next_lsn());
        journal.trim(oldest)?;
        journal.clear_odometer();
        log::debug!("transaction: checkpoint trimmed tail to lsn={oldest}");
        Ok(())
    }

    pub fn active_transactions(&self) -> Vec<Transaction> {
        self.inner.lock().active.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{MemBlockDevice, BLOCK_SIZE};

    fn make_journal(num_blocks: u64) -> JournalContainer<MemBlockDevice> {
        let dev = MemBlockDevice::new(num_blocks);
        JournalContainer::new(dev, 0, num_blocks)
    }

    #[test]
    fn begin_then_commit_clears_active_list() {
        let journal = make_journal(4);
        let txman = TransactionManager::new(64 * 1024);
        let tx_id = txman.begin(&journal, 1).unwrap();
        assert_eq!(txman.active_transactions().len(), 1);
        txman.commit(&journal, 1, tx_id).unwrap();
        assert!(txman.active_transactions().is_empty());
    }

    #[test]
    fn emit_updates_buffer_metadata_for_its_target_block() {
        let journal = make_journal(4);
        let buffers = BufferCache::new(MemBlockDevice::new(4));
        let txman = TransactionManager::new(64 * 1024);
        journal.start_writing();
        let tx_id = txman.begin(&journal, 1).unwrap();
        let rec = ClientRecord::BlockAlloc { tx_id, disk_addr: 7, ref_addr: 1, offset_addr: 0 };
        let lsn = txman.emit(&journal, &buffers, tx_id, rec, Some(vec![0xAB; BLOCK_SIZE])).unwrap();
        let meta = buffers.dirty_metas().into_iter().find(|m| m.disk_block == 7).unwrap();
        assert_eq!(meta.newest_lsn, lsn);
    }

    #[test]
    fn emit_is_silently_dropped_before_writing_is_enabled() {
        let journal = make_journal(4);
        let buffers = BufferCache::new(MemBlockDevice::new(4));
        let txman = TransactionManager::new(64 * 1024);
        let tx_id = 1;
        let rec = ClientRecord::BlockDealloc { tx_id, disk_addr: 3 };
        let before = journal.peek_next_lsn();
        let lsn = txman.emit(&journal, &buffers, tx_id, rec, None).unwrap();
        assert_eq!(lsn, before);
        assert_eq!(journal.peek_next_lsn(), before);
    }

    #[test]
    fn checkpoint_trims_to_oldest_outstanding_lsn() {
        let journal = make_journal(4);
        let buffers = BufferCache::new(MemBlockDevice::new(4));
        let txman = TransactionManager::new(64 * 1024);
        journal.start_writing();
        let tx_id = txman.begin(&journal, 1).unwrap();
        let first_lsn = txman.active_transactions()[0].first_lsn;
        txman.checkpoint(&journal, &buffers).unwrap();
        assert_eq!(journal.tail_lsn(), first_lsn);
    }
}
