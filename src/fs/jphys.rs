//! Journal container ("jphys"): the append-only circular log of 512-byte
//! blocks that client records ride inside of.
//!
//! Grounded in `original_source/kern/fs/sfs/sfs_jentries.c`'s
//! `sfs_jphys_write_wrapper` callback contract (spec §4.5): the callback
//! runs inline, with the write path's lock held, so "record written at LSN
//! X" and "caller's bookkeeping updated" happen atomically. Writes here are
//! write-through (every record is pushed to the device immediately), which
//! makes `flush`/`flush_all` trivial durability barriers rather than a
//! buffered-log design — acceptable since the block device itself is the
//! only thing that can reorder or delay a write, and `BlockDevice::flush`
//! is still invoked so a real device's barrier is exercised.

use crate::block::{BlockDevice, BLOCK_SIZE};
use crate::error::{Error, Result};
use crate::fs::record::{Header, TYPE_PAD, TYPE_TRIM};
use crate::sync::SleepLock;

/// A decoded record as read back out of the log, independent of its client
/// payload's structure (that's [`crate::fs::record::ClientRecord::decode`]'s job).
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub lsn: u64,
    pub is_client: bool,
    pub rec_type: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
struct State {
    /// Next LSN to assign.
    head: u64,
    /// Oldest LSN still considered live (advanced by `trim`).
    tail: u64,
    /// Block-relative index (0..num_blocks) currently being appended to.
    block_index: u64,
    /// Byte offset within the in-progress block buffer.
    offset: usize,
    /// The in-progress block's current contents, kept resident so a
    /// multi-record block doesn't need a read-modify-write per append.
    buf: Vec<u8>,
    odometer: u64,
    writing_enabled: bool,
}

/// The physical journal: a fixed run of blocks `[start_block, start_block +
/// num_blocks)` on the underlying device, treated as a circular buffer of
/// records (spec §4.5).
#[derive(Debug)]
pub struct JournalContainer<D: BlockDevice> {
    device: D,
    start_block: u64,
    num_blocks: u64,
    state: SleepLock<State>,
}

impl<D: BlockDevice> JournalContainer<D> {
    pub fn new(device: D, start_block: u64, num_blocks: u64) -> Self {
        JournalContainer {
            device,
            start_block,
            num_blocks,
            state: SleepLock::new(State {
                head: 0,
                tail: 0,
                block_index: 0,
                offset: 0,
                buf: vec![0u8; BLOCK_SIZE],
                odometer: 0,
                writing_enabled: false,
            }),
        }
    }

    fn physical_block(&self, block_index: u64) -> u64 {
        self.start_block + (block_index % self.num_blocks)
    }

    /// Scan every journal block and decode every record found, regardless
    /// of physical write order (LSNs, not block order, establish the
    /// logical sequence once the log has wrapped).
    fn scan_all(&self) -> Result<Vec<(RawRecord, u64, usize)>> {
        let mut out = Vec::new();
        for i in 0..self.num_blocks {
            let mut block = vec![0u8; BLOCK_SIZE];
            self.device.read_block(self.physical_block(i), &mut block)?;
            let mut offset = 0usize;
            while offset + 8 <= BLOCK_SIZE {
                let word = u64::from_le_bytes(block[offset..offset + 8].try_into().unwrap());
                let Some(header) = Header::decode(word) else { break };
                let len = header.byte_len();
                if len < 8 || offset + len > BLOCK_SIZE {
                    break;
                }
                let payload = block[offset + 8..offset + len].to_vec();
                out.push((
                    RawRecord { lsn: header.lsn, is_client: header.is_client, rec_type: header.rec_type, payload },
                    i,
                    offset + len,
                ));
                offset += len;
            }
        }
        Ok(out)
    }

    /// At mount: locate head (next LSN to assign), tail (last TRIM's
    /// payload), and resume appending right after the highest-LSN record
    /// physically found (spec §4.5 `load_up`).
    pub fn load_up(&self) -> Result<()> {
        let records = self.scan_all()?;
        let mut head = 0u64;
        let mut tail = 0u64;
        let mut newest_trim_lsn: Option<u64> = None;
        let mut resume: Option<(u64, u64, usize)> = None; // (record_lsn, block_index, end_offset)
        for (rec, block_index, end_offset) in &records {
            if rec.lsn + 1 > head {
                head = rec.lsn + 1;
            }
            if resume.map_or(true, |(l, _, _)| rec.lsn > l) {
                resume = Some((rec.lsn, *block_index, *end_offset));
            }
            if !rec.is_client && rec.rec_type == TYPE_TRIM {
                if newest_trim_lsn.map_or(true, |l| rec.lsn > l) {
                    newest_trim_lsn = Some(rec.lsn);
                    tail = u64::from_le_bytes(rec.payload[0..8].try_into().map_err(|_| Error::Invalid)?);
                }
            }
        }
        let (resume_block, resume_offset) = resume.map(|(_, b, o)| (b, o)).unwrap_or((0, 0));
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.device.read_block(self.physical_block(resume_block), &mut buf)?;
        let mut state = self.state.lock();
        state.head = head;
        state.tail = tail;
        state.block_index = resume_block;
        state.offset = resume_offset;
        state.buf = buf;
        log::info!("jphys: loaded head={head} tail={tail} resume_block={resume_block} resume_offset={resume_offset}");
        Ok(())
    }

    /// Enable appending. Called once recovery replay has finished (spec
    /// §4.7 "After Pass C, enable start_writing").
    pub fn start_writing(&self) {
        self.state.lock().writing_enabled = true;
    }

    pub fn is_writing_enabled(&self) -> bool {
        self.state.lock().writing_enabled
    }

    /// Append a record, invoking `callback` (if present) with its assigned
    /// LSN while still holding the write lock (spec §4.5 callback contract).
    pub fn write(&self, rec_type: u8, is_client: bool, payload: Vec<u8>, callback: Option<&mut dyn FnMut(u64)>) -> Result<u64> {
        debug_assert_eq!(payload.len() % 2, 0, "journal payloads must be an even number of bytes");
        let len_bytes = 8 + payload.len();
        assert!(len_bytes <= BLOCK_SIZE, "record of {len_bytes} bytes cannot fit in a {BLOCK_SIZE}-byte block");
        let length_units: u8 = (len_bytes / 2).try_into().expect("record too long to encode its length");

        let mut state = self.state.lock();
        if state.offset + len_bytes > BLOCK_SIZE {
            let remaining = BLOCK_SIZE - state.offset;
            if remaining >= 8 {
                let pad_lsn = state.head;
                state.head += 1;
                let pad_header = Header { is_client: false, rec_type: TYPE_PAD, length_units: (remaining / 2) as u8, lsn: pad_lsn };
                let pad_offset = state.offset;
                state.buf[pad_offset..pad_offset + 8].copy_from_slice(&pad_header.encode().to_le_bytes());
                let phys = self.physical_block(state.block_index);
                self.device.write_block(phys, &state.buf)?;
            }
            state.block_index = (state.block_index + 1) % self.num_blocks;
            state.offset = 0;
            state.buf = vec![0u8; BLOCK_SIZE];
        }

        let lsn = state.head;
        state.head += 1;
        let header = Header { is_client, rec_type, length_units, lsn };
        let offset = state.offset;
        state.buf[offset..offset + 8].copy_from_slice(&header.encode().to_le_bytes());
        state.buf[offset + 8..offset + len_bytes].copy_from_slice(&payload);
        let phys = self.physical_block(state.block_index);
        self.device.write_block(phys, &state.buf)?;
        state.offset += len_bytes;
        state.odometer += len_bytes as u64;

        if let Some(cb) = callback {
            cb(lsn);
        }
        log::trace!("jphys: wrote lsn={lsn} type={rec_type} len={len_bytes}");
        Ok(lsn)
    }

    /// Durability barrier up to `lsn`. A no-op beyond calling through to the
    /// device's own flush, since every `write` is already write-through.
    pub fn flush(&self, _lsn: u64) -> Result<()> {
        self.device.flush()
    }

    pub fn flush_all(&self) -> Result<()> {
        self.device.flush()
    }

    /// Advance the tail to `lsn` by emitting a TRIM record (spec §4.5).
    pub fn trim(&self, lsn: u64) -> Result<()> {
        let payload = lsn.to_le_bytes().to_vec();
        self.write(TYPE_TRIM, false, payload, None)?;
        self.state.lock().tail = lsn;
        Ok(())
    }

    pub fn odometer(&self) -> u64 {
        self.state.lock().odometer
    }

    pub fn clear_odometer(&self) {
        self.state.lock().odometer = 0;
    }

    pub fn peek_next_lsn(&self) -> u64 {
        self.state.lock().head
    }

    pub fn tail_lsn(&self) -> u64 {
        self.state.lock().tail
    }

    /// Client records with `tail <= lsn < head`, oldest first.
    pub fn read_forward(&self) -> Result<Vec<RawRecord>> {
        let (tail, head) = {
            let state = self.state.lock();
            (state.tail, state.head)
        };
        let mut records: Vec<RawRecord> = self
            .scan_all()?
            .into_iter()
            .map(|(r, _, _)| r)
            .filter(|r| r.is_client && r.lsn >= tail && r.lsn < head)
            .collect();
        records.sort_by_key(|r| r.lsn);
        Ok(records)
    }

    /// Client records with `tail <= lsn < head`, newest first.
    pub fn read_reverse(&self) -> Result<Vec<RawRecord>> {
        let mut records = self.read_forward()?;
        records.reverse();
        Ok(records)
    }
}
