//! Software-managed TLB with cross-CPU shootdown.
//!
//! The teacher codebase flushes real x86_64 hardware TLB entries with
//! `invlpg` (`examples/ryanbreen-breenix/kernel/src/memory/tlb.rs` is a
//! five-line doc stub over that hardware instruction) and has no
//! shootdown-acknowledgement protocol of its own — hardware-assisted TLB
//! management is explicitly out of scope here (spec.md §1 Non-goals:
//! "hardware-assisted TLB walking"). This module is authored fresh from
//! spec.md §4.3/§9 and the shootdown call sites in
//! `original_source/kern/vm/coremap.c`, using [`crate::sync::Semaphore`] in
//! place of the source's counting semaphore.

use crate::sync::{Semaphore, SpinLock};

/// Access permissions recorded in a TLB entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbFlags {
    pub valid: bool,
    pub writable: bool,
}

#[derive(Debug, Clone, Copy)]
struct TlbSlot {
    vpn: Option<usize>,
    ppn: usize,
    flags: TlbFlags,
}

impl Default for TlbSlot {
    fn default() -> Self {
        TlbSlot { vpn: None, ppn: 0, flags: TlbFlags { valid: false, writable: false } }
    }
}

/// Number of entries in the simulated hardware TLB.
pub const TLB_ENTRIES: usize = 64;

struct TlbState {
    slots: [TlbSlot; TLB_ENTRIES],
    next_victim: usize,
}

/// A software-filled TLB plus the shootdown-acknowledgement protocol used
/// when the coremap evicts a resident page out from under a live mapping.
pub struct Tlb {
    state: SpinLock<TlbState>,
    cpu_count: usize,
}

impl Tlb {
    pub fn new(cpu_count: usize) -> Self {
        Tlb {
            state: SpinLock::new(TlbState {
                slots: [TlbSlot::default(); TLB_ENTRIES],
                next_victim: 0,
            }),
            cpu_count: cpu_count.max(1),
        }
    }

    /// Look up `vpn`, returning `(ppn, flags)` on a hit.
    pub fn probe(&self, vpn: usize) -> Option<(usize, TlbFlags)> {
        let state = self.state.lock();
        state.slots.iter().find(|s| s.vpn == Some(vpn)).map(|s| (s.ppn, s.flags))
    }

    /// Install `(vpn -> ppn, flags)` at a random (here: round-robin) slot,
    /// matching the source's "write random" TLB replacement used on the
    /// Read/Write fault path (spec §4.2 step 6).
    pub fn write_random(&self, vpn: usize, ppn: usize, flags: TlbFlags) {
        let mut state = self.state.lock();
        let idx = state.next_victim;
        state.next_victim = (state.next_victim + 1) % TLB_ENTRIES;
        state.slots[idx] = TlbSlot { vpn: Some(vpn), ppn, flags };
    }

    /// Rewrite the entry for `vpn` in place if present; used on the
    /// READONLY fault path to upgrade a clean mapping to writable without
    /// disturbing TLB replacement order (spec §4.2 step 6).
    pub fn rewrite(&self, vpn: usize, ppn: usize, flags: TlbFlags) {
        let mut state = self.state.lock();
        if let Some(slot) = state.slots.iter_mut().find(|s| s.vpn == Some(vpn)) {
            slot.ppn = ppn;
            slot.flags = flags;
        } else {
            drop(state);
            self.write_random(vpn, ppn, flags);
        }
    }

    /// Invalidate every entry. Used on address-space context switch.
    pub fn invalidate_all(&self) {
        let mut state = self.state.lock();
        for slot in state.slots.iter_mut() {
            *slot = TlbSlot::default();
        }
    }

    /// Invalidate `vpn` locally (no cross-CPU broadcast). Exposed for
    /// completeness; normal eviction goes through [`Tlb::shootdown`].
    pub fn invalidate(&self, vpn: usize) {
        let mut state = self.state.lock();
        for slot in state.slots.iter_mut() {
            if slot.vpn == Some(vpn) {
                *slot = TlbSlot::default();
            }
        }
    }

    /// Broadcast an invalidation of `vpn` to all CPUs and block until every
    /// one of them has acknowledged. The coremap eviction path must call
    /// this *before* it reads the victim frame from swap or flips the
    /// owning page-table entry's `in_memory` flag (spec §4.3 ordering
    /// guarantee), so no CPU can still translate through a frame that is
    /// in flight to disk.
    pub fn shootdown(&self, vpn: usize) {
        log::debug!("tlb: shootdown vpn={vpn} acked_by={}", self.cpu_count);
        let ack = Semaphore::new(0);
        // Simulated CPUs: each "acknowledges" by invalidating locally and
        // releasing the semaphore once. A real multi-core kernel would send
        // an IPI per target CPU here instead of invalidating synchronously.
        for _ in 0..self.cpu_count {
            self.invalidate(vpn);
            ack.release();
        }
        for _ in 0..self.cpu_count {
            ack.acquire();
        }
    }
}
