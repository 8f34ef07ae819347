//! Address space lifecycle: regions, heap, create/copy/destroy.
//!
//! Ported from `original_source/kern/vm/addrspace.c`'s `as_create`,
//! `as_copy`, `as_destroy`, `as_define_region`, and `as_check_region`.

use crate::block::BlockDevice;
use crate::error::{Error, Result};
use crate::memory::addr::{VirtAddr, PAGE_SIZE};
use crate::memory::coremap::Coremap;
use crate::memory::pagetable::{decompose_vpn, PageTable, PageTableEntry, L2_BITS};
use crate::memory::tlb::Tlb;
use crate::sync::SleepLock;

/// Top of the user address space; the stack reservation sits directly below it.
pub const USERSTACK: usize = 0x8000_0000;

/// A mapped region: ELF segment or similar. Permissions gate [`AddressSpace::check_region`].
#[derive(Debug, Clone, Copy)]
pub struct Region {
    pub base: VirtAddr,
    pub size: usize,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
}

impl Region {
    fn end(&self) -> VirtAddr {
        self.base + self.size
    }
}

struct Layout {
    regions: Vec<Region>,
    heap_start: usize,
    heap_end: usize,
}

/// The kind of access that faulted, for the region-permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Execute,
}

/// Where a faulting address landed, for the caller (fault handler) to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Region,
    Heap,
    Stack,
}

/// One process's virtual address space: its page table, region list, and
/// heap bounds. Owns its page table exclusively (spec §5 "Shared-resource
/// policy"); the coremap and swap device are process-wide and passed in by
/// reference to operations that need them.
pub struct AddressSpace {
    pub page_table: PageTable,
    layout: SleepLock<Layout>,
    stack_pages: usize,
}

impl AddressSpace {
    /// An empty address space: no regions, heap collapsed to zero.
    pub fn create(stack_pages: usize) -> Self {
        AddressSpace {
            page_table: PageTable::new(),
            layout: SleepLock::new(Layout { regions: Vec::new(), heap_start: 0, heap_end: 0 }),
            stack_pages,
        }
    }

    /// Register a region (e.g. an ELF segment). Must be called before the
    /// heap has grown past its initial zero size — regions define where the
    /// heap's low-water mark sits, mirroring `as_define_region`'s tracking
    /// of `heap_start`/`heap_end` as "just past the highest region so far".
    pub fn define_region(&self, base: VirtAddr, size: usize, readable: bool, writable: bool, executable: bool) {
        let aligned_base = base.align_down(PAGE_SIZE);
        let aligned_size = (base.as_usize() - aligned_base.as_usize()) + size;
        let aligned_size = VirtAddr::new(aligned_size).align_up(PAGE_SIZE).as_usize();
        let region = Region { base: aligned_base, size: aligned_size, readable, writable, executable };
        let mut layout = self.layout.lock();
        let end = region.end().as_usize();
        if end > layout.heap_start {
            layout.heap_start = end;
            layout.heap_end = end;
        }
        layout.regions.push(region);
    }

    pub fn heap_bounds(&self) -> (usize, usize) {
        let layout = self.layout.lock();
        (layout.heap_start, layout.heap_end)
    }

    /// Grow (positive) or shrink (negative) the heap break. Returns the
    /// previous break, matching `sbrk`'s contract.
    pub fn sbrk(&self, delta: isize) -> Result<VirtAddr> {
        let mut layout = self.layout.lock();
        let old_end = layout.heap_end as isize;
        let new_end = old_end + delta;
        if new_end < layout.heap_start as isize {
            return Err(Error::Invalid);
        }
        let stack_floor = USERSTACK - self.stack_pages * PAGE_SIZE;
        if new_end as usize > stack_floor {
            return Err(Error::NoMemory);
        }
        layout.heap_end = new_end as usize;
        Ok(VirtAddr::new(old_end as usize))
    }

    /// Locate `vaddr` and check it against the requested access. Returns
    /// [`Error::Fault`] if the address is outside every region, the heap,
    /// and the stack window, or if the access violates region permissions
    /// (spec §9 Open Question 1: writes to a non-writable region fault).
    pub fn check_region(&self, vaddr: VirtAddr, access: Access) -> Result<Placement> {
        let layout = self.layout.lock();
        for region in &layout.regions {
            if vaddr >= region.base && vaddr < region.end() {
                let allowed = match access {
                    Access::Read => region.readable,
                    Access::Write => region.writable,
                    Access::Execute => region.executable,
                };
                return if allowed { Ok(Placement::Region) } else { Err(Error::Fault) };
            }
        }
        if vaddr.as_usize() >= layout.heap_start && vaddr.as_usize() < layout.heap_end {
            return Ok(Placement::Heap);
        }
        let stack_floor = USERSTACK - self.stack_pages * PAGE_SIZE;
        if vaddr.as_usize() >= stack_floor && vaddr.as_usize() < USERSTACK {
            return Ok(Placement::Stack);
        }
        Err(Error::Fault)
    }

    /// Deep-copy this address space: every allocated page gets a fresh swap
    /// slot holding a copy of its current contents (resident or swapped),
    /// and the new entry is born `allocated ∧ ¬in_memory` (`as_copy`).
    pub fn copy<D: BlockDevice>(&self, coremap: &Coremap<D>, tlb: &Tlb) -> Result<AddressSpace> {
        let new_as = {
            let layout = self.layout.lock();
            AddressSpace {
                page_table: PageTable::new(),
                layout: SleepLock::new(Layout {
                    regions: layout.regions.clone(),
                    heap_start: layout.heap_start,
                    heap_end: layout.heap_end,
                }),
                stack_pages: self.stack_pages,
            }
        };

        for l1 in 0..self.page_table.len_l1() {
            let mut old_guard = self.page_table.try_lock_l2(l1);
            let Some(old_l2) = old_guard.as_mut() else { continue };
            let mut new_guard = new_as.page_table.lock_l2(l1);
            let new_l2 = new_guard.as_mut().expect("just allocated");
            for l2 in 0..old_l2.entries.len() {
                let old_entry = old_l2.entries[l2];
                if !old_entry.allocated {
                    continue;
                }
                let vpn = (l1 << L2_BITS) | l2;
                tlb.invalidate(vpn);
                let new_slot = coremap.swap().alloc_index()?;
                if old_entry.in_memory {
                    let frame = old_entry.frame.expect("resident entry missing frame");
                    coremap.copy_frame_to_swap(frame, new_slot)?;
                } else {
                    let old_slot = old_entry.swap_slot.expect("allocated entry missing swap slot");
                    let mut buf = vec![0u8; PAGE_SIZE];
                    coremap.swap().read_page(old_slot, &mut buf)?;
                    coremap.swap().write_page(new_slot, &buf)?;
                }
                new_l2.entries[l2] =
                    PageTableEntry { frame: None, swap_slot: Some(new_slot), in_memory: false, allocated: true };
            }
        }
        Ok(new_as)
    }

    /// Free every resident frame and swap slot this address space holds.
    pub fn destroy<D: BlockDevice>(&self, coremap: &Coremap<D>) {
        for l1 in 0..self.page_table.len_l1() {
            let mut guard = self.page_table.try_lock_l2(l1);
            let Some(l2) = guard.as_mut() else { continue };
            for entry in l2.entries.iter_mut() {
                if !entry.allocated {
                    continue;
                }
                if entry.in_memory {
                    let frame = entry.frame.expect("resident entry missing frame");
                    coremap.dealloc(frame);
                } else if let Some(slot) = entry.swap_slot {
                    coremap.swap().dealloc_index(slot);
                }
                *entry = PageTableEntry::default();
            }
        }
    }

    pub fn vpn_to_vaddr(l1: usize, l2: usize) -> VirtAddr {
        VirtAddr::new(((l1 << L2_BITS) | l2) * PAGE_SIZE)
    }

    #[cfg(test)]
    pub(crate) fn entry_at(&self, vaddr: VirtAddr) -> PageTableEntry {
        let (l1, l2) = decompose_vpn(vaddr.vpn());
        let guard = self.page_table.try_lock_l2(l1);
        guard.as_ref().map(|l2t| l2t.entries[l2]).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_region_faults_outside_everything() {
        let aspace = AddressSpace::create(4);
        assert_eq!(aspace.check_region(VirtAddr::new(0x1000), Access::Read).unwrap_err(), Error::Fault);
    }

    #[test]
    fn check_region_allows_readable_region() {
        let aspace = AddressSpace::create(4);
        aspace.define_region(VirtAddr::new(0x1000), PAGE_SIZE, true, false, false);
        assert_eq!(aspace.check_region(VirtAddr::new(0x1000), Access::Read).unwrap(), Placement::Region);
    }

    #[test]
    fn check_region_faults_write_to_readonly_region() {
        let aspace = AddressSpace::create(4);
        aspace.define_region(VirtAddr::new(0x1000), PAGE_SIZE, true, false, false);
        assert_eq!(aspace.check_region(VirtAddr::new(0x1000), Access::Write).unwrap_err(), Error::Fault);
    }

    #[test]
    fn sbrk_grows_then_shrinks() {
        let aspace = AddressSpace::create(4);
        aspace.define_region(VirtAddr::new(0x1000), PAGE_SIZE, true, true, false);
        let (start, end) = aspace.heap_bounds();
        assert_eq!(start, end);
        let old = aspace.sbrk(8192).unwrap();
        assert_eq!(old.as_usize(), start);
        let (_, new_end) = aspace.heap_bounds();
        assert_eq!(new_end, start + 8192);
        let old2 = aspace.sbrk(-4096).unwrap();
        assert_eq!(old2.as_usize(), start + 8192);
    }

    #[test]
    fn sbrk_rejects_shrink_below_heap_start() {
        let aspace = AddressSpace::create(4);
        aspace.define_region(VirtAddr::new(0x1000), PAGE_SIZE, true, true, false);
        assert_eq!(aspace.sbrk(-1).unwrap_err(), Error::Invalid);
    }

    #[test]
    fn stack_window_is_accessible() {
        let aspace = AddressSpace::create(4);
        let vaddr = VirtAddr::new(USERSTACK - PAGE_SIZE);
        assert_eq!(aspace.check_region(vaddr, Access::Write).unwrap(), Placement::Stack);
    }
}
