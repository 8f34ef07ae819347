//! `vm_fault`: the demand-paging service path.
//!
//! Ported from spec §4.2's numbered service path, grounded in the same
//! `original_source/kern/vm/addrspace.c` permission-checking logic that
//! backs [`crate::memory::addrspace::AddressSpace::check_region`].

use std::sync::Arc;

use crate::block::BlockDevice;
use crate::error::Result;
use crate::kernel::Kernel;
use crate::memory::addr::VirtAddr;
use crate::memory::addrspace::{Access, AddressSpace};
use crate::memory::coremap::HeldL2;
use crate::memory::pagetable::decompose;
use crate::memory::tlb::TlbFlags;

/// The kind of fault the trap handler observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultType {
    Read,
    Write,
    /// The processor trapped because a resident page was marked clean; this
    /// must not trigger demand allocation (spec §4.2).
    ReadOnly,
}

/// Service a TLB miss or a read-only trap for `vaddr` in `aspace`.
pub fn vm_fault<D: BlockDevice>(
    kernel: &Kernel<D>,
    aspace: &Arc<AddressSpace>,
    fault_type: FaultType,
    vaddr: VirtAddr,
) -> Result<()> {
    let access = match fault_type {
        FaultType::Read => Access::Read,
        FaultType::Write | FaultType::ReadOnly => Access::Write,
    };
    aspace.check_region(vaddr, access)?;

    let (l1, l2) = decompose(vaddr);
    let vpn = vaddr.vpn();

    let mut guard = aspace.page_table.lock_l2(l1);

    if fault_type == FaultType::ReadOnly {
        let l2t = guard.as_mut().expect("just allocated");
        let entry = &mut l2t.entries[l2];
        let frame = entry.frame.expect("ReadOnly fault on a non-resident page");
        kernel.coremap.set_dirty(frame);
        kernel.tlb.rewrite(vpn, frame, TlbFlags { valid: true, writable: true });
        return Ok(());
    }

    let allocated = guard.as_ref().unwrap().entries[l2].allocated;
    let in_memory = guard.as_ref().unwrap().entries[l2].in_memory;

    // `alloc_user`/`load_user` may need to evict a page belonging to a
    // different address space, which means locking a second, distinct L2
    // lock. Hand our own guard down as `held` so that call can release and
    // reacquire it per the deadlock rule (spec §4.1/§5 rule 1) instead of
    // the two locks ever being acquired out of order.
    let frame = if in_memory {
        guard.as_ref().unwrap().entries[l2].frame.expect("in_memory entry missing frame")
    } else if !allocated {
        let slot = kernel.coremap.swap().alloc_index()?;
        {
            let entry = &mut guard.as_mut().unwrap().entries[l2];
            entry.swap_slot = Some(slot);
            entry.allocated = true;
        }
        let mut held = HeldL2 { aspace, l1_index: l1, guard: Some(guard) };
        let frame = kernel.coremap.alloc_user(aspace, vpn, &kernel.tlb, Some(&mut held))?;
        guard = held.guard.take().expect("do_evict always hands the holder's lock back");
        let entry = &mut guard.as_mut().unwrap().entries[l2];
        entry.frame = Some(frame);
        entry.in_memory = true;
        frame
    } else {
        let slot = guard.as_ref().unwrap().entries[l2].swap_slot.expect("allocated entry missing swap slot");
        let mut held = HeldL2 { aspace, l1_index: l1, guard: Some(guard) };
        let frame = kernel.coremap.load_user(aspace, vpn, slot, &kernel.tlb, Some(&mut held))?;
        guard = held.guard.take().expect("do_evict always hands the holder's lock back");
        let entry = &mut guard.as_mut().unwrap().entries[l2];
        entry.frame = Some(frame);
        entry.in_memory = true;
        frame
    };
    drop(guard);

    kernel.coremap.clear_busy(frame);
    kernel.tlb.write_random(vpn, frame, TlbFlags { valid: true, writable: false });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemBlockDevice;
    use crate::config::Config;
    use crate::memory::addr::PAGE_SIZE;

    fn make_kernel(frames: usize) -> Kernel<MemBlockDevice> {
        let config = Config { coremap_frames: frames, swap_pages: 16, ..Config::default() };
        let swap_dev = MemBlockDevice::new((16 * PAGE_SIZE / crate::block::BLOCK_SIZE) as u64);
        Kernel::new(config, swap_dev).unwrap()
    }

    #[test]
    fn fault_outside_any_region_is_a_fault_error() {
        let kernel = make_kernel(4);
        let aspace = kernel.new_address_space();
        assert_eq!(
            vm_fault(&kernel, &aspace, FaultType::Read, VirtAddr::new(0x9999_0000)).unwrap_err(),
            crate::error::Error::Fault
        );
    }

    #[test]
    fn first_touch_zero_fills_and_installs_tlb_entry() {
        let kernel = make_kernel(4);
        let aspace = kernel.new_address_space();
        aspace.define_region(VirtAddr::new(0x0040_0000), 0x10_0000, true, true, false);
        let vaddr = VirtAddr::new(0x0040_1000);
        vm_fault(&kernel, &aspace, FaultType::Read, vaddr).unwrap();
        assert!(kernel.tlb.probe(vaddr.vpn()).is_some());
    }

    #[test]
    fn write_fault_to_readonly_region_errors() {
        let kernel = make_kernel(4);
        let aspace = kernel.new_address_space();
        aspace.define_region(VirtAddr::new(0x0040_0000), 0x10_0000, true, false, false);
        let vaddr = VirtAddr::new(0x0040_1000);
        assert_eq!(vm_fault(&kernel, &aspace, FaultType::Write, vaddr).unwrap_err(), crate::error::Error::Fault);
    }

    #[test]
    fn evict_and_fault_back_preserves_data() {
        // Scenario 1 from spec §8: two pages, one physical frame, data survives.
        let kernel = make_kernel(1);
        let aspace = kernel.new_address_space();
        aspace.define_region(VirtAddr::new(0x0040_0000), 0x10_0000, true, true, false);
        let v1 = VirtAddr::new(0x0040_1000);
        let v2 = VirtAddr::new(0x0040_2000);

        vm_fault(&kernel, &aspace, FaultType::Write, v1).unwrap();
        let frame1 = kernel.tlb.probe(v1.vpn()).unwrap().0;
        kernel.coremap.with_frame(frame1, |b| b[0] = 0xAA);
        kernel.coremap.set_dirty(frame1);

        vm_fault(&kernel, &aspace, FaultType::Write, v2).unwrap();
        let frame2 = kernel.tlb.probe(v2.vpn()).unwrap().0;
        kernel.coremap.with_frame(frame2, |b| b[0] = 0xBB);
        kernel.coremap.set_dirty(frame2);

        vm_fault(&kernel, &aspace, FaultType::Read, v1).unwrap();
        let frame1_again = kernel.tlb.probe(v1.vpn()).unwrap().0;
        kernel.coremap.with_frame(frame1_again, |b| assert_eq!(b[0], 0xAA));
    }
}
