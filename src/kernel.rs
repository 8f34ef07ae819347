//! The kernel root: owns the singleton coremap/TLB state explicitly rather
//! than through ambient globals (spec §9: "model them as explicit state
//! owned by the kernel root; pass references rather than relying on ambient
//! globals... initialise once at bootstrap").
//!
//! Grounded in `examples/ryanbreen-breenix/kernel/src/memory/mod.rs`'s
//! `init()`, which builds the frame allocator and heap once at boot and
//! hands out references to the rest of the kernel from then on.

use std::sync::Arc;

use crate::block::BlockDevice;
use crate::config::Config;
use crate::error::Result;
use crate::memory::addrspace::AddressSpace;
use crate::memory::coremap::Coremap;
use crate::memory::tlb::Tlb;

/// Everything a running instance of this operating system core needs beyond
/// a single address space: the physical frame table and the TLB. A real
/// kernel would also own the scheduler and device drivers; those are out of
/// scope (spec.md §1 Non-goals).
pub struct Kernel<D: BlockDevice> {
    pub coremap: Coremap<D>,
    pub tlb: Tlb,
    config: Config,
}

impl<D: BlockDevice> Kernel<D> {
    /// Bring up the coremap and TLB from `config`, backed by `swap_device`.
    pub fn new(config: Config, swap_device: D) -> Result<Self> {
        let coremap = Coremap::new(&config, swap_device)?;
        let tlb = Tlb::new(config.cpu_count);
        log::info!(
            "kernel: initialised coremap_frames={} swap_pages={} policy={:?}",
            config.coremap_frames,
            config.swap_pages,
            config.eviction_policy,
        );
        Ok(Kernel { coremap, tlb, config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A fresh, empty address space sized per this kernel's stack reservation.
    pub fn new_address_space(&self) -> Arc<AddressSpace> {
        Arc::new(AddressSpace::create(self.config.stack_pages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemBlockDevice;
    use crate::memory::addr::PAGE_SIZE;

    #[test]
    fn new_kernel_reports_configured_frame_count() {
        let config = Config { coremap_frames: 8, swap_pages: 16, ..Config::default() };
        let dev = MemBlockDevice::new((16 * PAGE_SIZE / crate::block::BLOCK_SIZE) as u64);
        let kernel = Kernel::new(config, dev).unwrap();
        assert_eq!(kernel.coremap.num_frames(), 8);
    }

    #[test]
    fn new_address_space_starts_with_collapsed_heap() {
        let config = Config { coremap_frames: 4, swap_pages: 16, ..Config::default() };
        let dev = MemBlockDevice::new((16 * PAGE_SIZE / crate::block::BLOCK_SIZE) as u64);
        let kernel = Kernel::new(config, dev).unwrap();
        let aspace = kernel.new_address_space();
        assert_eq!(aspace.heap_bounds(), (0, 0));
    }
}
