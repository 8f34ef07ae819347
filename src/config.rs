//! Build/runtime-pluggable knobs.
//!
//! Spec §1 Non-goals calls out a page-replacement policy "swappable at build
//! time"; rather than a Cargo feature flag (which would require separate
//! compiled artifacts for a choice that is really a runtime policy object),
//! this crate exposes [`EvictionPolicy`] as a [`Config`] field, matching how
//! the original source's `#ifdef PAGE_RANDOM`/`PAGE_CLOCK` selects one of two
//! `cm_choose_evict_page` implementations.

/// Frame eviction policy for the coremap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Pick a uniformly random eligible frame. Default.
    Random,
    /// Classic second-chance clock sweep over `used_recently`.
    Clock,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        EvictionPolicy::Random
    }
}

/// Runtime configuration for a [`crate::kernel::Kernel`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of physical frames the coremap manages.
    pub coremap_frames: usize,
    /// Number of page-sized slots on the swap device.
    pub swap_pages: usize,
    /// Pages reserved for the user stack, directly below `USERSTACK`.
    pub stack_pages: usize,
    /// Frame eviction policy.
    pub eviction_policy: EvictionPolicy,
    /// Bytes appended to the journal since the last checkpoint before an
    /// automatic `checkpoint()` is triggered.
    pub checkpoint_odometer_threshold: u64,
    /// Number of CPUs participating in TLB shootdown acknowledgement.
    pub cpu_count: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            coremap_frames: 256,
            swap_pages: 1024,
            stack_pages: 16,
            eviction_policy: EvictionPolicy::Random,
            checkpoint_odometer_threshold: 64 * 1024,
            cpu_count: 1,
        }
    }
}
