/// Data cache maintenance by address.
///
/// Used wherever another bus master reads memory this core may still hold in
/// its data cache.
pub trait CacheMaintenance {
    /// Clean and invalidate every cache line overlapping `[addr, addr + len)`.
    fn clean_invalidate(&self, addr: usize, len: usize);
}

pub const CACHE_LINE_SIZE: usize = 64;

/// Cortex-A53 maintenance through `dc civac`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataCache;

impl CacheMaintenance for DataCache {
    #[allow(unused_variables)]
    fn clean_invalidate(&self, addr: usize, len: usize) {
        #[cfg(target_arch = "aarch64")]
        {
            use aarch64_cpu::asm::barrier;

            let mut line = addr & !(CACHE_LINE_SIZE - 1);
            let end = addr + len;
            while line < end {
                unsafe {
                    core::arch::asm!("dc civac, {}", in(reg) line);
                }
                line += CACHE_LINE_SIZE;
            }
            barrier::dsb(barrier::SY);
        }
    }
}
