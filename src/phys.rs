use core::fmt;
use core::ops::{Add, Sub};

/// A physical address.
///
/// Translation tables are identity mapped, so a `PhysAddr` is also the
/// virtual address the tables describe. It is only turned into something
/// dereferenceable through a [`PhysMemory`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    pub const fn new(addr: u64) -> Self {
        PhysAddr(addr)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Round down to a power-of-two `align`.
    pub const fn align_down(self, align: u64) -> Self {
        PhysAddr(self.0 & !(align - 1))
    }

    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }
}

impl Add<u64> for PhysAddr {
    type Output = PhysAddr;

    fn add(self, rhs: u64) -> PhysAddr {
        PhysAddr(self.0 + rhs)
    }
}

impl Sub<PhysAddr> for PhysAddr {
    type Output = u64;

    fn sub(self, rhs: PhysAddr) -> u64 {
        self.0 - rhs.0
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Where physical memory becomes host memory.
///
/// # Safety
///
/// `host_ptr` must return a pointer that is valid for reads and writes of the
/// whole 64KB chunk containing `pa`, and the same chunk must always map to the
/// same host memory.
pub unsafe trait PhysMemory {
    fn host_ptr(&self, pa: PhysAddr) -> *mut u8;
}

/// Physical memory accessed directly, for code running with a flat
/// (identity or MMU-off) view of memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityMapped;

unsafe impl PhysMemory for IdentityMapped {
    fn host_ptr(&self, pa: PhysAddr) -> *mut u8 {
        pa.as_u64() as usize as *mut u8
    }
}
