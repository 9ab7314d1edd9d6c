#![cfg_attr(not(test), no_std)]

//! Boot-time page-table manager for the application cores and the
//! inter-processor message protocol it uses to borrow physical memory from
//! the power-management core.
//!
//! Everything here runs on one core before any scheduler exists. The remote
//! peer owns the DDR free lists, so every 64KB chunk the translation tables
//! live in is requested over the IPI3 channel.

pub mod boot;
pub mod cache;
pub mod ipi;
pub mod logger;
pub mod memory_map;
pub mod mmu;
pub mod os_services;
pub mod phys;
pub mod units;

#[cfg(test)]
pub(crate) mod testing;

pub use mmu::{Manager, MmuError, PageType};
pub use os_services::{OsServices, RemoteError};
pub use phys::PhysAddr;

/// Typed view of a memory mapped register block at a fixed address.
#[derive(Debug)]
pub struct MMIODerefWrapper<T> {
    addr: usize,
    _phantom: core::marker::PhantomData<T>,
}

impl<T> MMIODerefWrapper<T> {
    /// # Safety
    ///
    /// `addr` must point at a live, correctly aligned instance of `T` for as
    /// long as the wrapper is used.
    pub const unsafe fn new(addr: usize) -> Self {
        MMIODerefWrapper {
            addr,
            _phantom: core::marker::PhantomData,
        }
    }

    pub const fn addr(&self) -> usize {
        self.addr
    }
}

impl<T> core::ops::Deref for MMIODerefWrapper<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe {
            &*(self.addr as *const _)
        }
    }
}

// Only touched from the boot core; the handshake bits serialise access with the peer.
unsafe impl<T> Send for MMIODerefWrapper<T> {}
