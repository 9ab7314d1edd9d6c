//! Calls into the OS service firmware running on the PMU.
//!
//! The PMU owns the DDR free lists, the debug console and power control.
//! Everything here is a thin typed wrapper around one IPI3 frame.

use core::fmt;
use thiserror_no_std::Error;

use crate::ipi::frame::{
    BlockAlloc, BlockFree, BootData, CpuWakeOrSleep, DeviceWakeOrSleep, InlineText, Request,
    Response, ResponseResult, INLINE_TEXT_MAX,
};
use crate::ipi::Transport;
use crate::memory_map::{DDR_HI_BASE, DDR_LO_BASE};
use crate::phys::PhysAddr;
use crate::units::KIB;

pub use crate::ipi::frame::{Cpus, ServiceTag};

pub const BLOCK_SIZE: u64 = 64 * KIB;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("unknown failure")]
    UnknownFailure,
    #[error("out of memory")]
    OutOfMemory,
    #[error("bad parameters")]
    BadParameters,
    #[error("not available on this core")]
    Unsupported,
}

impl RemoteError {
    fn check(result: ResponseResult) -> Result<(), RemoteError> {
        match result {
            ResponseResult::Success => Ok(()),
            ResponseResult::UnknownFailure => Err(RemoteError::UnknownFailure),
            ResponseResult::OutOfMemory => Err(RemoteError::OutOfMemory),
            ResponseResult::BadParameters => Err(RemoteError::BadParameters),
        }
    }
}

/// One of the two DDR ranges the peer hands out blocks from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DdrWindow {
    /// Below 4GB, addressable by every core.
    Low,
    /// Above 32GB, needs 64-bit physical addressing.
    High,
}

impl DdrWindow {
    pub const fn base(self) -> PhysAddr {
        match self {
            DdrWindow::Low => DDR_LO_BASE,
            DdrWindow::High => DDR_HI_BASE,
        }
    }

    const fn reachable() -> bool {
        cfg!(target_pointer_width = "64")
    }
}

impl fmt::Display for DdrWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DdrWindow::Low => f.write_str("ddr lo"),
            DdrWindow::High => f.write_str("ddr hi"),
        }
    }
}

/// Source of 64KB physical blocks.
pub trait BlockAllocator {
    fn alloc_blocks(
        &mut self,
        window: DdrWindow,
        count: u32,
        tag: ServiceTag,
    ) -> Result<PhysAddr, RemoteError>;

    /// Frees are never acknowledged. Returning blocks that were not handed out
    /// corrupts the peer's free list.
    fn free_blocks(&mut self, window: DdrWindow, addr: PhysAddr, count: u32, tag: ServiceTag);
}

impl<B: BlockAllocator + ?Sized> BlockAllocator for &mut B {
    fn alloc_blocks(
        &mut self,
        window: DdrWindow,
        count: u32,
        tag: ServiceTag,
    ) -> Result<PhysAddr, RemoteError> {
        (**self).alloc_blocks(window, count, tag)
    }

    fn free_blocks(&mut self, window: DdrWindow, addr: PhysAddr, count: u32, tag: ServiceTag) {
        (**self).free_blocks(window, addr, count, tag)
    }
}

pub struct OsServices<T: Transport> {
    transport: T,
}

impl<T: Transport> OsServices<T> {
    pub const fn new(transport: T) -> Self {
        OsServices { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    fn call(&mut self, request: &Request) -> Response {
        debug_assert!(!request.is_fire_and_forget());
        Response::decode(&self.transport.submit_and_fetch(&request.encode()))
    }

    fn post(&mut self, request: &Request) {
        debug_assert!(request.is_fire_and_forget());
        self.transport.submit(&request.encode());
    }

    pub fn try_alloc_low(
        &mut self,
        blocks_64kb: u32,
        tag: ServiceTag,
    ) -> Result<PhysAddr, RemoteError> {
        self.try_alloc(DdrWindow::Low, blocks_64kb, tag)
    }

    pub fn try_alloc_high(
        &mut self,
        blocks_64kb: u32,
        tag: ServiceTag,
    ) -> Result<PhysAddr, RemoteError> {
        self.try_alloc(DdrWindow::High, blocks_64kb, tag)
    }

    pub fn alloc_low(&mut self, blocks_64kb: u32, tag: ServiceTag) -> Option<PhysAddr> {
        self.try_alloc_low(blocks_64kb, tag).ok()
    }

    pub fn alloc_high(&mut self, blocks_64kb: u32, tag: ServiceTag) -> Option<PhysAddr> {
        self.try_alloc_high(blocks_64kb, tag).ok()
    }

    pub fn free_low(&mut self, addr: PhysAddr, blocks_64kb: u32, tag: ServiceTag) {
        self.free(DdrWindow::Low, addr, blocks_64kb, tag)
    }

    pub fn free_high(&mut self, addr: PhysAddr, blocks_64kb: u32, tag: ServiceTag) {
        self.free(DdrWindow::High, addr, blocks_64kb, tag)
    }

    fn try_alloc(
        &mut self,
        window: DdrWindow,
        blocks_64kb: u32,
        tag: ServiceTag,
    ) -> Result<PhysAddr, RemoteError> {
        let request = BlockAlloc { blocks_64kb, tag };
        let request = match window {
            DdrWindow::Low => Request::DdrLoBlockAlloc(request),
            DdrWindow::High if DdrWindow::reachable() => Request::DdrHiBlockAlloc(request),
            DdrWindow::High => return Err(RemoteError::Unsupported),
        };

        let response = self.call(&request);
        if let Err(err) = RemoteError::check(response.result) {
            log::warn!("{} block alloc of {} failed: {}", window, blocks_64kb, err);
            return Err(err);
        }

        let addr = window.base() + u64::from(response.block_offset());
        log::debug!("{} alloc {} blocks for {:?} at {}", window, blocks_64kb, tag, addr);
        Ok(addr)
    }

    fn free(&mut self, window: DdrWindow, addr: PhysAddr, blocks_64kb: u32, tag: ServiceTag) {
        if window == DdrWindow::High && !DdrWindow::reachable() {
            return;
        }

        let offset = u32::try_from(addr - window.base());
        let block_count = u16::try_from(blocks_64kb);
        let (Ok(offset), Ok(block_count)) = (offset, block_count) else {
            panic!("{} free of {} blocks at {} does not fit a frame", window, blocks_64kb, addr);
        };

        log::debug!("{} free {} blocks for {:?} at {}", window, blocks_64kb, tag, addr);
        let free = BlockFree { block_count, offset, tag };
        self.post(&match window {
            DdrWindow::Low => Request::DdrLoBlockFree(free),
            DdrWindow::High => Request::DdrHiBlockFree(free),
        });
    }

    /// Print at most 29 bytes on the peer's console. Longer text is cut.
    pub fn inline_print(&mut self, text: &[u8]) {
        let len = text.len().min(INLINE_TEXT_MAX);
        let mut inline = InlineText::new();
        inline.extend(text[..len].iter().copied());
        self.post(&Request::InlinePrint(inline));

        if len < text.len() {
            log::warn!("inline print cut {} bytes", text.len() - len);
        }
    }

    pub fn print(&mut self, text: &str) {
        for chunk in text.as_bytes().chunks(INLINE_TEXT_MAX) {
            self.inline_print(chunk);
        }
    }

    pub fn boot_complete(&mut self, data: &BootData) {
        self.post(&Request::BootComplete(*data));
    }

    pub fn fetch_boot_data(&mut self) -> Result<BootData, RemoteError> {
        let response = self.call(&Request::FetchBootData);
        RemoteError::check(response.result)?;
        Ok(response.boot_data())
    }

    pub fn sleep_cpus(&mut self, cpus: Cpus) {
        self.post(&Request::CpuWakeOrSleep(CpuWakeOrSleep {
            sleep: cpus,
            ..Default::default()
        }));
    }

    /// Power up `cpus`, which start executing at `wake_address`.
    pub fn wake_cpus(&mut self, cpus: Cpus, wake_address: u64) {
        self.post(&Request::CpuWakeOrSleep(CpuWakeOrSleep {
            wake: cpus,
            wake_address,
            ..Default::default()
        }));
    }

    pub fn sleep_fpga(&mut self) {
        self.post(&Request::DeviceWakeOrSleep(DeviceWakeOrSleep {
            sleep_fpga: true,
            wake_fpga: false,
        }));
    }

    pub fn wake_fpga(&mut self) {
        self.post(&Request::DeviceWakeOrSleep(DeviceWakeOrSleep {
            sleep_fpga: false,
            wake_fpga: true,
        }));
    }
}

impl<T: Transport> BlockAllocator for OsServices<T> {
    fn alloc_blocks(
        &mut self,
        window: DdrWindow,
        count: u32,
        tag: ServiceTag,
    ) -> Result<PhysAddr, RemoteError> {
        self.try_alloc(window, count, tag)
    }

    fn free_blocks(&mut self, window: DdrWindow, addr: PhysAddr, count: u32, tag: ServiceTag) {
        self.free(window, addr, count, tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimPeer;

    fn services() -> OsServices<SimPeer> {
        OsServices::new(SimPeer::new())
    }

    #[test]
    fn two_allocs_do_not_overlap() {
        let mut os = services();
        let tag = ServiceTag(0xAAAA);

        let a = os.alloc_low(1, tag).unwrap();
        let b = os.alloc_low(1, tag).unwrap();

        assert_ne!(a, b);
        assert!(a.is_aligned(BLOCK_SIZE));
        assert!(b.is_aligned(BLOCK_SIZE));
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        assert!(lo + BLOCK_SIZE <= hi);
        assert_eq!(os.transport().alloc_calls(), 2);
    }

    #[test]
    fn alloc_adds_window_base() {
        let mut os = services();
        let lo = os.try_alloc_low(1, ServiceTag::MMU).unwrap();
        let hi = os.try_alloc_high(1, ServiceTag::MMU).unwrap();

        assert!(lo < DDR_HI_BASE);
        assert!(hi >= DDR_HI_BASE);
        assert_eq!(
            os.transport().last_request(),
            Some(Request::DdrHiBlockAlloc(BlockAlloc {
                blocks_64kb: 1,
                tag: ServiceTag::MMU
            }))
        );
    }

    #[test]
    fn alloc_failure_maps_result() {
        let mut os = services();
        os.transport_mut().fail_with(ResponseResult::OutOfMemory);
        assert_eq!(os.try_alloc_low(4, ServiceTag::MMU), Err(RemoteError::OutOfMemory));
        assert_eq!(os.alloc_high(4, ServiceTag::MMU), None);

        os.transport_mut().fail_with(ResponseResult::BadParameters);
        assert_eq!(os.try_alloc_low(0, ServiceTag::MMU), Err(RemoteError::BadParameters));

        os.transport_mut().fail_with(ResponseResult::UnknownFailure);
        assert_eq!(os.try_alloc_low(1, ServiceTag::MMU), Err(RemoteError::UnknownFailure));
    }

    #[test]
    fn free_sends_offset_from_its_own_window() {
        let mut os = services();
        let addr = os.alloc_high(2, ServiceTag::MMU).unwrap();
        os.free_high(addr, 2, ServiceTag::MMU);

        assert_eq!(os.transport().free_calls(), 1);
        assert_eq!(
            os.transport().last_request(),
            Some(Request::DdrHiBlockFree(BlockFree {
                block_count: 2,
                offset: (addr - DDR_HI_BASE) as u32,
                tag: ServiceTag::MMU,
            }))
        );
    }

    #[test]
    fn free_is_fire_and_forget() {
        let mut os = services();
        let addr = os.alloc_low(1, ServiceTag::MMU).unwrap();
        let fetches = os.transport().fetches();

        os.free_low(addr, 1, ServiceTag::MMU);
        assert_eq!(os.transport().fetches(), fetches);
        assert_eq!(os.transport().submits(), 1);
    }

    #[test]
    fn print_splits_into_inline_frames() {
        let mut os = services();
        let text = "0123456789012345678901234567890123456789";
        os.print(text);

        let printed = os.transport().printed();
        assert_eq!(os.transport().submits(), 2);
        assert_eq!(printed.as_slice(), text.as_bytes());
    }

    #[test]
    fn inline_print_truncates() {
        let mut os = services();
        os.inline_print(&[b'x'; 40]);
        assert_eq!(os.transport().printed().len(), INLINE_TEXT_MAX);
    }

    #[test]
    fn boot_data_round_trip_through_peer() {
        let mut os = services();
        let data = BootData {
            mmu: 0x0010_0000,
            boot_code_start: 0xFFFC_0000,
            boot_code_size: 0x1_0000,
            video_block: 0,
        };
        os.boot_complete(&data);
        assert_eq!(os.fetch_boot_data(), Ok(data));
    }

    #[test]
    fn wake_cpus_carries_address() {
        let mut os = services();
        os.wake_cpus(Cpus::A53_1 | Cpus::A53_2, 0x1000);
        assert_eq!(
            os.transport().last_request(),
            Some(Request::CpuWakeOrSleep(CpuWakeOrSleep {
                sleep: Cpus::empty(),
                wake: Cpus::A53_1 | Cpus::A53_2,
                wake_address: 0x1000,
            }))
        );

        os.sleep_fpga();
        assert_eq!(
            os.transport().last_request(),
            Some(Request::DeviceWakeOrSleep(DeviceWakeOrSleep {
                sleep_fpga: true,
                wake_fpga: false,
            }))
        );
    }
}
