//! IPI3 message transport.
//!
//! Each agent owns a 0x200 byte region of the IPI buffer RAM, split into one
//! 64 byte slot per target agent: 32 bytes of request followed by 32 bytes of
//! response. The handshake uses the target's bit in the sender's TRIG and OBS
//! registers. OBS stays set from the trigger until the peer has written its
//! response and acknowledged.

use bitflags::bitflags;
use core::ptr::NonNull;
use tock_registers::{
    interfaces::{Readable, Writeable},
    register_structs,
    registers::{ReadOnly, WriteOnly},
};
use volatile::VolatilePtr;

use crate::cache::CacheMaintenance;
use crate::memory_map::{IPI_BASE, IPI_BUFFER_BASE};
use crate::MMIODerefWrapper;

pub mod frame;

pub use frame::{RawFrame, FRAME_SIZE};

pub const SLOT_SIZE: usize = 0x40;
pub const RESPONSE_OFFSET: usize = 0x20;

bitflags! {
    /// Channel bits as they appear in TRIG, OBS and the interrupt registers.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct IpiChannels: u32 {
        const CH0 = 1 << 0;
        const CH1 = 1 << 8;
        const CH2 = 1 << 9;
        const PMU_0 = 1 << 16;
        const PMU_1 = 1 << 17;
        const PMU_2 = 1 << 18;
        const PMU_3 = 1 << 19;
        const PL_0 = 1 << 24;
        const PL_1 = 1 << 25;
        const PL_2 = 1 << 26;
        const PL_3 = 1 << 27;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpiChannel {
    /// Application cores.
    Ch0,
    R5f0,
    R5f1,
    Pmu0,
    Pmu1,
    Pmu2,
    Pmu3,
    Pl0,
    Pl1,
    Pl2,
    Pl3,
}

impl IpiChannel {
    pub const fn mask(self) -> IpiChannels {
        match self {
            IpiChannel::Ch0 => IpiChannels::CH0,
            IpiChannel::R5f0 => IpiChannels::CH1,
            IpiChannel::R5f1 => IpiChannels::CH2,
            IpiChannel::Pmu0 => IpiChannels::PMU_0,
            IpiChannel::Pmu1 => IpiChannels::PMU_1,
            IpiChannel::Pmu2 => IpiChannels::PMU_2,
            IpiChannel::Pmu3 => IpiChannels::PMU_3,
            IpiChannel::Pl0 => IpiChannels::PL_0,
            IpiChannel::Pl1 => IpiChannels::PL_1,
            IpiChannel::Pl2 => IpiChannels::PL_2,
            IpiChannel::Pl3 => IpiChannels::PL_3,
        }
    }

    /// Base of this channel's TRIG/OBS/ISR register block.
    pub const fn register_base(self) -> usize {
        IPI_BASE
            + match self {
                IpiChannel::Ch0 => 0x0_0000,
                IpiChannel::R5f0 => 0x1_0000,
                IpiChannel::R5f1 => 0x2_0000,
                IpiChannel::Pmu0 => 0x3_0000,
                IpiChannel::Pmu1 => 0x3_1000,
                IpiChannel::Pmu2 => 0x3_2000,
                IpiChannel::Pmu3 => 0x3_3000,
                IpiChannel::Pl0 => 0x4_0000,
                IpiChannel::Pl1 => 0x5_0000,
                IpiChannel::Pl2 => 0x6_0000,
                IpiChannel::Pl3 => 0x7_0000,
            }
    }

    pub const fn agent(self) -> IpiAgent {
        match self {
            IpiChannel::Ch0 => IpiAgent::Apu,
            IpiChannel::R5f0 => IpiAgent::R5f0,
            IpiChannel::R5f1 => IpiAgent::R5f1,
            IpiChannel::Pmu0 | IpiChannel::Pmu1 | IpiChannel::Pmu2 | IpiChannel::Pmu3 => {
                IpiAgent::Pmu
            }
            IpiChannel::Pl0 => IpiAgent::Pl0,
            IpiChannel::Pl1 => IpiAgent::Pl1,
            IpiChannel::Pl2 => IpiAgent::Pl2,
            IpiChannel::Pl3 => IpiAgent::Pl3,
        }
    }
}

/// Owner of a region of the IPI buffer RAM.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum IpiAgent {
    Apu = 0,
    R5f0 = 1,
    R5f1 = 2,
    Pl0 = 3,
    Pl1 = 4,
    Pl2 = 5,
    Pl3 = 6,
    Pmu = 7,
}

impl IpiAgent {
    pub const fn slot_index(self) -> usize {
        self as usize
    }

    // The TRM lists these in channel order, which is wrong.
    pub const fn buffer_offset(self) -> usize {
        match self {
            IpiAgent::R5f0 => 0x000,
            IpiAgent::R5f1 => 0x200,
            IpiAgent::Apu => 0x400,
            IpiAgent::Pl0 => 0x600,
            IpiAgent::Pl1 => 0x800,
            IpiAgent::Pl2 => 0xA00,
            IpiAgent::Pl3 => 0xC00,
            IpiAgent::Pmu => 0xE00,
        }
    }
}

/// Which registers and buffer slot a core uses to reach the OS service peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpiRoute {
    /// Register block the sender owns.
    pub local: IpiChannel,
    /// Bit of the peer in the sender's TRIG/OBS.
    pub peer: IpiChannel,
    /// Buffer region the sender owns.
    pub buffer: IpiAgent,
    /// Slot of the peer inside that region.
    pub target: IpiAgent,
}

impl IpiRoute {
    pub const APU: IpiRoute = IpiRoute::to_os_services(IpiChannel::Ch0, IpiAgent::Apu);
    pub const R5F_0: IpiRoute = IpiRoute::to_os_services(IpiChannel::R5f0, IpiAgent::R5f0);
    pub const PMU: IpiRoute = IpiRoute::to_os_services(IpiChannel::Pmu3, IpiAgent::Pmu);

    const fn to_os_services(local: IpiChannel, buffer: IpiAgent) -> Self {
        IpiRoute {
            local,
            peer: IpiChannel::Pmu3,
            buffer,
            target: IpiAgent::Pmu,
        }
    }

    /// Offset of the request half of the slot from the buffer RAM base.
    pub const fn request_offset(&self) -> usize {
        self.buffer.buffer_offset() + self.target.slot_index() * SLOT_SIZE
    }

    pub const fn response_offset(&self) -> usize {
        self.request_offset() + RESPONSE_OFFSET
    }
}

register_structs! {
    pub IpiChannelRegisters {
        (0x00 => trig: WriteOnly<u32>),
        (0x04 => obs: ReadOnly<u32>),
        // ISR/IMR/IER/IDR, unused while polling.
        (0x08 => _reserved0),
        (0x20 => @END),
    }
}

/// Moves 32 byte frames to the OS service peer.
pub trait Transport {
    /// Post `msg` without waiting for the peer to consume it.
    fn submit(&mut self, msg: &RawFrame);

    /// Post `msg` and wait for the peer's response.
    fn submit_and_fetch(&mut self, msg: &RawFrame) -> RawFrame;
}

pub struct Ipi3Transport<C: CacheMaintenance> {
    regs: MMIODerefWrapper<IpiChannelRegisters>,
    buffer_base: usize,
    route: IpiRoute,
    cache: C,
}

impl<C: CacheMaintenance> Ipi3Transport<C> {
    /// # Safety
    ///
    /// Exchanges on one route must never interleave, and the IPI registers
    /// and buffer RAM must be accessible at their physical addresses.
    pub unsafe fn new(route: IpiRoute, cache: C) -> Self {
        Self::with_addresses(route.local.register_base(), IPI_BUFFER_BASE, route, cache)
    }

    /// # Safety
    ///
    /// `regs_base` must point at the register block of `route.local` and
    /// `buffer_base` at the IPI buffer RAM, both for the transport's lifetime.
    pub unsafe fn with_addresses(
        regs_base: usize,
        buffer_base: usize,
        route: IpiRoute,
        cache: C,
    ) -> Self {
        Ipi3Transport {
            regs: MMIODerefWrapper::new(regs_base),
            buffer_base,
            route,
            cache,
        }
    }

    pub fn route(&self) -> IpiRoute {
        self.route
    }

    /// Whether the peer still holds our slot.
    pub fn channel_busy(&self) -> bool {
        IpiChannels::from_bits_retain(self.regs.obs.get()).intersects(self.route.peer.mask())
    }

    /// Spins until the peer releases our slot.
    ///
    /// There is no timeout. A peer that never clears its observation bit hangs
    /// this core forever.
    pub fn wait_for_channel_clear(&self) {
        while self.channel_busy() {
            core::hint::spin_loop();
        }
    }

    fn slot(&self, offset: usize) -> VolatilePtr<'_, RawFrame> {
        let addr = self.buffer_base + offset;
        unsafe { VolatilePtr::new(NonNull::new_unchecked(addr as *mut RawFrame)) }
    }

    fn post(&mut self, msg: &RawFrame) {
        self.wait_for_channel_clear();

        let offset = self.route.request_offset();
        self.slot(offset).write(*msg);
        // The peer reads buffer RAM directly.
        self.cache.clean_invalidate(self.buffer_base + offset, FRAME_SIZE);

        self.regs.trig.set(self.route.peer.mask().bits());
    }
}

impl<C: CacheMaintenance> Transport for Ipi3Transport<C> {
    fn submit(&mut self, msg: &RawFrame) {
        self.post(msg);
    }

    fn submit_and_fetch(&mut self, msg: &RawFrame) -> RawFrame {
        self.post(msg);
        self.wait_for_channel_clear();

        let offset = self.route.response_offset();
        self.cache.clean_invalidate(self.buffer_base + offset, FRAME_SIZE);
        self.slot(offset).read()
    }
}
