//! EL3 translation control registers.

use tock_registers::{
    interfaces::{Readable, Writeable},
    register_bitfields,
    registers::InMemoryRegister,
};

/// Writes to the registers that control translation.
///
/// Kept behind a trait so the enable sequence can be checked off target.
pub trait TranslationRegisters {
    fn write_sctlr(&mut self, value: u64);
    fn write_tcr(&mut self, value: u64);
    fn write_mair(&mut self, value: u64);
    fn write_ttbr0(&mut self, value: u64);
    /// Invalidate every EL3 TLB entry.
    fn invalidate_tlb(&mut self);
    /// dsb then isb.
    fn barrier(&mut self);
}

register_bitfields! {
    u64,

    TCR_EL3 [
        // 64 - VA bits
        T0SZ    OFFSET(0)   NUMBITS(6)  [],
        TG0     OFFSET(14)  NUMBITS(2)  [
            KiB_4 = 0b00,
            KiB_64 = 0b01,
            KiB_16 = 0b10,
        ],
        PS      OFFSET(16)  NUMBITS(3)  [
            Bits_32 = 0b000,
            Bits_36 = 0b001,
            Bits_40 = 0b010,
        ],
        // Top byte ignored
        TBI     OFFSET(20)  NUMBITS(1)  [],
    ],

    SCTLR_EL3 [
        M       OFFSET(0)   NUMBITS(1)  [],
        A       OFFSET(1)   NUMBITS(1)  [],
        SA      OFFSET(3)   NUMBITS(1)  [],
    ],

    MAIR_EL3 [
        ATTR0   OFFSET(0)   NUMBITS(8)  [],
        ATTR1   OFFSET(8)   NUMBITS(8)  [],
        ATTR2   OFFSET(16)  NUMBITS(8)  [],
        ATTR3   OFFSET(24)  NUMBITS(8)  [],
        ATTR4   OFFSET(32)  NUMBITS(8)  [],
    ],
}

const VA_BITS: u64 = 36;

pub fn tcr() -> u64 {
    let reg = InMemoryRegister::<u64, TCR_EL3::Register>::new(0);
    reg.write(
        TCR_EL3::T0SZ.val(64 - VA_BITS)
            + TCR_EL3::TG0::KiB_4
            + TCR_EL3::PS::Bits_36
            + TCR_EL3::TBI::SET,
    );
    reg.get()
}

/// Memory types in descriptor ATTR_INDEX order.
pub fn mair() -> u64 {
    let reg = InMemoryRegister::<u64, MAIR_EL3::Register>::new(0);
    reg.write(
        // Normal, inner/outer non-cacheable
        MAIR_EL3::ATTR0.val(0x44)
            // Normal, inner/outer write-back RA/WA
            + MAIR_EL3::ATTR1.val(0xFF)
            + MAIR_EL3::ATTR2.val(0x00) // Device-nGnRnE
            + MAIR_EL3::ATTR3.val(0x04) // Device-nGnRE
            // Normal, inner/outer write-through RA/WA
            + MAIR_EL3::ATTR4.val(0xBB),
    );
    reg.get()
}

pub fn sctlr(mmu_on: bool) -> u64 {
    let reg = InMemoryRegister::<u64, SCTLR_EL3::Register>::new(0);
    if mmu_on {
        reg.write(SCTLR_EL3::M::SET + SCTLR_EL3::SA::SET + SCTLR_EL3::A::CLEAR);
    } else {
        reg.write(SCTLR_EL3::M::CLEAR);
    }
    reg.get()
}

/// The registers of the core this runs on.
#[derive(Debug, Default)]
pub struct El3;

#[allow(unused_variables)]
impl TranslationRegisters for El3 {
    fn write_sctlr(&mut self, value: u64) {
        #[cfg(target_arch = "aarch64")]
        unsafe {
            core::arch::asm!("msr sctlr_el3, {}", in(reg) value);
        }
    }

    fn write_tcr(&mut self, value: u64) {
        #[cfg(target_arch = "aarch64")]
        unsafe {
            core::arch::asm!("msr tcr_el3, {}", in(reg) value);
        }
    }

    fn write_mair(&mut self, value: u64) {
        #[cfg(target_arch = "aarch64")]
        unsafe {
            core::arch::asm!("msr mair_el3, {}", in(reg) value);
        }
    }

    fn write_ttbr0(&mut self, value: u64) {
        #[cfg(target_arch = "aarch64")]
        unsafe {
            core::arch::asm!("msr ttbr0_el3, {}", in(reg) value);
        }
    }

    fn invalidate_tlb(&mut self) {
        #[cfg(target_arch = "aarch64")]
        unsafe {
            core::arch::asm!("tlbi alle3");
        }
    }

    fn barrier(&mut self) {
        #[cfg(target_arch = "aarch64")]
        {
            use aarch64_cpu::asm::barrier;
            barrier::dsb(barrier::SY);
            barrier::isb(barrier::SY);
        }
    }
}
