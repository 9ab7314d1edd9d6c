use core::fmt;
use tock_registers::{
    interfaces::{ReadWriteable, Readable, Writeable},
    register_bitfields,
    registers::InMemoryRegister,
};

use crate::phys::PhysAddr;
use crate::units::{GIB, KIB, MIB};

/// Bytes covered by the L1 table.
pub const VA_WINDOW: u64 = 64 * GIB;
pub const PAGE_SIZE: u64 = 4 * KIB;
pub const ENTRY_SIZE: u64 = core::mem::size_of::<u64>() as u64;

register_bitfields! {
    u64,

    // https://developer.arm.com/documentation/den0024/a/The-Memory-Management-Unit/Translation-tables-in-ARMv8-A/AArch64-descriptor-format
    Descriptor [
        VALID                       OFFSET(0)   NUMBITS(1) [],
        TYPE                        OFFSET(1)   NUMBITS(1) [
            Block = 0,
            // Table at L1/L2, page at L3
            TableOrPage = 1,
        ],
        // Index into MAIR_EL3
        ATTR_INDEX                  OFFSET(2)   NUMBITS(3) [
            NormalNonCacheable = 0,
            NormalWriteBack = 1,
            DeviceNGnRnE = 2,
            DeviceNGnRE = 3,
            NormalWriteThrough = 4,
        ],
        SHAREABILITY                OFFSET(8)   NUMBITS(2) [
            NonShareable = 0b00,
            OuterShareable = 0b10,
            InnerShareable = 0b11,
        ],
        // Faults on first access while clear
        ACCESS_FLAG                 OFFSET(10)  NUMBITS(1) [],
        OUTPUT_ADDR                 OFFSET(12)  NUMBITS(36) [],
        EXECUTE_NEVER               OFFSET(54)  NUMBITS(1) [],
    ],
}

type DescriptorR = InMemoryRegister<u64, Descriptor::Register>;

/// What callers can ask an address range to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    NormalCached,
    NormalUnCached,
    Device,
    Fault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    L1,
    L2,
    L3,
}

impl Level {
    pub const fn shift(self) -> u32 {
        match self {
            Level::L1 => 30,
            Level::L2 => 21,
            Level::L3 => 12,
        }
    }

    /// Bytes mapped by one entry at this level.
    pub const fn span(self) -> u64 {
        1 << self.shift()
    }

    pub const fn entries(self) -> usize {
        match self {
            Level::L1 => (VA_WINDOW / GIB) as usize,
            Level::L2 | Level::L3 => 512,
        }
    }

    pub const fn index(self, va: u64) -> usize {
        ((va >> self.shift()) as usize) & (self.entries() - 1)
    }
}

const _: () = assert!(Level::L2.span() * 512 == GIB && Level::L3.span() * 512 == 2 * MIB);

/// One 64-bit translation table entry.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Entry(u64);

impl Entry {
    pub const FAULT: Entry = Entry(0);

    pub const fn from_bits(bits: u64) -> Self {
        Entry(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    fn reg(self) -> DescriptorR {
        InMemoryRegister::new(self.0)
    }

    pub fn table(table: PhysAddr) -> Entry {
        let reg = DescriptorR::new(0);
        reg.write(
            Descriptor::VALID::SET
                + Descriptor::TYPE::TableOrPage
                + Descriptor::OUTPUT_ADDR.val(table.as_u64() >> Level::L3.shift()),
        );
        Entry(reg.get())
    }

    /// A block at L1/L2. `Fault` gives an empty entry.
    pub fn block(pa: PhysAddr, page_type: PageType) -> Entry {
        let attributes = match page_type {
            PageType::NormalCached => {
                Descriptor::ATTR_INDEX::NormalWriteBack + Descriptor::SHAREABILITY::OuterShareable
            }
            PageType::NormalUnCached => {
                Descriptor::ATTR_INDEX::NormalNonCacheable
                    + Descriptor::SHAREABILITY::OuterShareable
            }
            PageType::Device => {
                Descriptor::ATTR_INDEX::DeviceNGnRnE + Descriptor::EXECUTE_NEVER::SET
            }
            PageType::Fault => return Entry::FAULT,
        };

        let reg = DescriptorR::new(0);
        reg.write(
            Descriptor::VALID::SET
                + Descriptor::TYPE::Block
                + Descriptor::ACCESS_FLAG::SET
                + attributes
                + Descriptor::OUTPUT_ADDR.val(pa.as_u64() >> Level::L3.shift()),
        );
        Entry(reg.get())
    }

    /// An L3 page. `Fault` gives an empty entry.
    pub fn page(pa: PhysAddr, page_type: PageType) -> Entry {
        Entry::block(pa, page_type).into_page()
    }

    fn into_page(self) -> Entry {
        if !self.is_valid() {
            return self;
        }
        let reg = self.reg();
        reg.modify(Descriptor::TYPE::TableOrPage);
        Entry(reg.get())
    }

    pub fn is_valid(self) -> bool {
        self.reg().is_set(Descriptor::VALID)
    }

    /// Points at a next level table. Never true at L3, where the same bits mean page.
    pub fn is_table(self, level: Level) -> bool {
        level != Level::L3
            && self.is_valid()
            && self.reg().matches_all(Descriptor::TYPE::TableOrPage)
    }

    pub fn is_block(self, level: Level) -> bool {
        level != Level::L3 && self.is_valid() && self.reg().matches_all(Descriptor::TYPE::Block)
    }

    pub fn output_address(self) -> PhysAddr {
        PhysAddr::new(self.reg().read(Descriptor::OUTPUT_ADDR) << Level::L3.shift())
    }

    pub fn memory_attr_index(self) -> u64 {
        self.reg().read(Descriptor::ATTR_INDEX)
    }

    /// Everything but the output address. Identity mapping means the output
    /// address of a block is its aligned base.
    pub fn attributes(self) -> u64 {
        self.0 ^ self.output_address().as_u64()
    }

    /// One of the 512 pieces of this block, one level down.
    pub fn split_child(self, child: Level, index: usize) -> Entry {
        let pa = self.output_address() + index as u64 * child.span();
        let entry = Entry(self.attributes() | pa.as_u64());
        match child {
            Level::L3 => entry.into_page(),
            Level::L1 | Level::L2 => entry,
        }
    }

    pub fn page_type(self) -> PageType {
        if !self.is_valid() {
            return PageType::Fault;
        }
        match self.reg().read_as_enum(Descriptor::ATTR_INDEX) {
            Some(Descriptor::ATTR_INDEX::Value::NormalWriteBack) => PageType::NormalCached,
            Some(Descriptor::ATTR_INDEX::Value::NormalNonCacheable) => PageType::NormalUnCached,
            Some(Descriptor::ATTR_INDEX::Value::DeviceNGnRnE)
            | Some(Descriptor::ATTR_INDEX::Value::DeviceNGnRE) => PageType::Device,
            _ => PageType::Fault,
        }
    }

    pub fn describe(self, level: Level) -> &'static str {
        if !self.is_valid() {
            ""
        } else if self.is_table(level) {
            "Table"
        } else if level == Level::L3 {
            "Page"
        } else {
            "Block"
        }
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entry({:#018x})", self.0)
    }
}
