//! Fixed addresses of the SoC this firmware runs on.

use crate::mmu::PageType;
use crate::phys::PhysAddr;
use crate::units::{GIB, MIB};

/// Low (32-bit addressable) DDR window.
pub const DDR_LO_BASE: PhysAddr = PhysAddr::new(0x0000_0000);
pub const DDR_LO_SIZE: u64 = 2 * GIB;

/// High DDR window, only reachable from cores with 64-bit physical addressing.
pub const DDR_HI_BASE: PhysAddr = PhysAddr::new(0x8_0000_0000);
// Populated size on the board, the window itself is 32GB.
pub const DDR_HI_SIZE: u64 = 2 * GIB;

pub const IPI_BASE: usize = 0xFF30_0000;
pub const IPI_BUFFER_BASE: usize = 0xFF99_0000;

pub const QSPI_BASE: u64 = 0xC000_0000;
pub const QSPI_SIZE: u64 = 512 * MIB;
pub const LOWER_PCIE_BASE: u64 = 0xE000_0000;
pub const LOWER_PCIE_SIZE: u64 = 256 * MIB;
pub const CORESIGHT_BASE: u64 = 0xF800_0000;
pub const CORESIGHT_SIZE: u64 = 16 * MIB;
pub const RPU_LLP_BASE: u64 = 0xF900_0000;
pub const RPU_LLP_SIZE: u64 = MIB;
pub const FPD_BASE: u64 = 0xFD00_0000;
pub const FPD_SIZE: u64 = 16 * MIB;
pub const LPD_BASE: u64 = 0xFE00_0000;
pub const LPD_SIZE: u64 = 28 * MIB;
pub const PMU_CSU_BASE: u64 = 0xFFC0_0000;
pub const PMU_CSU_SIZE: u64 = 2 * MIB;
pub const OCM_TCM_BASE: u64 = 0xFFE0_0000;
pub const OCM_TCM_SIZE: u64 = 2 * MIB;

/// One entry of a classification table handed to [`crate::Manager::apply_layout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub base: u64,
    pub size: u64,
    pub page_type: PageType,
}

impl Region {
    pub const fn new(base: u64, size: u64, page_type: PageType) -> Self {
        Region { base, size, page_type }
    }
}

/// How the boot loader classifies the address space before enabling the MMU.
///
/// The first MB of DDR stays faulted so null dereferences trap.
pub const BOOT_LAYOUT: &[Region] = &[
    Region::new(DDR_LO_BASE.as_u64(), MIB, PageType::Fault),
    Region::new(DDR_LO_BASE.as_u64() + MIB, DDR_LO_SIZE - MIB, PageType::NormalCached),
    Region::new(DDR_HI_BASE.as_u64(), DDR_HI_SIZE, PageType::NormalCached),
    Region::new(QSPI_BASE, QSPI_SIZE, PageType::Device),
    Region::new(LOWER_PCIE_BASE, LOWER_PCIE_SIZE, PageType::Device),
    Region::new(CORESIGHT_BASE, CORESIGHT_SIZE, PageType::Device),
    Region::new(RPU_LLP_BASE, RPU_LLP_SIZE, PageType::Device),
    Region::new(FPD_BASE, FPD_SIZE, PageType::Device),
    Region::new(LPD_BASE, LPD_SIZE, PageType::Device),
    Region::new(PMU_CSU_BASE, PMU_CSU_SIZE, PageType::Device),
    Region::new(OCM_TCM_BASE, OCM_TCM_SIZE, PageType::NormalCached),
];
