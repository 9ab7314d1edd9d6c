//! Identity-mapped translation tables for the EL3 application core.
//!
//! One L1 table of 64 entries covers a 36-bit (64GB) window. Every address is
//! classified as one of the [`PageType`]s using the largest granule that fits:
//! 1GB and 2MB blocks, and 4KB pages only for unaligned heads and tails.
//!
//! Table pages are carved out of 64KB blocks borrowed from a
//! [`BlockAllocator`]. The first block holds the manager itself: the L1 table
//! and the list of borrowed blocks. Blocks go back as soon as all sixteen of
//! their pages are released.

use core::{mem, ptr};
use elain::Align;
use static_assertions::const_assert_eq;
use thiserror_no_std::Error;

pub mod block_list;
pub mod entry;
pub mod regs;

use block_list::{Block, BlockList};
pub use entry::{Entry, Level, PageType, ENTRY_SIZE, PAGE_SIZE, VA_WINDOW};
use regs::TranslationRegisters;

use crate::memory_map::Region;
use crate::os_services::{BlockAllocator, DdrWindow, RemoteError, ServiceTag, BLOCK_SIZE};
use crate::phys::{IdentityMapped, PhysAddr, PhysMemory};
use crate::units::GIB;

const L2_SPAN: u64 = Level::L2.span();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MmuError {
    #[error("page table memory: {0}")]
    Remote(#[from] RemoteError),
    #[error("no room to track another block")]
    BlockListFull,
}

/// Layout of the manager's own 64KB block. All zero is a valid, empty manager.
#[repr(C)]
struct Storage {
    l1: [Entry; 64],
    tables_from_high: u32,
    _reserved: u32,
    blocks: BlockList,
    _align: Align<{ BLOCK_SIZE as usize }>,
}

const_assert_eq!(mem::size_of::<Storage>(), BLOCK_SIZE as usize);
const_assert_eq!(Level::L1.entries(), 64);

/// Physical location of one entry in table memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntrySlot {
    addr: PhysAddr,
    level: Level,
}

impl EntrySlot {
    fn at(table: PhysAddr, level: Level, index: usize) -> Self {
        EntrySlot {
            addr: table + index as u64 * ENTRY_SIZE,
            level,
        }
    }

    fn for_va(table: PhysAddr, level: Level, va: u64) -> Self {
        Self::at(table, level, level.index(va))
    }

    pub fn addr(&self) -> PhysAddr {
        self.addr
    }

    pub fn level(&self) -> Level {
        self.level
    }
}

pub struct Manager<S: BlockAllocator, M: PhysMemory = IdentityMapped> {
    storage: PhysAddr,
    source: S,
    memory: M,
}

impl<S: BlockAllocator, M: PhysMemory> Manager<S, M> {
    /// Borrow the manager's storage block and start with everything faulted.
    pub fn init(mut source: S, memory: M, tables_from_high: bool) -> Result<Self, MmuError> {
        let window = window(tables_from_high);
        let storage = source.alloc_blocks(window, 1, ServiceTag::MMU)?;

        let mut manager = Manager {
            storage,
            source,
            memory,
        };
        unsafe {
            ptr::write_bytes(manager.memory.host_ptr(storage), 0, BLOCK_SIZE as usize);
        }
        manager.storage_mut().tables_from_high = tables_from_high as u32;

        log::debug!("mmu storage at {} from {}", storage, window);
        Ok(manager)
    }

    /// Reopen a manager left behind by an earlier boot stage.
    ///
    /// # Safety
    ///
    /// `storage` must come from [`Manager::storage_addr`] of a manager whose
    /// tables and blocks are still intact, and that manager must not be used
    /// any more.
    pub unsafe fn attach(storage: PhysAddr, source: S, memory: M) -> Self {
        Manager {
            storage,
            source,
            memory,
        }
    }

    pub fn storage_addr(&self) -> PhysAddr {
        self.storage
    }

    /// What TTBR0 points at.
    pub fn l1_table(&self) -> PhysAddr {
        self.storage + mem::offset_of!(Storage, l1) as u64
    }

    pub fn tables_from_high(&self) -> bool {
        self.storage().tables_from_high != 0
    }

    pub fn blocks(&self) -> &[Block] {
        self.storage().blocks.as_slice()
    }

    pub fn block_list(&self) -> &BlockList {
        &self.storage().blocks
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn into_source(self) -> S {
        self.source
    }

    fn storage(&self) -> &Storage {
        unsafe { &*(self.memory.host_ptr(self.storage) as *const Storage) }
    }

    fn storage_mut(&mut self) -> &mut Storage {
        unsafe { &mut *(self.memory.host_ptr(self.storage) as *mut Storage) }
    }

    fn window(&self) -> DdrWindow {
        window(self.tables_from_high())
    }

    pub fn read_entry(&self, slot: EntrySlot) -> Entry {
        unsafe { ptr::read_volatile(self.memory.host_ptr(slot.addr) as *const Entry) }
    }

    pub fn write_entry(&mut self, slot: EntrySlot, entry: Entry) {
        unsafe { ptr::write_volatile(self.memory.host_ptr(slot.addr) as *mut Entry, entry) }
    }

    fn l1_slot(&self, va: u64) -> EntrySlot {
        assert!(va < VA_WINDOW, "{:#x} is outside the translated window", va);
        EntrySlot::for_va(self.l1_table(), Level::L1, va)
    }

    fn l2_slot(&self, va: u64) -> Option<EntrySlot> {
        let l1 = self.read_entry(self.l1_slot(va));
        l1.is_table(Level::L1)
            .then(|| EntrySlot::for_va(l1.output_address(), Level::L2, va))
    }

    /// The finest entry currently deciding what `va` is.
    fn leaf_slot(&self, va: u64) -> EntrySlot {
        let mut slot = self.l1_slot(va);
        for child in [Level::L2, Level::L3] {
            let entry = self.read_entry(slot);
            if !entry.is_table(slot.level) {
                break;
            }
            slot = EntrySlot::for_va(entry.output_address(), child, va);
        }
        slot
    }

    /// The L2 entry for `va`, installing an L2 table under its L1 entry if
    /// there is none. An L1 block is split into 512 2MB blocks with the
    /// same attributes.
    pub fn install_or_fetch_l2(&mut self, va: u64) -> Result<EntrySlot, MmuError> {
        let l1 = self.l1_slot(va);
        self.install_or_fetch(l1, Level::L2, va)
    }

    /// The L3 entry for `va`, installing L2 and L3 tables as needed. A 2MB
    /// block is split into 512 pages with the same attributes.
    pub fn install_or_fetch_l3(&mut self, va: u64) -> Result<EntrySlot, MmuError> {
        let l2 = self.install_or_fetch_l2(va)?;
        self.install_or_fetch(l2, Level::L3, va)
    }

    fn install_or_fetch(
        &mut self,
        parent: EntrySlot,
        child: Level,
        va: u64,
    ) -> Result<EntrySlot, MmuError> {
        let entry = self.read_entry(parent);
        if entry.is_table(parent.level) {
            return Ok(EntrySlot::for_va(entry.output_address(), child, va));
        }

        let table = self.allocate_page_table()?;
        if entry.is_block(parent.level) {
            for index in 0..child.entries() {
                let slot = EntrySlot::at(table, child, index);
                self.write_entry(slot, entry.split_child(child, index));
            }
        }
        self.write_entry(parent, Entry::table(table));

        log::trace!("{:?} table for {:#x} at {}", child, va, table);
        Ok(EntrySlot::for_va(table, child, va))
    }

    /// Drop the L2 table under `va`'s L1 entry, and any L3 tables below it.
    /// The L1 entry becomes a fault.
    pub fn uninstall_l2(&mut self, va: u64) {
        let l1 = self.l1_slot(va);
        let entry = self.read_entry(l1);
        if !entry.is_table(Level::L1) {
            return;
        }

        let table = entry.output_address();
        for index in 0..Level::L2.entries() {
            let l2 = self.read_entry(EntrySlot::at(table, Level::L2, index));
            if l2.is_table(Level::L2) {
                self.release_page_table(l2.output_address());
            }
        }
        self.write_entry(l1, Entry::FAULT);
        self.release_page_table(table);
    }

    /// Drop the L3 table under `va`'s L2 entry. The L2 entry becomes a fault.
    pub fn uninstall_l3(&mut self, va: u64) {
        let Some(l2) = self.l2_slot(va) else {
            return;
        };
        let entry = self.read_entry(l2);
        if !entry.is_table(Level::L2) {
            return;
        }

        self.write_entry(l2, Entry::FAULT);
        self.release_page_table(entry.output_address());
    }

    pub fn page_type(&self, va: u64) -> PageType {
        self.read_entry(self.leaf_slot(va)).page_type()
    }

    /// Classify `[va, va + size)` as `page_type`.
    ///
    /// `va` and `size` must be 4KB multiples and `size` non-zero. If a table
    /// page cannot be obtained the range is left classified up to the point
    /// of failure.
    pub fn set_page_type_range(
        &mut self,
        va: u64,
        size: u64,
        page_type: PageType,
    ) -> Result<(), MmuError> {
        assert!(size != 0, "empty range at {:#x}", va);
        assert!(va % PAGE_SIZE == 0, "{:#x} is not page aligned", va);
        assert!(size % PAGE_SIZE == 0, "{:#x} is not a page multiple", size);
        assert!(
            va.checked_add(size).map_or(false, |end| end <= VA_WINDOW),
            "{:#x}+{:#x} is outside the translated window",
            va,
            size
        );

        let mut va = va;
        let mut remaining = size;

        // Pages up to the first 2MB boundary.
        while va % L2_SPAN != 0 && remaining > PAGE_SIZE {
            self.set_page(va, page_type)?;
            va += PAGE_SIZE;
            remaining -= PAGE_SIZE;
        }

        // 2MB blocks up to the first 1GB boundary.
        while va % GIB != 0 && remaining > L2_SPAN {
            self.set_l2_block(va, page_type)?;
            va += L2_SPAN;
            remaining -= L2_SPAN;
        }

        while remaining >= GIB {
            self.set_l1_block(va, page_type);
            va += GIB;
            remaining -= GIB;
        }

        while remaining >= L2_SPAN {
            self.set_l2_block(va, page_type)?;
            va += L2_SPAN;
            remaining -= L2_SPAN;
        }

        while remaining >= PAGE_SIZE {
            self.set_page(va, page_type)?;
            va += PAGE_SIZE;
            remaining -= PAGE_SIZE;
        }

        assert_eq!(remaining, 0);
        Ok(())
    }

    fn set_page(&mut self, va: u64, page_type: PageType) -> Result<(), MmuError> {
        let slot = self.install_or_fetch_l3(va)?;
        self.write_entry(slot, Entry::page(PhysAddr::new(va), page_type));
        Ok(())
    }

    fn set_l2_block(&mut self, va: u64, page_type: PageType) -> Result<(), MmuError> {
        let slot = self.install_or_fetch_l2(va)?;
        self.uninstall_l3(va);
        self.write_entry(slot, Entry::block(PhysAddr::new(va), page_type));
        Ok(())
    }

    fn set_l1_block(&mut self, va: u64, page_type: PageType) {
        self.uninstall_l2(va);
        let slot = self.l1_slot(va);
        self.write_entry(slot, Entry::block(PhysAddr::new(va), page_type));
    }

    /// Classify each region in order. Later regions win where they overlap.
    pub fn apply_layout(&mut self, layout: &[Region]) -> Result<(), MmuError> {
        for region in layout {
            log::debug!(
                "{:#x}..{:#x} {:?}",
                region.base,
                region.base + region.size,
                region.page_type
            );
            self.set_page_type_range(region.base, region.size, region.page_type)?;
        }
        Ok(())
    }

    /// Point the hardware at these tables and turn translation on.
    pub fn enable<R: TranslationRegisters>(&self, regs: &mut R) {
        // TTBR0 and MAIR must not change under live translation.
        regs.write_sctlr(regs::sctlr(false));

        regs.write_tcr(regs::tcr());
        regs.barrier();

        regs.write_mair(regs::mair());
        regs.write_ttbr0(self.l1_table().as_u64());
        regs.write_sctlr(regs::sctlr(true));

        regs.invalidate_tlb();
        regs.barrier();
    }

    pub fn dump(&self, va: u64) {
        log::debug!("translation of {:#x}:", va);

        let mut slot = self.l1_slot(va);
        for child in [Some(Level::L2), Some(Level::L3), None] {
            let entry = self.read_entry(slot);
            log::debug!(
                "  {:?} {} {:?} ({:#018x})",
                slot.level,
                entry.describe(slot.level),
                entry.page_type(),
                entry.bits()
            );
            match child {
                Some(child) if entry.is_table(slot.level) => {
                    slot = EntrySlot::for_va(entry.output_address(), child, va);
                }
                _ => break,
            }
        }
    }

    /// A zeroed 4KB page for a table.
    fn allocate_page_table(&mut self) -> Result<PhysAddr, MmuError> {
        let table = match self.storage_mut().blocks.claim_slot() {
            Some(table) => table,
            None => {
                if self.storage().blocks.is_full() {
                    log::error!("mmu block list full");
                    return Err(MmuError::BlockListFull);
                }
                let window = self.window();
                let block = self.source.alloc_blocks(window, 1, ServiceTag::MMU)?;
                log::trace!("mmu block {}", block);
                self.storage_mut()
                    .blocks
                    .push_and_claim(block)
                    .ok_or(MmuError::BlockListFull)?
            }
        };

        unsafe {
            ptr::write_bytes(self.memory.host_ptr(table), 0, PAGE_SIZE as usize);
        }
        Ok(table)
    }

    fn release_page_table(&mut self, table: PhysAddr) {
        let base = table.align_down(BLOCK_SIZE);
        let slot = ((table - base) / PAGE_SIZE) as usize;

        let blocks = &mut self.storage_mut().blocks;
        let Some(index) = blocks.position_of(base) else {
            log::error!("page table {} has no mmu block", table);
            panic!("release of unknown page table {}", table);
        };
        if !blocks.release_slot(index, slot) {
            log::error!("page table {} released twice", table);
            panic!("double release of page table {}", table);
        }
        if !blocks.get(index).map_or(false, Block::is_all_free) {
            return;
        }

        let block = blocks.remove_preserving_order(index);
        let window = self.window();
        self.source.free_blocks(window, block.addr(), 1, ServiceTag::MMU);
        log::trace!("mmu returned block {}", block.addr());
    }
}

fn window(tables_from_high: bool) -> DdrWindow {
    if tables_from_high {
        DdrWindow::High
    } else {
        DdrWindow::Low
    }
}
