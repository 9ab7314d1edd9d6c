//! The page table allocator's view of the 64KB blocks it borrowed.
//!
//! Lives inside the manager's own storage block, so it has a fixed capacity
//! and an all-zero bit pattern means empty.

use bit_field::BitField;
use core::fmt;

use super::entry::PAGE_SIZE;
use crate::os_services::BLOCK_SIZE;
use crate::phys::PhysAddr;

/// A 64KB block carved into 4KB table pages.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct Block {
    addr: u64,
    /// Bit set means the slot is free.
    free_mask: u16,
}

impl Block {
    pub const SLOTS: usize = (BLOCK_SIZE / PAGE_SIZE) as usize;
    pub const ALL_FREE: u16 = u16::MAX;

    pub const fn new(addr: PhysAddr) -> Self {
        Block {
            addr: addr.as_u64(),
            free_mask: Self::ALL_FREE,
        }
    }

    pub const fn addr(&self) -> PhysAddr {
        PhysAddr::new(self.addr)
    }

    pub const fn free_mask(&self) -> u16 {
        self.free_mask
    }

    pub const fn has_free_slot(&self) -> bool {
        self.free_mask != 0
    }

    pub const fn is_all_free(&self) -> bool {
        self.free_mask == Self::ALL_FREE
    }

    pub fn slot_addr(&self, slot: usize) -> PhysAddr {
        self.addr() + slot as u64 * PAGE_SIZE
    }

    /// Take the lowest free slot.
    pub fn claim(&mut self) -> Option<usize> {
        if !self.has_free_slot() {
            return None;
        }
        let slot = self.free_mask.trailing_zeros() as usize;
        self.free_mask.set_bit(slot, false);
        Some(slot)
    }

    /// Returns false if the slot was already free.
    pub fn release(&mut self, slot: usize) -> bool {
        if self.free_mask.get_bit(slot) {
            return false;
        }
        self.free_mask.set_bit(slot, true);
        true
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block({} free {:#06x})", self.addr(), self.free_mask)
    }
}

/// Ordered, compact array of blocks with a scan cursor.
///
/// Blocks before the cursor have no free slot and no block is entirely free.
#[repr(C)]
pub struct BlockList {
    len: u32,
    cursor: u32,
    entries: [Block; BlockList::CAPACITY],
}

impl BlockList {
    pub const CAPACITY: usize = 4063;

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == Self::CAPACITY
    }

    pub fn cursor(&self) -> usize {
        self.cursor as usize
    }

    pub fn as_slice(&self) -> &[Block] {
        &self.entries[..self.len()]
    }

    /// Claim a free slot, moving the cursor past exhausted blocks.
    pub fn claim_slot(&mut self) -> Option<PhysAddr> {
        while self.cursor < self.len {
            let block = &mut self.entries[self.cursor as usize];
            if let Some(slot) = block.claim() {
                return Some(block.slot_addr(slot));
            }
            self.cursor += 1;
        }
        None
    }

    /// Append a new block and claim its first slot.
    ///
    /// Only valid once [`Self::claim_slot`] has found nothing, so the cursor
    /// already sits at the end.
    pub fn push_and_claim(&mut self, addr: PhysAddr) -> Option<PhysAddr> {
        if self.is_full() {
            return None;
        }
        debug_assert_eq!(self.cursor, self.len);

        let mut block = Block::new(addr);
        let slot = block.claim()?;
        let len = self.len();
        self.entries[len] = block;
        self.len += 1;
        Some(block.slot_addr(slot))
    }

    pub fn position_of(&self, addr: PhysAddr) -> Option<usize> {
        self.as_slice().iter().position(|block| block.addr() == addr)
    }

    pub fn get(&self, index: usize) -> Option<&Block> {
        self.as_slice().get(index)
    }

    /// Free `slot` of block `index`. Returns false if it was already free.
    pub fn release_slot(&mut self, index: usize, slot: usize) -> bool {
        let len = self.len();
        if !self.entries[..len][index].release(slot) {
            return false;
        }
        if index < self.cursor() {
            self.cursor = index as u32;
        }
        true
    }

    /// Remove block `index`, shifting later blocks down.
    pub fn remove_preserving_order(&mut self, index: usize) -> Block {
        let len = self.len();
        assert!(index < len, "block index {} out of {}", index, len);

        let removed = self.entries[index];
        self.entries.copy_within(index + 1..len, index);
        self.entries[len - 1] = Block::default();
        self.len -= 1;

        if self.cursor() > index {
            self.cursor -= 1;
        }
        self.cursor = self.cursor.min(self.len);
        removed
    }

    pub fn check_invariants(&self) -> Result<(), &'static str> {
        if self.len() > Self::CAPACITY {
            return Err("length past capacity");
        }
        if self.cursor > self.len {
            return Err("cursor past length");
        }
        let blocks = self.as_slice();
        if blocks[..self.cursor()].iter().any(Block::has_free_slot) {
            return Err("free slot behind cursor");
        }
        if blocks.iter().any(Block::is_all_free) {
            return Err("entirely free block kept");
        }
        Ok(())
    }
}

impl fmt::Debug for BlockList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockList")
            .field("cursor", &self.cursor)
            .field("blocks", &self.as_slice())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::boxed::Box;

    fn empty() -> Box<BlockList> {
        // All-zero is the empty list.
        let layout = std::alloc::Layout::new::<BlockList>();
        unsafe { Box::from_raw(std::alloc::alloc_zeroed(layout) as *mut BlockList) }
    }

    fn block_at(n: u64) -> PhysAddr {
        PhysAddr::new(0x0100_0000 + n * BLOCK_SIZE)
    }

    #[test]
    fn first_claim_needs_a_block() {
        let mut list = empty();
        assert!(list.is_empty());
        assert_eq!(list.claim_slot(), None);

        assert_eq!(list.push_and_claim(block_at(0)), Some(block_at(0)));
        assert_eq!(list.claim_slot(), Some(block_at(0) + PAGE_SIZE));
        assert_eq!(list.get(0).map(Block::free_mask), Some(0xFFFC));
        list.check_invariants().unwrap();
    }

    #[test]
    fn sixteen_slots_per_block() {
        let mut list = empty();
        list.push_and_claim(block_at(0)).unwrap();
        for slot in 1..Block::SLOTS {
            assert_eq!(list.claim_slot(), Some(block_at(0) + slot as u64 * PAGE_SIZE));
        }
        assert_eq!(list.claim_slot(), None);
        assert_eq!(list.cursor(), 1);
        list.check_invariants().unwrap();
    }

    #[test]
    fn release_behind_cursor_rewinds() {
        let mut list = empty();
        list.push_and_claim(block_at(0)).unwrap();
        while list.claim_slot().is_some() {}
        list.push_and_claim(block_at(1)).unwrap();
        assert_eq!(list.cursor(), 1);

        assert!(list.release_slot(0, 3));
        assert_eq!(list.cursor(), 0);
        list.check_invariants().unwrap();
        assert_eq!(list.claim_slot(), Some(block_at(0) + 3 * PAGE_SIZE));
    }

    #[test]
    fn double_release_is_reported() {
        let mut list = empty();
        list.push_and_claim(block_at(0)).unwrap();
        assert!(list.release_slot(0, 0));
        assert!(!list.release_slot(0, 0));
    }

    #[test]
    fn removal_keeps_order_and_clamps_cursor() {
        let mut list = empty();
        for n in 0..3 {
            list.push_and_claim(block_at(n)).unwrap();
            while list.claim_slot().is_some() {}
        }
        assert_eq!(list.cursor(), 3);

        let removed = list.remove_preserving_order(1);
        assert_eq!(removed.addr(), block_at(1));
        assert_eq!(list.len(), 2);
        assert_eq!(list.cursor(), 2);
        assert_eq!(list.position_of(block_at(2)), Some(1));
        assert_eq!(list.position_of(block_at(1)), None);

        list.remove_preserving_order(1);
        list.remove_preserving_order(0);
        assert_eq!(list.cursor(), 0);
        assert!(list.is_empty());
    }

    #[test]
    fn invariant_checks_catch_corruption() {
        let mut list = empty();
        list.push_and_claim(block_at(0)).unwrap();
        list.release_slot(0, 0);
        assert_eq!(list.check_invariants(), Err("entirely free block kept"));
    }
}
