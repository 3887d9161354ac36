//! Set-associative storage: `num_rows` x `num_ways` blocks plus the per-row
//! queues of events waiting for a slot to free up or a block to settle.

use std::collections::VecDeque;

use crate::block::{Block, Status};
use crate::event::{MemEvent, Source};
use crate::Address;

pub struct TagArray {
    num_rows: usize,
    num_ways: usize,
    block_size: usize,
    offset_bits: u32,
    row_bits: u32,
    blocks: Vec<Block>,
    /// FIFO of `(base_addr, event, source)` per row, drained whenever a slot
    /// in the row frees up or a block in it settles.
    waiting: Vec<VecDeque<(Address, MemEvent, Source)>>,
}

impl TagArray {
    /// `num_rows` and `block_size` must be powers of two; validated by the
    /// configuration layer before construction.
    #[must_use]
    pub fn new(num_rows: usize, num_ways: usize, block_size: usize) -> Self {
        debug_assert!(num_rows.is_power_of_two());
        debug_assert!(block_size.is_power_of_two());
        let blocks = (0..num_rows * num_ways)
            .map(|idx| Block::new(idx / num_ways, idx % num_ways, block_size))
            .collect();
        Self {
            num_rows,
            num_ways,
            block_size,
            offset_bits: block_size.trailing_zeros(),
            row_bits: num_rows.trailing_zeros(),
            blocks,
            waiting: (0..num_rows).map(|_| VecDeque::new()).collect(),
        }
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[must_use]
    pub fn base_addr(&self, addr: Address) -> Address {
        addr & !((self.block_size as Address) - 1)
    }

    #[must_use]
    pub fn row_of(&self, addr: Address) -> usize {
        ((addr >> self.offset_bits) & ((self.num_rows as Address) - 1)) as usize
    }

    #[must_use]
    pub fn tag_of(&self, addr: Address) -> u64 {
        addr >> (self.offset_bits + self.row_bits)
    }

    #[must_use]
    pub fn block(&self, rc: (usize, usize)) -> &Block {
        &self.blocks[rc.0 * self.num_ways + rc.1]
    }

    pub fn block_mut(&mut self, rc: (usize, usize)) -> &mut Block {
        &mut self.blocks[rc.0 * self.num_ways + rc.1]
    }

    /// Scan the row for a non-Invalid block with a matching tag. Assigned
    /// blocks match too: they are not a hit for any observer, but callers
    /// route them through the existing load record.
    #[must_use]
    pub fn find_block(&self, addr: Address) -> Option<(usize, usize)> {
        let row = self.row_of(addr);
        let tag = self.tag_of(addr);
        (0..self.num_ways)
            .map(|col| (row, col))
            .find(|&rc| self.block(rc).status.is_valid() && self.block(rc).tag == tag)
    }

    /// First Invalid slot in the row, if any.
    #[must_use]
    pub fn find_empty(&self, row: usize) -> Option<(usize, usize)> {
        (0..self.num_ways)
            .map(|col| (row, col))
            .find(|&rc| self.block(rc).status == Status::Invalid && !self.block(rc).is_locked())
    }

    /// Least-recently-touched unlocked block in the row, or `None` if every
    /// way is locked.
    #[must_use]
    pub fn lru_unlocked(&self, row: usize) -> Option<(usize, usize)> {
        (0..self.num_ways)
            .map(|col| (row, col))
            .filter(|&rc| !self.block(rc).is_locked())
            .min_by_key(|&rc| self.block(rc).last_touched)
    }

    pub fn push_waiting(&mut self, row: usize, base_addr: Address, ev: MemEvent, src: Source) {
        self.waiting[row].push_back((base_addr, ev, src));
    }

    /// Take every waiter on the row, in arrival order.
    pub fn drain_waiting(&mut self, row: usize) -> Vec<(Address, MemEvent, Source)> {
        self.waiting[row].drain(..).collect()
    }

    #[must_use]
    pub fn has_waiting(&self, row: usize) -> bool {
        !self.waiting[row].is_empty()
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter()
    }
}
