//! A single cache block and its coherence status.

use serde::Serialize;

use crate::Address;

/// Coherence status of a cache block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Status {
    /// No valid data; the slot is reusable.
    Invalid,
    /// Reserved for an in-flight load; data not yet valid.
    Assigned,
    /// Clean, may be read-shared with peers and with the level below.
    Shared,
    /// Clean, sole owner above memory. Writes proceed without notifying peers.
    Exclusive,
    /// Modified data that must be written back. In inclusive mode also marks
    /// "an upstream holds newer data; write back before acking an invalidate
    /// from below".
    Dirty,
}

impl Status {
    #[must_use]
    pub fn is_valid(self) -> bool {
        !matches!(self, Status::Invalid)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Block {
    pub base_addr: Address,
    pub tag: u64,
    pub row: usize,
    pub col: usize,
    pub status: Status,
    pub data: Vec<u8>,
    pub last_touched: u64,
    /// Protocol lock: non-zero means the block may not be re-used as a
    /// victim. This is the only "lock" in the whole component.
    locked: u32,
    /// CPU atomic-lock depth (from requests carrying the LOCKED flag).
    pub user_locked: u32,
    /// A supply was deferred while the block was user-locked; the unlock
    /// store triggers the real writeback.
    pub user_lock_needs_wb: bool,
    pub wb_in_progress: bool,
    /// An outstanding load references this block. The load record itself is
    /// looked up by address in the MSHR table.
    pub load_pending: bool,
}

impl Block {
    #[must_use]
    pub fn new(row: usize, col: usize, block_size: usize) -> Self {
        Self {
            base_addr: 0,
            tag: 0,
            row,
            col,
            status: Status::Invalid,
            data: vec![0; block_size],
            last_touched: 0,
            locked: 0,
            user_locked: 0,
            user_lock_needs_wb: false,
            wb_in_progress: false,
            load_pending: false,
        }
    }

    /// Re-key the slot for a new base address. Clears every transient flag.
    pub fn assign(&mut self, base_addr: Address, tag: u64, now: u64) {
        debug_assert_eq!(self.locked, 0, "re-assigning a locked block");
        self.base_addr = base_addr;
        self.tag = tag;
        self.status = Status::Assigned;
        self.last_touched = now;
        self.user_locked = 0;
        self.user_lock_needs_wb = false;
        self.wb_in_progress = false;
        self.load_pending = false;
    }

    pub fn touch(&mut self, now: u64) {
        self.last_touched = now;
    }

    pub fn lock(&mut self) {
        self.locked += 1;
    }

    pub fn unlock(&mut self) {
        debug_assert!(self.locked > 0, "unlocking an unlocked block");
        self.locked = self.locked.saturating_sub(1);
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked > 0
    }

    #[must_use]
    pub fn locked_count(&self) -> u32 {
        self.locked
    }

    /// Copy `bytes` into the block at an absolute address within it.
    pub fn write(&mut self, addr: Address, bytes: &[u8]) {
        let offset = (addr - self.base_addr) as usize;
        debug_assert!(offset + bytes.len() <= self.data.len());
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Read `len` bytes starting at an absolute address within the block.
    #[must_use]
    pub fn read(&self, addr: Address, len: usize) -> &[u8] {
        let offset = (addr - self.base_addr) as usize;
        debug_assert!(offset + len <= self.data.len());
        &self.data[offset..offset + len]
    }

    /// Replace the whole block payload (a fill or a received writeback).
    pub fn fill(&mut self, payload: &[u8]) {
        debug_assert_eq!(payload.len(), self.data.len());
        self.data.copy_from_slice(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_nests() {
        let mut block = Block::new(0, 0, 64);
        block.lock();
        block.lock();
        assert_eq!(block.locked_count(), 2);
        block.unlock();
        assert!(block.is_locked());
        block.unlock();
        assert!(!block.is_locked());
    }

    #[test]
    fn sub_range_write_then_read() {
        let mut block = Block::new(0, 0, 64);
        block.assign(0x100, 4, 10);
        block.write(0x108, &[0xaa, 0xbb]);
        assert_eq!(block.read(0x108, 2), &[0xaa, 0xbb]);
        assert_eq!(block.read(0x100, 1), &[0]);
    }

    #[test]
    fn assign_clears_transient_state() {
        let mut block = Block::new(1, 1, 64);
        block.user_locked = 1;
        block.user_lock_needs_wb = true;
        block.wb_in_progress = true;
        block.assign(0x200, 8, 5);
        assert_eq!(block.status, Status::Assigned);
        assert_eq!(block.user_locked, 0);
        assert!(!block.user_lock_needs_wb);
        assert!(!block.wb_in_progress);
    }
}
