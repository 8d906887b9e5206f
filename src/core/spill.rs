//! Spill memory management.
//!
//! Spill slots live in a flat area placed after the frame's local
//! variables. Each register class keeps its own free list of released
//! slots, threaded through the slot records themselves, so a slot is only
//! appended when its class has nothing to recycle.

use std::fmt;

/// Size of one spill slot in bytes.
pub const SPILL_SLOT_SIZE: i32 = 8;

/// Register class of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegClass {
    Int,
    Ptr,
    Num,
}

impl RegClass {
    pub const COUNT: usize = 3;

    pub fn index(self) -> usize {
        match self {
            RegClass::Int => 0,
            RegClass::Ptr => 1,
            RegClass::Num => 2,
        }
    }

    /// Hardware register bank holding values of this class.
    pub fn bank(self) -> u8 {
        match self {
            RegClass::Int | RegClass::Ptr => 0,
            RegClass::Num => 1,
        }
    }
}

impl fmt::Display for RegClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegClass::Int => "int",
            RegClass::Ptr => "ptr",
            RegClass::Num => "num",
        };
        f.write_str(name)
    }
}

/// Index of a spill slot.
pub type SlotIdx = u32;

#[derive(Debug, Clone, Copy)]
struct SpillSlot {
    class: RegClass,
    /// Next free slot of the same class, only meaningful while free.
    next: Option<SlotIdx>,
    in_use: bool,
}

/// Per-compilation spill area.
#[derive(Debug, Clone)]
pub struct SpillMemory {
    base: i32,
    slots: Vec<SpillSlot>,
    free_heads: [Option<SlotIdx>; RegClass::COUNT],
}

impl SpillMemory {
    /// Create an empty spill area starting `base` bytes into the work area.
    pub fn new(base: i32) -> Self {
        Self {
            base,
            slots: Vec::new(),
            free_heads: [None; RegClass::COUNT],
        }
    }

    /// Get a slot for a value of `class`, recycling a released one if possible.
    pub fn select(&mut self, class: RegClass) -> SlotIdx {
        let bucket = class.index();
        if let Some(idx) = self.free_heads[bucket] {
            let slot = &mut self.slots[idx as usize];
            self.free_heads[bucket] = slot.next;
            slot.next = None;
            slot.in_use = true;
            return idx;
        }
        let idx = self.slots.len() as SlotIdx;
        self.slots.push(SpillSlot {
            class,
            next: None,
            in_use: true,
        });
        idx
    }

    /// Return a slot to its class free list. Releasing a free slot is a no-op.
    pub fn release(&mut self, idx: SlotIdx) {
        let Some(slot) = self.slots.get_mut(idx as usize) else {
            return;
        };
        if !slot.in_use {
            return;
        }
        let bucket = slot.class.index();
        slot.in_use = false;
        slot.next = self.free_heads[bucket];
        self.free_heads[bucket] = Some(idx);
    }

    /// Byte offset of a slot relative to the work area.
    pub fn offset(&self, idx: SlotIdx) -> i32 {
        self.base + idx as i32 * SPILL_SLOT_SIZE
    }

    pub fn base(&self) -> i32 {
        self.base
    }

    /// Number of slots ever created.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Bytes the interpreter must reserve after the locals.
    pub fn size(&self) -> usize {
        self.slots.len() * SPILL_SLOT_SIZE as usize
    }

    pub fn is_in_use(&self, idx: SlotIdx) -> bool {
        self.slots.get(idx as usize).is_some_and(|s| s.in_use)
    }

    /// Length of the free list for `class`.
    pub fn free_count(&self, class: RegClass) -> usize {
        let mut count = 0;
        let mut cursor = self.free_heads[class.index()];
        while let Some(idx) = cursor {
            count += 1;
            cursor = self.slots[idx as usize].next;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_follow_base() {
        let mut mem = SpillMemory::new(64);
        let a = mem.select(RegClass::Int);
        let b = mem.select(RegClass::Num);
        assert_eq!(mem.offset(a), 64);
        assert_eq!(mem.offset(b), 72);
        assert_eq!(mem.size(), 16);
    }

    #[test]
    fn test_release_recycles_within_class() {
        let mut mem = SpillMemory::new(0);
        let a = mem.select(RegClass::Int);
        let _b = mem.select(RegClass::Int);
        mem.release(a);

        // A float value must not reuse the integer slot.
        let f = mem.select(RegClass::Num);
        assert_ne!(f, a);

        let c = mem.select(RegClass::Int);
        assert_eq!(c, a);
        assert_eq!(mem.slot_count(), 3);
    }

    #[test]
    fn test_double_release_is_noop() {
        let mut mem = SpillMemory::new(0);
        let a = mem.select(RegClass::Ptr);
        let b = mem.select(RegClass::Ptr);
        mem.release(a);
        mem.release(a);
        mem.release(a);
        assert_eq!(mem.free_count(RegClass::Ptr), 1);

        mem.release(b);
        assert_eq!(mem.free_count(RegClass::Ptr), 2);

        let x = mem.select(RegClass::Ptr);
        let y = mem.select(RegClass::Ptr);
        assert_ne!(x, y);
        assert_eq!(mem.free_count(RegClass::Ptr), 0);
        assert_eq!(mem.slot_count(), 2);
    }

    #[test]
    fn test_release_unknown_slot() {
        let mut mem = SpillMemory::new(0);
        mem.release(12);
        assert_eq!(mem.slot_count(), 0);
    }
}
