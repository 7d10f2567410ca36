//! Direct-mapped translation cache in front of the shadow tables.

use slat_mem::{PAGE_SHIFT, PAGE_SIZE};
use slat_spt::LeafMapping;

const TLB_SETS: usize = 256;

#[derive(Debug, Clone, Copy)]
struct Slot {
    tag: u64,
    mapping: LeafMapping,
    valid: bool,
}

const EMPTY_SLOT: Slot = Slot {
    tag: 0,
    mapping: LeafMapping {
        page: 0,
        writable: false,
    },
    valid: false,
};

/// Direct-mapped cache keyed by page-aligned region offset.
pub(crate) struct Tlb {
    slots: Box<[Slot; TLB_SETS]>,
}

#[inline]
fn set_index(page_offset: u64) -> usize {
    ((page_offset >> PAGE_SHIFT) as usize) & (TLB_SETS - 1)
}

impl Tlb {
    pub(crate) fn new() -> Self {
        Self {
            slots: Box::new([EMPTY_SLOT; TLB_SETS]),
        }
    }

    pub(crate) fn lookup(&self, page_offset: u64) -> Option<LeafMapping> {
        debug_assert_eq!(page_offset & (PAGE_SIZE as u64 - 1), 0);
        let slot = &self.slots[set_index(page_offset)];
        (slot.valid && slot.tag == page_offset).then_some(slot.mapping)
    }

    pub(crate) fn insert(&mut self, page_offset: u64, mapping: LeafMapping) {
        debug_assert_eq!(page_offset & (PAGE_SIZE as u64 - 1), 0);
        self.slots[set_index(page_offset)] = Slot {
            tag: page_offset,
            mapping,
            valid: true,
        };
    }

    pub(crate) fn invalidate(&mut self, page_offset: u64) {
        let slot = &mut self.slots[set_index(page_offset)];
        if slot.tag == page_offset {
            slot.valid = false;
        }
    }

    pub(crate) fn flush_all(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.valid = false;
        }
    }
}
