//! Guest two-level table walk.
//!
//! The guest lays out its own translation tables in guest physical memory:
//! a segment table named by the translation root, whose entries point at
//! page tables. Entries are 4-byte little-endian words with the frame in the
//! high bits, present in bit 0 and write-protect in bit 1. Each table has
//! 1024 entries, so a segment covers 4 MiB of guest-virtual space.
//!
//! The walk is a pure function of the pool contents and its inputs; it never
//! mutates guest memory.

#![forbid(unsafe_code)]

use slat_mem::PagePool;

pub const ENTRY_PRESENT: u32 = 1 << 0;
pub const ENTRY_WRITE_PROTECT: u32 = 1 << 1;
pub const ENTRY_FRAME_MASK: u32 = 0xFFFF_F000;

pub const TABLE_ENTRIES: usize = 1024;

/// A successful walk: the guest-physical frame backing a guest-virtual page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    /// Page-aligned guest-physical target of the leaf entry.
    pub frame: u32,
    /// Leaf entry's write-protect bit.
    pub write_protected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslateError {
    /// A segment or page entry on the walked path has its present bit clear.
    NotPresent,
    /// A table entry could not be read out of guest physical memory.
    Io,
}

impl core::fmt::Display for TranslateError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TranslateError::NotPresent => write!(f, "guest table entry not present"),
            TranslateError::Io => write!(f, "guest table entry unreadable"),
        }
    }
}

impl std::error::Error for TranslateError {}

/// Resolve guest-virtual `voffset` against the guest's tables.
///
/// `phys_limit` is the owning context's configured guest physical size; table
/// reads past it fail the walk with [`TranslateError::Io`].
pub fn translate(
    pool: &PagePool,
    phys_limit: u64,
    root: u32,
    voffset: u32,
) -> Result<Mapping, TranslateError> {
    let segment_index = (voffset >> 22) & 0x3FF;

    // Both levels are indexed with the segment index; the page-index bits
    // 21:12 do not participate in the walk. Guest tables are laid out for
    // this walker, which is not x86 paging.
    let segment_entry_addr = root.wrapping_add(segment_index * 4);
    let segment_entry = pool
        .read_word(phys_limit, segment_entry_addr)
        .map_err(|_| TranslateError::Io)?;
    if segment_entry & ENTRY_PRESENT == 0 {
        return Err(TranslateError::NotPresent);
    }

    let table_origin = segment_entry & ENTRY_FRAME_MASK;
    let page_entry_addr = table_origin.wrapping_add(segment_index * 4);
    let page_entry = pool
        .read_word(phys_limit, page_entry_addr)
        .map_err(|_| TranslateError::Io)?;
    if page_entry & ENTRY_PRESENT == 0 {
        return Err(TranslateError::NotPresent);
    }

    Ok(Mapping {
        frame: page_entry & ENTRY_FRAME_MASK,
        write_protected: page_entry & ENTRY_WRITE_PROTECT != 0,
    })
}
