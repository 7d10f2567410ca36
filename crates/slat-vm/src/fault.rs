//! Fault classification and shadow-mapping installation.
//!
//! A fault is taken when an access finds no usable shadow mapping. The
//! handler classifies the faulting offset into a window, clears whatever
//! stale mapping the leaf slot still holds, resolves the target pool page
//! (directly for the physical window, through the guest's own tables for the
//! virtual window) and installs the fresh mapping. Every failure is reported
//! as a typed [`VmFault`] carrying the architectural code and the faulting
//! offset; the handler never retries and never blocks on anything but its
//! own locks.

use slat_mem::PAGE_SHIFT;
use slat_spt::{LeafEntry, LeafMapping, SpaceError};
use thiserror::Error;

use crate::{GuestSystem, PHYS_WINDOW_BASE, VIRT_WINDOW_BASE};

/// Segmentation-fault code: guest table entry not present.
pub const FAULT_NOT_PRESENT: u32 = 0x101;
/// Bus-error code: guest table entry could not be read.
pub const FAULT_TRANSLATION_IO: u32 = 0x102;
/// Segmentation-fault code: write to a protected page, or a target frame
/// outside the configured physical size.
pub const FAULT_PROTECTION: u32 = 0x103;
/// Bus-error code: the offset lies in no access window.
pub const FAULT_BAD_WINDOW: u32 = 0x2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

/// A fault the handler could not resolve into a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmFault {
    #[error("segmentation fault (code {code:#x}) at offset {offset:#x}")]
    SegFault { code: u32, offset: u64 },

    #[error("bus error (code {code:#x}) at offset {offset:#x}")]
    BusError { code: u32, offset: u64 },

    #[error("shadow tables exhausted handling fault at offset {offset:#x}")]
    OutOfMemory { offset: u64 },
}

/// Access windows carved out of the bound region by offset bits 39:32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Window {
    Physical,
    Virtual,
}

impl Window {
    fn classify(offset: u64) -> Option<Window> {
        match offset >> 32 {
            0 => Some(Window::Physical),
            2 => Some(Window::Virtual),
            _ => None,
        }
    }
}

impl GuestSystem {
    /// Resolve a faulting access at `offset` into an installed shadow
    /// mapping.
    pub(crate) fn handle_fault(
        &self,
        offset: u64,
        access: AccessKind,
    ) -> Result<LeafMapping, VmFault> {
        let window = Window::classify(offset);

        let (root, phys_size) = {
            let state = self.state.lock().unwrap();
            (state.translation_root, state.phys_mem_size)
        };

        let mut shadow = self.shadow.write().unwrap();
        let (Some(space), Some(window)) = (shadow.as_mut(), window) else {
            return Err(VmFault::BusError {
                code: FAULT_BAD_WINDOW,
                offset,
            });
        };

        let page_offset = offset & !((1u64 << PAGE_SHIFT) - 1);
        let slot = space.ensure_leaf(page_offset).map_err(|e| match e {
            SpaceError::OutOfMemory => VmFault::OutOfMemory { offset },
            SpaceError::NotMapped => VmFault::BusError {
                code: FAULT_BAD_WINDOW,
                offset,
            },
        })?;

        // Drop whatever the slot held before resolving; if resolution fails
        // the next access refaults from a clean slate.
        if !matches!(space.leaf(slot), LeafEntry::Empty) {
            space.set_leaf(slot, LeafEntry::Empty);
            self.tlb.lock().unwrap().invalidate(page_offset);
        }

        let (frame, write_protected) = match window {
            Window::Physical => ((page_offset - PHYS_WINDOW_BASE) as u32, false),
            Window::Virtual => {
                let voffset = (page_offset - VIRT_WINDOW_BASE) as u32;
                let mapping =
                    slat_mmu::translate(&self.pool, phys_size, root, voffset).map_err(
                        |e| match e {
                            slat_mmu::TranslateError::NotPresent => VmFault::SegFault {
                                code: FAULT_NOT_PRESENT,
                                offset,
                            },
                            slat_mmu::TranslateError::Io => VmFault::BusError {
                                code: FAULT_TRANSLATION_IO,
                                offset,
                            },
                        },
                    )?;
                if access == AccessKind::Write && mapping.write_protected {
                    return Err(VmFault::SegFault {
                        code: FAULT_PROTECTION,
                        offset,
                    });
                }
                (mapping.frame, mapping.write_protected)
            }
        };

        if u64::from(frame) >= phys_size {
            return Err(VmFault::SegFault {
                code: FAULT_PROTECTION,
                offset,
            });
        }

        let mapping = LeafMapping {
            page: frame >> PAGE_SHIFT,
            writable: !write_protected,
        };
        space.set_leaf(slot, LeafEntry::Present(mapping));
        self.tlb.lock().unwrap().insert(page_offset, mapping);
        tracing::trace!(
            offset,
            page = mapping.page,
            writable = mapping.writable,
            "shadow mapping installed"
        );
        Ok(mapping)
    }
}
