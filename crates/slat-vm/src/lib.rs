//! Guest memory context and fault-driven shadow mapping.
//!
//! A [`GuestSystem`] owns one guest's view of memory: its translation root,
//! its configured physical size, and (once bound) the shadow tables mirroring
//! its mapping over a reserved 512 GiB region. The region is split into
//! windows by the high offset bits:
//!
//! - `[0, 4 GiB)` — direct guest-physical access
//! - `[8 GiB, 12 GiB)` — guest-virtual access, resolved through the guest's
//!   own translation tables
//!
//! Accesses go through the byte/word access layer, which probes the software
//! TLB and the shadow tables and, on a miss, runs the fault handler. A fault
//! either installs a shadow mapping or reports a typed [`VmFault`]; there is
//! no retry and no suspension inside a fault.

#![forbid(unsafe_code)]

mod fault;
mod tlb;

pub use fault::{
    AccessKind, VmFault, FAULT_BAD_WINDOW, FAULT_NOT_PRESENT, FAULT_PROTECTION,
    FAULT_TRANSLATION_IO,
};

use std::sync::{Arc, Mutex, RwLock};

use slat_mem::{PagePool, PAGE_SIZE};
use slat_spt::ShadowSpace;
use thiserror::Error;

use crate::tlb::Tlb;

/// Size of the bound region: one aligned 512 GiB super-page at offset 0.
pub const REGION_SIZE: u64 = 1 << 39;

/// Base offset of the direct guest-physical window.
pub const PHYS_WINDOW_BASE: u64 = 0;

/// Base offset of the guest-virtual window.
pub const VIRT_WINDOW_BASE: u64 = 0x2_0000_0000;

/// Size of each access window.
pub const WINDOW_SIZE: u64 = 0x1_0000_0000;

/// Control-plane failures. Faults taken while accessing the region are
/// reported separately as [`VmFault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("value {0:#x} is not page aligned")]
    Misaligned(u64),

    #[error("size {size:#x} exceeds pool capacity {capacity:#x}")]
    TooBig { size: u64, capacity: u64 },

    #[error("guest is already bound to a region")]
    Busy,

    #[error("could not back the requested size (achieved {achieved:#x} of {requested:#x})")]
    Exhausted { requested: u64, achieved: u64 },

    #[error("region request must be one aligned 512 GiB window at offset 0")]
    InvalidRegion,
}

/// Construction options for [`GuestSystem`].
#[derive(Debug, Clone, Copy)]
pub struct GuestSystemOptions {
    /// Cap on shadow-table arena nodes; exhaustion surfaces as
    /// [`VmFault::OutOfMemory`].
    pub shadow_node_limit: usize,
}

impl Default for GuestSystemOptions {
    fn default() -> Self {
        Self {
            shadow_node_limit: usize::MAX,
        }
    }
}

struct GuestState {
    translation_root: u32,
    phys_mem_size: u64,
    bound: bool,
}

/// One guest context.
///
/// The short state mutex orders control-plane mutations; the shadow `RwLock`
/// is the broader, sleep-capable lock over the shadow address space. The
/// state lock is only ever taken for a snapshot and released before any other
/// lock, so lock order is state → shadow → TLB → pool slot.
pub struct GuestSystem {
    pool: Arc<PagePool>,
    state: Mutex<GuestState>,
    shadow: RwLock<Option<ShadowSpace>>,
    tlb: Mutex<Tlb>,
    options: GuestSystemOptions,
}

impl GuestSystem {
    pub fn new(pool: Arc<PagePool>) -> Self {
        Self::with_options(pool, GuestSystemOptions::default())
    }

    pub fn with_options(pool: Arc<PagePool>, options: GuestSystemOptions) -> Self {
        Self {
            pool,
            state: Mutex::new(GuestState {
                translation_root: 0,
                phys_mem_size: 0,
                bound: false,
            }),
            shadow: RwLock::new(None),
            tlb: Mutex::new(Tlb::new()),
            options,
        }
    }

    /// Configure the guest's physical memory size and back it with pool
    /// pages.
    ///
    /// On an allocation shortfall the achieved size is stored and reported in
    /// [`ControlError::Exhausted`]; nothing is unwound.
    pub fn start(&self, size: u64) -> Result<(), ControlError> {
        if size & (PAGE_SIZE as u64 - 1) != 0 {
            return Err(ControlError::Misaligned(size));
        }
        if size > self.pool.capacity_bytes() {
            return Err(ControlError::TooBig {
                size,
                capacity: self.pool.capacity_bytes(),
            });
        }

        let old = {
            let state = self.state.lock().unwrap();
            if state.bound {
                return Err(ControlError::Busy);
            }
            state.phys_mem_size
        };

        let achieved = self.pool.resize(old, size);
        self.state.lock().unwrap().phys_mem_size = achieved;
        tracing::debug!(requested = size, achieved, "guest physical memory configured");

        if achieved != size {
            return Err(ControlError::Exhausted {
                requested: size,
                achieved,
            });
        }
        Ok(())
    }

    /// Update the translation root and invalidate the guest-virtual window.
    pub fn set_translation_root(&self, root: u32) -> Result<(), ControlError> {
        if root & (PAGE_SIZE as u32 - 1) != 0 {
            return Err(ControlError::Misaligned(u64::from(root)));
        }
        self.state.lock().unwrap().translation_root = root;
        self.flush_virtual_window();
        tracing::debug!(root, "translation root updated");
        Ok(())
    }

    /// Lazily invalidate every shadow mapping in the guest-virtual window,
    /// then flush the whole translation cache.
    ///
    /// Holds the shadow space's exclusive lock for the full deactivate walk.
    pub fn flush_virtual_window(&self) {
        let mut shadow = self.shadow.write().unwrap();
        if let Some(space) = shadow.as_mut() {
            space.deactivate_range(VIRT_WINDOW_BASE, VIRT_WINDOW_BASE + WINDOW_SIZE);
        }
        drop(shadow);
        self.tlb.lock().unwrap().flush_all();
    }

    /// Attach the guest to its region. Only a single aligned 512 GiB window
    /// at offset 0 is accepted.
    pub fn bind_region(&self, offset: u64, len: u64) -> Result<(), ControlError> {
        if offset != 0 || len != REGION_SIZE {
            return Err(ControlError::InvalidRegion);
        }
        {
            let mut state = self.state.lock().unwrap();
            if state.bound {
                return Err(ControlError::Busy);
            }
            state.bound = true;
        }
        *self.shadow.write().unwrap() =
            Some(ShadowSpace::with_node_limit(self.options.shadow_node_limit));
        tracing::debug!("guest bound to region");
        Ok(())
    }

    /// Tear the context down: shrink the backed size to 0, reclaim the shadow
    /// tables and drop the region binding.
    pub fn release(&self) {
        let old = {
            let mut state = self.state.lock().unwrap();
            let old = state.phys_mem_size;
            state.phys_mem_size = 0;
            state.bound = false;
            old
        };
        self.pool.resize(old, 0);
        *self.shadow.write().unwrap() = None;
        self.tlb.lock().unwrap().flush_all();
        tracing::debug!("guest context released");
    }

    pub fn phys_mem_size(&self) -> u64 {
        self.state.lock().unwrap().phys_mem_size
    }

    pub fn translation_root(&self) -> u32 {
        self.state.lock().unwrap().translation_root
    }

    pub fn is_bound(&self) -> bool {
        self.state.lock().unwrap().bound
    }

    /// Pool page the installed shadow mapping for `offset` currently names,
    /// if any. Deactivated mappings are reported as absent, the same way an
    /// access would see them.
    pub fn resolved_page(&self, offset: u64) -> Option<u32> {
        let shadow = self.shadow.read().unwrap();
        let space = shadow.as_ref()?;
        let slot = space.lookup_leaf(offset).ok()?;
        match space.leaf(slot) {
            slat_spt::LeafEntry::Present(mapping) => Some(mapping.page),
            _ => None,
        }
    }

    /// Read `dst.len()` bytes from the bound region starting at `offset`.
    pub fn read(&self, offset: u64, dst: &mut [u8]) -> Result<(), VmFault> {
        let mut cur = offset;
        let mut remaining = dst;
        while !remaining.is_empty() {
            let off_in_page = (cur as usize) & (PAGE_SIZE - 1);
            let take = (PAGE_SIZE - off_in_page).min(remaining.len());
            let mapping = self.resolve(cur, AccessKind::Read)?;
            let (head, tail) = remaining.split_at_mut(take);
            self.pool
                .with_page(mapping.page as usize, |page| {
                    head.copy_from_slice(&page[off_in_page..off_in_page + take])
                })
                .map_err(|_| VmFault::SegFault {
                    code: FAULT_PROTECTION,
                    offset: cur,
                })?;
            cur += take as u64;
            remaining = tail;
        }
        Ok(())
    }

    /// Write `src` into the bound region starting at `offset`.
    pub fn write(&self, offset: u64, src: &[u8]) -> Result<(), VmFault> {
        let mut cur = offset;
        let mut remaining = src;
        while !remaining.is_empty() {
            let off_in_page = (cur as usize) & (PAGE_SIZE - 1);
            let take = (PAGE_SIZE - off_in_page).min(remaining.len());
            let mapping = self.resolve(cur, AccessKind::Write)?;
            self.pool
                .with_page(mapping.page as usize, |page| {
                    page[off_in_page..off_in_page + take].copy_from_slice(&remaining[..take])
                })
                .map_err(|_| VmFault::SegFault {
                    code: FAULT_PROTECTION,
                    offset: cur,
                })?;
            cur += take as u64;
            remaining = &remaining[take..];
        }
        Ok(())
    }

    pub fn read_u8(&self, offset: u64) -> Result<u8, VmFault> {
        let mut buf = [0u8; 1];
        self.read(offset, &mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u32(&self, offset: u64) -> Result<u32, VmFault> {
        let mut buf = [0u8; 4];
        self.read(offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn write_u8(&self, offset: u64, value: u8) -> Result<(), VmFault> {
        self.write(offset, &[value])
    }

    pub fn write_u32(&self, offset: u64, value: u32) -> Result<(), VmFault> {
        self.write(offset, &value.to_le_bytes())
    }

    /// Resolve one page-sized access: TLB, then shadow tables, then the fault
    /// handler.
    fn resolve(&self, offset: u64, access: AccessKind) -> Result<slat_spt::LeafMapping, VmFault> {
        // The shadow space only spans the bound region; offsets past it must
        // not reach the TLB or shadow index arithmetic.
        if offset >= REGION_SIZE {
            return Err(VmFault::BusError {
                code: FAULT_BAD_WINDOW,
                offset,
            });
        }

        let page_offset = offset & !(PAGE_SIZE as u64 - 1);

        if let Some(mapping) = self.tlb.lock().unwrap().lookup(page_offset) {
            if access != AccessKind::Write || mapping.writable {
                return Ok(mapping);
            }
        }

        {
            let shadow = self.shadow.read().unwrap();
            if let Some(space) = shadow.as_ref() {
                if let Ok(slot) = space.lookup_leaf(page_offset) {
                    if let slat_spt::LeafEntry::Present(mapping) = space.leaf(slot) {
                        if access != AccessKind::Write || mapping.writable {
                            self.tlb.lock().unwrap().insert(page_offset, mapping);
                            return Ok(mapping);
                        }
                    }
                }
            }
        }

        self.handle_fault(offset, access)
    }
}

impl core::fmt::Debug for GuestSystem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("GuestSystem")
            .field("translation_root", &state.translation_root)
            .field("phys_mem_size", &state.phys_mem_size)
            .field("bound", &state.bound)
            .finish_non_exhaustive()
    }
}
