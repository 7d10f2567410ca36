//! Virtual-window behavior against guest-managed translation tables,
//! including the staleness contract: shadow mappings keep serving until the
//! translation root is rewritten.

use std::sync::Arc;

use slat_mem::{PagePool, PAGE_SIZE};
use slat_mmu::{ENTRY_PRESENT, ENTRY_WRITE_PROTECT};
use slat_vm::{
    GuestSystem, VmFault, FAULT_NOT_PRESENT, FAULT_PROTECTION, FAULT_TRANSLATION_IO, REGION_SIZE,
    VIRT_WINDOW_BASE,
};

const ROOT: u32 = 0x1000;
const PAGE_TABLE: u32 = 0x5000;

/// Guest with 16 pages of physical memory and a two-level table mapping
/// guest-virtual page 0 to guest-physical frame 0x2000. The tables are
/// written through the direct window, the way a guest would write them.
fn guest_with_tables() -> GuestSystem {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let pool = Arc::new(PagePool::with_capacity(64));
    let guest = GuestSystem::new(pool);
    guest.start(16 * PAGE_SIZE as u64).unwrap();
    guest.bind_region(0, REGION_SIZE).unwrap();

    guest
        .write_u32(u64::from(ROOT), PAGE_TABLE | ENTRY_PRESENT)
        .unwrap();
    guest
        .write_u32(u64::from(PAGE_TABLE), 0x2000 | ENTRY_PRESENT)
        .unwrap();
    guest.set_translation_root(ROOT).unwrap();
    guest
}

#[test]
fn virtual_write_lands_in_the_mapped_frame() {
    let guest = guest_with_tables();

    guest.write_u32(VIRT_WINDOW_BASE, 0xCAFE_BABE).unwrap();
    assert_eq!(guest.read_u32(0x2000).unwrap(), 0xCAFE_BABE);
    assert_eq!(guest.read_u32(VIRT_WINDOW_BASE).unwrap(), 0xCAFE_BABE);
}

#[test]
fn shadow_mapping_stays_stale_until_root_rewrite() {
    let guest = guest_with_tables();

    guest.write_u32(VIRT_WINDOW_BASE, 0xCAFE_BABE).unwrap();
    assert_eq!(guest.read_u32(0x2000).unwrap(), 0xCAFE_BABE);

    // The guest retargets page 0 at frame 0x3000 without telling anyone.
    guest
        .write_u32(u64::from(PAGE_TABLE), 0x3000 | ENTRY_PRESENT)
        .unwrap();

    // The installed shadow mapping still wins: the write lands in 0x2000.
    guest.write_u32(VIRT_WINDOW_BASE, 0xDEAD_BEEF).unwrap();
    assert_eq!(guest.read_u32(0x2000).unwrap(), 0xDEAD_BEEF);
    assert_eq!(guest.read_u32(0x3000).unwrap(), 0);

    // Rewriting the root invalidates the window; the next access re-walks.
    guest.set_translation_root(ROOT).unwrap();
    guest.write_u32(VIRT_WINDOW_BASE, 0x0D15_EA5E).unwrap();
    assert_eq!(guest.read_u32(0x3000).unwrap(), 0x0D15_EA5E);
    assert_eq!(guest.read_u32(0x2000).unwrap(), 0xDEAD_BEEF);
}

#[test]
fn unmapped_virtual_page_is_not_present_fault() {
    let guest = guest_with_tables();

    // Segment 1 has no segment entry.
    let offset = VIRT_WINDOW_BASE + (1 << 22);
    assert_eq!(
        guest.read_u32(offset),
        Err(VmFault::SegFault {
            code: FAULT_NOT_PRESENT,
            offset,
        })
    );
    // The failed resolution must not have left a shadow mapping behind.
    assert_eq!(guest.resolved_page(offset), None);
}

#[test]
fn unreadable_tables_are_a_bus_error() {
    let pool = Arc::new(PagePool::with_capacity(64));
    let guest = GuestSystem::new(pool);
    guest.start(16 * PAGE_SIZE as u64).unwrap();
    guest.bind_region(0, REGION_SIZE).unwrap();

    // Root points past the configured physical size.
    guest.set_translation_root(0x10_0000).unwrap();
    assert_eq!(
        guest.read_u32(VIRT_WINDOW_BASE),
        Err(VmFault::BusError {
            code: FAULT_TRANSLATION_IO,
            offset: VIRT_WINDOW_BASE,
        })
    );
}

#[test]
fn mapped_frame_past_physical_size_is_protection_fault() {
    let guest = guest_with_tables();

    // Frame beyond the 16-page physical size.
    guest
        .write_u32(u64::from(PAGE_TABLE), 0x4_0000 | ENTRY_PRESENT)
        .unwrap();
    guest.set_translation_root(ROOT).unwrap();

    assert_eq!(
        guest.read_u32(VIRT_WINDOW_BASE),
        Err(VmFault::SegFault {
            code: FAULT_PROTECTION,
            offset: VIRT_WINDOW_BASE,
        })
    );
}

#[test]
fn write_protect_blocks_writes_but_not_reads() {
    let guest = guest_with_tables();

    guest.write_u32(0x2000, 0x1234_5678).unwrap();
    guest
        .write_u32(
            u64::from(PAGE_TABLE),
            0x2000 | ENTRY_PRESENT | ENTRY_WRITE_PROTECT,
        )
        .unwrap();
    guest.set_translation_root(ROOT).unwrap();

    // Reads install and use a read-only mapping.
    assert_eq!(guest.read_u32(VIRT_WINDOW_BASE).unwrap(), 0x1234_5678);

    // A write faults again and is refused with the protection code.
    assert_eq!(
        guest.write_u32(VIRT_WINDOW_BASE, 0),
        Err(VmFault::SegFault {
            code: FAULT_PROTECTION,
            offset: VIRT_WINDOW_BASE,
        })
    );

    // The refused write must not have destroyed readability.
    assert_eq!(guest.read_u32(VIRT_WINDOW_BASE).unwrap(), 0x1234_5678);
}
