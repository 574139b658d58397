//! Shadow region mapping.
//!
//! Backs a range of the shadow region with zeroed physical pages by
//! installing entries in the EL2 Stage-1 page table (TTBR0_EL2). Pages that
//! are already mapped (shadow ranges of neighbouring regions can share a
//! page) are left untouched. AArch64 only.

#[cfg(all(target_arch = "aarch64", feature = "axhal"))]
use alloc::vec::Vec;

use axerrno::AxResult;

#[cfg(all(target_arch = "aarch64", feature = "axhal"))]
const PAGE_SIZE: usize = 0x1000;

#[cfg(all(target_arch = "aarch64", feature = "axhal"))]
mod pte {
    pub const VALID: u64 = 1 << 0;
    pub const TABLE: u64 = 1 << 1;
    pub const PAGE: u64 = 1 << 1;
    pub const AF: u64 = 1 << 10;
    pub const SH_ISH: u64 = 0b11 << 8;
    pub const AP_RW: u64 = 0b00 << 6;
    pub const ATTR_IDX_NORMAL: u64 = 0 << 2;
    /// Execute-never for EL2.
    pub const XN: u64 = 1 << 54;
    pub const ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

    /// L3 flags for shadow pages: normal RW data memory, never executable.
    pub const SHADOW_PAGE_FLAGS: u64 = VALID | PAGE | AF | SH_ISH | AP_RW | ATTR_IDX_NORMAL | XN;

    pub const TABLE_FLAGS: u64 = VALID | TABLE;
}

#[cfg(all(target_arch = "aarch64", feature = "axhal"))]
fn page_table_root_phys() -> u64 {
    let ttbr: u64;
    unsafe {
        core::arch::asm!("mrs {}, ttbr0_el2", out(reg) ttbr, options(nomem, nostack));
    }
    ttbr & pte::ADDR_MASK
}

#[cfg(all(target_arch = "aarch64", feature = "axhal"))]
fn phys_to_virt(paddr: u64) -> usize {
    axhal::mem::phys_to_virt((paddr as usize).into()).as_usize()
}

#[cfg(all(target_arch = "aarch64", feature = "axhal"))]
fn virt_to_phys(vaddr: usize) -> u64 {
    axhal::mem::virt_to_phys((vaddr).into()).as_usize() as u64
}

#[cfg(all(target_arch = "aarch64", feature = "axhal"))]
fn flush_tlb() {
    unsafe {
        core::arch::asm!(
            "dsb ishst",
            "tlbi alle2is",
            "dsb ish",
            "isb",
            options(nomem, nostack),
        );
    }
}

/// A page this mapping pass allocated and linked into the page table.
#[cfg(all(target_arch = "aarch64", feature = "axhal"))]
struct Installed {
    /// Entry pointing at the page.
    entry: *mut u64,
    paddr: u64,
    table: bool,
}

#[cfg(all(target_arch = "aarch64", feature = "axhal"))]
fn usage_kind(table: bool) -> axalloc::UsageKind {
    if table {
        axalloc::UsageKind::PageTable
    } else {
        axalloc::UsageKind::Global
    }
}

/// Allocate a zeroed page, returning its physical address.
#[cfg(all(target_arch = "aarch64", feature = "axhal"))]
fn alloc_zeroed_page(table: bool) -> Option<u64> {
    let vaddr = axalloc::global_allocator()
        .alloc_pages(1, PAGE_SIZE, usage_kind(table))
        .ok()?;
    unsafe {
        core::ptr::write_bytes(vaddr as *mut u8, 0, PAGE_SIZE);
    }
    Some(virt_to_phys(vaddr))
}

/// Allocate a zeroed page and link it into `entry_ptr`.
#[cfg(all(target_arch = "aarch64", feature = "axhal"))]
fn install(
    entry_ptr: *mut u64,
    table: bool,
    installed: &mut Vec<Installed>,
) -> Option<u64> {
    let paddr = alloc_zeroed_page(table)?;
    let flags = if table {
        pte::TABLE_FLAGS
    } else {
        pte::SHADOW_PAGE_FLAGS
    };
    unsafe {
        core::ptr::write_volatile(entry_ptr, (paddr & pte::ADDR_MASK) | flags);
    }
    installed.push(Installed {
        entry: entry_ptr,
        paddr,
        table,
    });
    Some(paddr)
}

/// Return the next-level table behind `table_paddr[index]`, creating it if absent.
#[cfg(all(target_arch = "aarch64", feature = "axhal"))]
fn get_or_create_table(
    table_paddr: u64,
    index: usize,
    installed: &mut Vec<Installed>,
) -> Option<u64> {
    let entry_ptr = (phys_to_virt(table_paddr) + index * 8) as *mut u64;
    let entry = unsafe { core::ptr::read_volatile(entry_ptr) };

    if entry & pte::VALID != 0 {
        if entry & pte::TABLE == 0 {
            log::warn!("kasan: block descriptor in shadow range at index {}", index);
            return None;
        }
        return Some(entry & pte::ADDR_MASK);
    }

    install(entry_ptr, true, installed)
}

/// Pointer to the L3 entry for `vaddr`, creating intermediate tables.
#[cfg(all(target_arch = "aarch64", feature = "axhal"))]
fn l3_entry(vaddr: usize, installed: &mut Vec<Installed>) -> Option<*mut u64> {
    let l0_idx = (vaddr >> 39) & 0x1FF;
    let l1_idx = (vaddr >> 30) & 0x1FF;
    let l2_idx = (vaddr >> 21) & 0x1FF;
    let l3_idx = (vaddr >> 12) & 0x1FF;

    let l1 = get_or_create_table(page_table_root_phys(), l0_idx, installed)?;
    let l2 = get_or_create_table(l1, l1_idx, installed)?;
    let l3 = get_or_create_table(l2, l2_idx, installed)?;
    Some((phys_to_virt(l3) + l3_idx * 8) as *mut u64)
}

/// Back the shadow page at `vaddr`. Already mapped pages are left alone.
#[cfg(all(target_arch = "aarch64", feature = "axhal"))]
fn map_shadow_page(vaddr: usize, installed: &mut Vec<Installed>) -> Option<()> {
    let entry_ptr = l3_entry(vaddr, installed)?;
    if unsafe { core::ptr::read_volatile(entry_ptr) } & pte::VALID != 0 {
        return Some(());
    }
    install(entry_ptr, false, installed).map(|_| ())
}

/// Unlink and free `installed`, newest first, so tables outlive their entries.
#[cfg(all(target_arch = "aarch64", feature = "axhal"))]
fn rollback(installed: Vec<Installed>) {
    for page in installed.iter().rev() {
        unsafe {
            core::ptr::write_volatile(page.entry, 0);
        }
    }
    flush_tlb();

    let allocator = axalloc::global_allocator();
    for page in installed.into_iter().rev() {
        allocator.dealloc_pages(phys_to_virt(page.paddr), 1, usage_kind(page.table));
    }
}

/// Back `[start, start + size)` of the shadow region with zeroed pages.
///
/// On failure every page and table allocated by this call is unlinked and
/// freed again.
#[cfg(all(target_arch = "aarch64", feature = "axhal"))]
pub fn map_shadow(start: usize, size: usize) -> AxResult<()> {
    if size == 0 {
        return Ok(());
    }

    let first = start & !(PAGE_SIZE - 1);
    let end = (start + size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let mut installed = Vec::new();

    for vaddr in (first..end).step_by(PAGE_SIZE) {
        if map_shadow_page(vaddr, &mut installed).is_none() {
            log::error!("kasan: failed to map shadow page at {:#x}", vaddr);
            rollback(installed);
            return axerrno::ax_err!(NoMemory, "shadow page allocation failed");
        }
    }

    flush_tlb();
    log::debug!(
        "kasan: shadow {:#x}..{:#x} backed by {} new pages",
        first,
        end,
        installed.len()
    );
    Ok(())
}

#[cfg(not(all(target_arch = "aarch64", feature = "axhal")))]
pub fn map_shadow(start: usize, size: usize) -> AxResult<()> {
    log::warn!(
        "kasan: cannot map shadow {:#x}+{:#x} on this platform",
        start,
        size
    );
    axerrno::ax_err!(Unsupported, "shadow mapping not implemented for this platform")
}
