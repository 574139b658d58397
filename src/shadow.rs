//! Shadow memory addressing and shadow byte encoding.
//!
//! Every 8-byte granule of kernel memory is described by one shadow byte
//! located at `(addr >> SHADOW_SCALE_SHIFT) + SHADOW_OFFSET`:
//!
//! - `0x00` - all 8 bytes are accessible
//! - `0x01..=0x07` - only the first `k` bytes are accessible
//! - `0x80..=0xFF` - the whole granule is poisoned, the value names why
//!   (see [`PoisonKind`])
//!
//! The storage behind those shadow addresses is pluggable through
//! [`ShadowMemory`] so the same checking code runs against the real shadow
//! region in the kernel and against a software shadow on the host.

use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicUsize, Ordering};

use axerrno::AxResult;
use spin::Mutex;

use crate::config::{MAX_REGIONS, MemRegion};

/// log2 of the number of kernel bytes covered by one shadow byte.
pub const SHADOW_SCALE_SHIFT: usize = 3;

/// Number of kernel bytes covered by one shadow byte.
pub const GRANULE_SIZE: usize = 1 << SHADOW_SCALE_SHIFT;

/// Mask selecting the offset inside a granule.
pub const GRANULE_MASK: usize = GRANULE_SIZE - 1;

/// Base of the shadow region.
///
/// Lives in the EL2 lower-half VA space, below the vmap window.
#[cfg(target_arch = "aarch64")]
pub const SHADOW_OFFSET: usize = 0x0000_D000_0000_0000;

#[cfg(all(target_pointer_width = "64", not(target_arch = "aarch64")))]
pub const SHADOW_OFFSET: usize = 0xDFFF_FC00_0000_0000;

#[cfg(target_pointer_width = "32")]
pub const SHADOW_OFFSET: usize = 0xE000_0000;

const _: () = assert!(GRANULE_SIZE == 8);

/// Translate a kernel virtual address to the address of its shadow byte.
#[inline(always)]
pub const fn mem_to_shadow(addr: usize) -> usize {
    (addr >> SHADOW_SCALE_SHIFT).wrapping_add(SHADOW_OFFSET)
}

/// First kernel address covered by the given shadow byte.
#[inline]
pub const fn shadow_to_mem(shadow_addr: usize) -> usize {
    shadow_addr.wrapping_sub(SHADOW_OFFSET) << SHADOW_SCALE_SHIFT
}

/// Round `addr` down to the start of its granule.
#[inline]
pub const fn granule_start(addr: usize) -> usize {
    addr & !GRANULE_MASK
}

/// Why a granule is poisoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PoisonKind {
    /// Page returned to the page allocator.
    PageFree = 0xFF,
    /// Tail of a page allocation.
    PageRedzone = 0xFE,
    /// Redzone around a slab object.
    SlabRedzone = 0xFC,
    /// Freed slab object.
    SlabFree = 0xFB,
    /// Redzone after a global variable.
    GlobalRedzone = 0xF9,
    /// Unmapped or not-yet-populated vmalloc area.
    VmallocInvalid = 0xF8,
    /// Left redzone of a stack frame.
    StackLeft = 0xF1,
    /// Redzone between stack variables.
    StackMid = 0xF2,
    /// Right redzone of a stack frame.
    StackRight = 0xF3,
}

impl PoisonKind {
    /// Decode a shadow byte, returning `None` for accessible or unknown values.
    pub const fn from_shadow(value: u8) -> Option<Self> {
        match value {
            0xFF => Some(Self::PageFree),
            0xFE => Some(Self::PageRedzone),
            0xFC => Some(Self::SlabRedzone),
            0xFB => Some(Self::SlabFree),
            0xF9 => Some(Self::GlobalRedzone),
            0xF8 => Some(Self::VmallocInvalid),
            0xF1 => Some(Self::StackLeft),
            0xF2 => Some(Self::StackMid),
            0xF3 => Some(Self::StackRight),
            _ => None,
        }
    }

    /// Shadow byte value for this kind.
    pub const fn as_shadow(self) -> u8 {
        self as u8
    }
}

/// Whether a shadow byte marks its whole granule as poisoned.
#[inline(always)]
pub const fn is_poison_value(value: u8) -> bool {
    (value as i8) < 0
}

/// Storage behind shadow addresses.
pub trait ShadowMemory: Sync {
    /// `false` for the compiled-out strategy: the context then never enables.
    const ACTIVE: bool = true;

    /// Read the shadow byte at `shadow_addr`.
    fn load(&self, shadow_addr: usize) -> u8;

    /// Write the shadow byte at `shadow_addr`.
    fn store(&self, shadow_addr: usize, value: u8);

    /// Whether `addr` is covered by mapped shadow memory.
    fn has_metadata(&self, _addr: usize) -> bool {
        true
    }

    /// Make the shadow bytes for `region` available, initially all clean.
    fn map_region(&self, region: &MemRegion) -> AxResult<()>;

    /// Drop the coverage recorded by `map_region`, after a failed init.
    ///
    /// Mapped shadow pages stay in place and are reused by a later
    /// `map_region` of the same range.
    fn release_regions(&self) {}
}

// =============================================================================
// Null strategy (sanitizer compiled out)
// =============================================================================

/// Shadow backend used when the `kasan` feature is off.
pub struct NullShadow;

impl NullShadow {
    pub const fn new() -> Self {
        Self
    }
}

impl Default for NullShadow {
    fn default() -> Self {
        Self::new()
    }
}

impl ShadowMemory for NullShadow {
    const ACTIVE: bool = false;

    fn load(&self, _shadow_addr: usize) -> u8 {
        0
    }

    fn store(&self, _shadow_addr: usize, _value: u8) {}

    fn has_metadata(&self, _addr: usize) -> bool {
        false
    }

    fn map_region(&self, _region: &MemRegion) -> AxResult<()> {
        Ok(())
    }
}

// =============================================================================
// Software shadow (hosted builds)
// =============================================================================

/// Sparse software shadow: unset bytes read as clean.
///
/// Every address has metadata, so it stands in for a fully mapped shadow
/// region when running in user space.
pub struct SoftShadow {
    bytes: Mutex<BTreeMap<usize, u8>>,
}

impl SoftShadow {
    /// Empty shadow: every address reads as clean.
    pub const fn new() -> Self {
        Self {
            bytes: Mutex::new(BTreeMap::new()),
        }
    }

    /// Number of non-clean shadow bytes.
    pub fn dirty_count(&self) -> usize {
        self.bytes.lock().len()
    }

    /// Reset every shadow byte to clean.
    pub fn clear(&self) {
        self.bytes.lock().clear();
    }
}

impl Default for SoftShadow {
    fn default() -> Self {
        Self::new()
    }
}

impl ShadowMemory for SoftShadow {
    fn load(&self, shadow_addr: usize) -> u8 {
        self.bytes.lock().get(&shadow_addr).copied().unwrap_or(0)
    }

    fn store(&self, shadow_addr: usize, value: u8) {
        let mut bytes = self.bytes.lock();
        if value == 0 {
            bytes.remove(&shadow_addr);
        } else {
            bytes.insert(shadow_addr, value);
        }
    }

    fn map_region(&self, region: &MemRegion) -> AxResult<()> {
        let mut bytes = self.bytes.lock();
        let first = mem_to_shadow(region.start);
        let last = mem_to_shadow(region.last());
        bytes.retain(|&addr, _| addr < first || addr > last);
        Ok(())
    }
}

// =============================================================================
// Direct shadow (kernel builds)
// =============================================================================

struct Coverage {
    start: AtomicUsize,
    end: AtomicUsize,
}

impl Coverage {
    const fn new() -> Self {
        Self {
            start: AtomicUsize::new(0),
            end: AtomicUsize::new(0),
        }
    }
}

/// Shadow backend that accesses the real shadow region.
///
/// Only addresses inside regions passed to `map_region` have metadata;
/// everything else (user space, MMIO, the shadow itself) is never checked.
pub struct DirectShadow {
    covered: [Coverage; MAX_REGIONS],
    count: AtomicUsize,
}

impl DirectShadow {
    /// Backend with no covered region yet.
    pub const fn new() -> Self {
        Self {
            covered: [const { Coverage::new() }; MAX_REGIONS],
            count: AtomicUsize::new(0),
        }
    }

    fn is_covered(&self, region: &MemRegion) -> bool {
        let count = self.count.load(Ordering::Acquire);
        self.covered[..count].iter().any(|c| {
            c.start.load(Ordering::Relaxed) == region.start
                && c.end.load(Ordering::Relaxed) == region.end()
        })
    }
}

impl Default for DirectShadow {
    fn default() -> Self {
        Self::new()
    }
}

impl ShadowMemory for DirectShadow {
    #[inline(always)]
    fn load(&self, shadow_addr: usize) -> u8 {
        unsafe { core::ptr::read_volatile(shadow_addr as *const u8) }
    }

    #[inline(always)]
    fn store(&self, shadow_addr: usize, value: u8) {
        unsafe { core::ptr::write_volatile(shadow_addr as *mut u8, value) }
    }

    #[inline]
    fn has_metadata(&self, addr: usize) -> bool {
        let count = self.count.load(Ordering::Acquire);
        self.covered[..count].iter().any(|c| {
            addr >= c.start.load(Ordering::Relaxed) && addr < c.end.load(Ordering::Relaxed)
        })
    }

    fn map_region(&self, region: &MemRegion) -> AxResult<()> {
        if self.is_covered(region) {
            return Ok(());
        }
        let index = self.count.load(Ordering::Acquire);
        if index >= MAX_REGIONS {
            return axerrno::ax_err!(NoMemory, "no free shadow coverage slot");
        }

        let shadow_start = mem_to_shadow(region.start);
        let shadow_end = mem_to_shadow(region.last()).wrapping_add(1);
        crate::shadow_map::map_shadow(shadow_start, shadow_end.wrapping_sub(shadow_start))?;

        self.covered[index].start.store(region.start, Ordering::Relaxed);
        self.covered[index].end.store(region.end(), Ordering::Relaxed);
        self.count.store(index + 1, Ordering::Release);
        Ok(())
    }

    fn release_regions(&self) {
        self.count.store(0, Ordering::Release);
    }
}

// =============================================================================
// Active strategy
// =============================================================================

/// Shadow backend used by the global context.
#[cfg(all(feature = "kasan", feature = "axhal"))]
pub type ActiveShadow = DirectShadow;

#[cfg(all(feature = "kasan", not(feature = "axhal")))]
pub type ActiveShadow = SoftShadow;

#[cfg(not(feature = "kasan"))]
pub type ActiveShadow = NullShadow;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translation_formula() {
        assert_eq!(mem_to_shadow(0), SHADOW_OFFSET);
        assert_eq!(mem_to_shadow(0x1000), (0x1000 >> 3) + SHADOW_OFFSET);
        assert_eq!(shadow_to_mem(mem_to_shadow(0x1238)), 0x1238);
    }

    #[test]
    fn test_poison_kind_roundtrip_and_sign() {
        for value in [0xFF, 0xFE, 0xFC, 0xFB, 0xF9, 0xF8, 0xF1, 0xF2, 0xF3] {
            let kind = PoisonKind::from_shadow(value).unwrap();
            assert_eq!(kind.as_shadow(), value);
            assert!(is_poison_value(value));
        }
        assert_eq!(PoisonKind::from_shadow(0x00), None);
        assert!(!is_poison_value(0x07));
    }

    #[test]
    fn test_soft_shadow_clean_by_default() {
        let shadow = SoftShadow::new();
        assert_eq!(shadow.load(mem_to_shadow(0x4000)), 0);

        shadow.store(mem_to_shadow(0x4000), 0xFB);
        assert_eq!(shadow.load(mem_to_shadow(0x4000)), 0xFB);
        assert_eq!(shadow.dirty_count(), 1);

        shadow.store(mem_to_shadow(0x4000), 0);
        assert_eq!(shadow.dirty_count(), 0);
    }

    #[test]
    fn test_null_shadow_has_no_metadata() {
        let shadow = NullShadow::new();
        assert!(!NullShadow::ACTIVE);
        assert!(!shadow.has_metadata(0x1000));
    }

    #[test]
    fn test_default_backends_start_empty() {
        assert_eq!(SoftShadow::default().dirty_count(), 0);
        assert!(!NullShadow::default().has_metadata(0x1000));

        let direct = DirectShadow::default();
        assert!(!direct.has_metadata(0x1000));
        direct.release_regions();
        assert!(!direct.has_metadata(0x1000));
    }
}
