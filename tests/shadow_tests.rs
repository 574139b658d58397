//! Integration tests for shadow address translation and encoding.
//!
//! Tests the translation formula, granule coverage and the software
//! shadow backend.

use axkasan::shadow::{
    self, GRANULE_SIZE, PoisonKind, SHADOW_OFFSET, SHADOW_SCALE_SHIFT, ShadowMemory, SoftShadow,
    granule_start, mem_to_shadow, shadow_to_mem,
};
use axkasan::MemRegion;

const SAMPLE_ADDRS: &[usize] = &[
    0,
    1,
    7,
    8,
    0x1000,
    0x2000,
    0x3000,
    0x4000_0000,
    0x4000_1234,
    usize::MAX / 2,
    usize::MAX - 7,
    usize::MAX,
];

// =============================================================================
// Translation Tests
// =============================================================================

#[test]
fn test_scale_is_eight_to_one() {
    assert_eq!(SHADOW_SCALE_SHIFT, 3);
    assert_eq!(GRANULE_SIZE, 8);
}

#[test]
fn test_translation_matches_formula() {
    for &addr in SAMPLE_ADDRS {
        assert_eq!(
            mem_to_shadow(addr),
            (addr >> SHADOW_SCALE_SHIFT).wrapping_add(SHADOW_OFFSET),
            "addr {:#x}",
            addr
        );
    }
}

#[test]
fn test_translation_is_deterministic() {
    for &addr in SAMPLE_ADDRS {
        let first = mem_to_shadow(addr);
        for _ in 0..4 {
            assert_eq!(mem_to_shadow(addr), first);
        }
    }
}

#[test]
fn test_granule_maps_to_one_shadow_byte() {
    for &base in &[0x1000usize, 0x4000_0000, usize::MAX - 7] {
        let base = granule_start(base);
        for offset in 0..GRANULE_SIZE {
            assert_eq!(mem_to_shadow(base + offset), mem_to_shadow(base));
        }
    }
}

#[test]
fn test_adjacent_granules_map_to_adjacent_bytes() {
    assert_eq!(mem_to_shadow(0x1008), mem_to_shadow(0x1000) + 1);
    assert_eq!(mem_to_shadow(0x1040), mem_to_shadow(0x1000) + 8);
}

#[test]
fn test_shadow_to_mem_returns_granule_start() {
    assert_eq!(shadow_to_mem(mem_to_shadow(0x1000)), 0x1000);
    assert_eq!(shadow_to_mem(mem_to_shadow(0x1007)), 0x1000);
    assert_eq!(shadow_to_mem(mem_to_shadow(0x4000_1234)), 0x4000_1230);
}

// =============================================================================
// Encoding Tests
// =============================================================================

#[test]
fn test_poison_kinds_are_negative() {
    let kinds = [
        PoisonKind::PageFree,
        PoisonKind::PageRedzone,
        PoisonKind::SlabRedzone,
        PoisonKind::SlabFree,
        PoisonKind::GlobalRedzone,
        PoisonKind::VmallocInvalid,
        PoisonKind::StackLeft,
        PoisonKind::StackMid,
        PoisonKind::StackRight,
    ];
    for kind in kinds {
        assert!(shadow::is_poison_value(kind.as_shadow()));
        assert_eq!(PoisonKind::from_shadow(kind.as_shadow()), Some(kind));
    }
}

#[test]
fn test_partial_values_are_not_poison() {
    for value in 0u8..=7 {
        assert!(!shadow::is_poison_value(value));
        assert_eq!(PoisonKind::from_shadow(value), None);
    }
}

// =============================================================================
// SoftShadow Tests
// =============================================================================

#[test]
fn test_soft_shadow_store_and_load() {
    let shadow = SoftShadow::new();
    let addr = mem_to_shadow(0x2000);

    assert_eq!(shadow.load(addr), 0);
    shadow.store(addr, PoisonKind::SlabFree.as_shadow());
    assert_eq!(shadow.load(addr), 0xFB);
    assert_eq!(shadow.load(addr + 1), 0);
}

#[test]
fn test_soft_shadow_map_region_clears_range() {
    let shadow = SoftShadow::new();
    shadow.store(mem_to_shadow(0x1000), 0xFC);
    shadow.store(mem_to_shadow(0x9000), 0xFC);

    shadow.map_region(&MemRegion::new(0x1000, 0x1000)).unwrap();

    assert_eq!(shadow.load(mem_to_shadow(0x1000)), 0);
    assert_eq!(shadow.load(mem_to_shadow(0x9000)), 0xFC);
    assert_eq!(shadow.dirty_count(), 1);
}

#[test]
fn test_region_shadow_range() {
    let region = MemRegion::new(0x1000, 0x100);
    let (start, size) = region.shadow_range();
    assert_eq!(start, mem_to_shadow(0x1000));
    assert_eq!(size, 0x100 / GRANULE_SIZE);
}
