//! Integration tests for stack registration and `noreturn` cleanup.
//!
//! All tests run as CPU 0 of the mock platform.

use axkasan::{
    BugType, CheckMode, KasanConfig, KasanContext, PoisonKind, ShadowMemory, SoftShadow,
    mem_to_shadow,
};

const STACK_BASE: usize = 0x10_0000;
const STACK_SIZE: usize = 0x4000;

fn context_with_stack() -> KasanContext<SoftShadow> {
    let ctx = KasanContext::new(SoftShadow::new());
    ctx.init(&KasanConfig::new().with_multi_shot(true)).unwrap();
    ctx.register_stack(0, STACK_BASE, STACK_SIZE);
    ctx
}

// =============================================================================
// Registry Tests
// =============================================================================

#[test]
fn test_register_and_unregister_stack() {
    let ctx = KasanContext::new(SoftShadow::new());
    assert_eq!(ctx.stack_bounds(5), None);

    ctx.register_stack(5, 0x2000, 0x1000);
    assert_eq!(ctx.stack_bounds(5), Some((0x2000, 0x3000)));

    ctx.unregister_stack(5);
    assert_eq!(ctx.stack_bounds(5), None);
}

#[test]
fn test_register_overflowing_stack_is_ignored() {
    let ctx = KasanContext::new(SoftShadow::new());
    ctx.register_stack(1, usize::MAX - 0xff, 0x1000);
    assert_eq!(ctx.stack_bounds(1), None);
}

// =============================================================================
// No-Return Cleanup Tests
// =============================================================================

#[test]
fn test_no_return_unpoisons_abandoned_frames() {
    let ctx = context_with_stack();
    let sp = STACK_BASE + 0x1000;
    ctx.poison(STACK_BASE + 0x100, 32, PoisonKind::StackLeft);
    ctx.poison(sp + 0x100, 32, PoisonKind::StackMid);

    ctx.handle_no_return_at(sp);

    // Below the stack pointer: cleaned.
    ctx.check_load(STACK_BASE + 0x100, 8, CheckMode::NoAbort, 0);
    assert!(ctx.last_report().is_none());

    // Above the stack pointer: live frames keep their redzones.
    ctx.check_load(sp + 0x100, 8, CheckMode::NoAbort, 0);
    assert_eq!(ctx.last_report().unwrap().bug, BugType::StackOutOfBounds);
}

#[test]
fn test_no_return_keeps_granule_holding_sp() {
    let ctx = context_with_stack();
    let sp = STACK_BASE + 0x804;
    ctx.poison(STACK_BASE + 0x800, 8, PoisonKind::StackRight);

    ctx.handle_no_return_at(sp);

    ctx.check_load(STACK_BASE + 0x800, 1, CheckMode::NoAbort, 0);
    assert!(ctx.last_report().is_some());
}

#[test]
fn test_no_return_keeps_granule_below_unaligned_base() {
    let ctx = KasanContext::new(SoftShadow::new());
    ctx.init(&KasanConfig::new()).unwrap();
    let base = STACK_BASE + 4;
    ctx.register_stack(0, base, STACK_SIZE);
    ctx.poison(STACK_BASE, 16, PoisonKind::StackLeft);

    ctx.handle_no_return_at(base + 0x100);

    // The first granule also holds 4 bytes below the stack.
    assert_eq!(ctx.shadow().load(mem_to_shadow(STACK_BASE)), 0xF1);
    assert_eq!(ctx.shadow().load(mem_to_shadow(STACK_BASE + 8)), 0);
}

#[test]
fn test_no_return_outside_stack_is_ignored() {
    let ctx = context_with_stack();
    ctx.poison(STACK_BASE, 64, PoisonKind::StackLeft);
    let dirty = ctx.shadow().dirty_count();

    ctx.handle_no_return_at(STACK_BASE + STACK_SIZE);
    ctx.handle_no_return_at(STACK_BASE - 8);

    assert_eq!(ctx.shadow().dirty_count(), dirty);
}

#[test]
fn test_no_return_without_registered_stack() {
    let ctx = KasanContext::new(SoftShadow::new());
    ctx.init(&KasanConfig::new()).unwrap();
    ctx.poison(STACK_BASE, 64, PoisonKind::StackLeft);

    ctx.handle_no_return_at(STACK_BASE + 0x100);

    assert_eq!(ctx.shadow().dirty_count(), 8);
}

#[test]
fn test_no_return_before_init_is_noop() {
    let ctx = KasanContext::new(SoftShadow::new());
    ctx.register_stack(0, STACK_BASE, STACK_SIZE);
    ctx.handle_no_return();
    ctx.handle_no_return_at(STACK_BASE + 0x100);
    assert_eq!(ctx.shadow().dirty_count(), 0);
}
