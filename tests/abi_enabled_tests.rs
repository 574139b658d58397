//! Integration tests for the instrumentation entry points on the global
//! context, backed by the software shadow.
//!
//! Entry points are `extern "C"`, so a panic inside one aborts the test
//! process. Aborting checks are exercised through the context instead.

#![cfg(all(feature = "abi", feature = "kasan", not(feature = "axhal")))]

use std::ffi::CString;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Mutex, MutexGuard};

use axkasan::abi::*;
use axkasan::{AccessKind, BugType, CheckMode, KASAN, PoisonKind, ShadowMemory, mem_to_shadow};

static SERIAL: Mutex<()> = Mutex::new(());

/// Initialize the global context and serialize tests sharing it.
fn setup() -> MutexGuard<'static, ()> {
    let guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    axkasan::init();
    KASAN.set_multi_shot(true);
    KASAN.reset_stats();
    guard
}

#[test]
fn test_global_init() {
    let _guard = setup();
    assert!(axkasan::is_enabled());
    assert!(KASAN.is_initialized());
}

#[test]
fn test_clean_entry_points_pass() {
    let _guard = setup();
    __asan_load1(0x1_0000);
    __asan_load8(0x1_0008);
    __asan_store16(0x1_0010);
    __asan_loadN(0x1_0000, 64);
    __asan_storeN(0x1_0000, 64);
    assert!(KASAN.last_report().is_none());
}

#[test]
fn test_noabort_entry_point_reports() {
    let _guard = setup();
    KASAN.poison(0x2_0000, 16, PoisonKind::SlabRedzone);

    __asan_load4_noabort(0x2_0004);

    let report = KASAN.last_report().unwrap();
    assert_eq!(report.access.addr, 0x2_0004);
    assert_eq!(report.access.size, 4);
    assert_eq!(report.access.kind, AccessKind::Load);
    assert_eq!(report.bug, BugType::SlabOutOfBounds);
}

#[test]
fn test_store_n_noabort_reports_first_bad_byte() {
    let _guard = setup();
    KASAN.poison(0x3_0020, 8, PoisonKind::GlobalRedzone);

    __asan_storeN_noabort(0x3_0000, 40);

    let report = KASAN.last_report().unwrap();
    assert_eq!(report.access.kind, AccessKind::Store);
    assert_eq!(report.bad_addr, 0x3_0020);
}

#[test]
fn test_abort_check_panics_after_report() {
    let _guard = setup();
    KASAN.poison(0x4_0000, 8, PoisonKind::PageFree);

    let result = catch_unwind(AssertUnwindSafe(|| {
        KASAN.check_sized::<2>(AccessKind::Store, 0x4_0000, CheckMode::Abort, 0);
    }));

    assert!(result.is_err());
    assert_eq!(KASAN.last_report().unwrap().bug, BugType::UseAfterFree);
}

#[test]
fn test_handle_no_return_cleans_current_stack() {
    let _guard = setup();
    let marker = 0u8;
    let here = core::ptr::addr_of!(marker) as usize;
    let base = (here & !0xfff) - 0x4000;
    KASAN.register_stack(0, base, 0x8000);
    KASAN.poison(base, 64, PoisonKind::StackLeft);

    __asan_handle_no_return();

    assert_eq!(KASAN.shadow().load(mem_to_shadow(base)), 0);
    KASAN.unregister_stack(0);
}

#[test]
fn test_dynamic_init_entry_points() {
    let _guard = setup();
    let name = CString::new("drivers").unwrap();

    unsafe { __asan_before_dynamic_init(name.as_ptr()) };
    assert_eq!(KASAN.dynamic_init().current().as_deref(), Some("drivers"));
    __asan_after_dynamic_init();

    assert!(KASAN.dynamic_init().is_initialized("drivers"));
}
