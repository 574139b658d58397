//! Integration tests for the instrumentation entry points before
//! initialization.
//!
//! Nothing in this file initializes the global context: every entry point
//! must return without inspecting shadow memory.

#![cfg(feature = "abi")]

use std::ffi::CString;

use axkasan::KASAN;
use axkasan::abi::*;

#[test]
fn test_sized_entry_points_are_noops() {
    let addrs = [0usize, 0x10, 0x2000, usize::MAX - 3, usize::MAX];
    for addr in addrs {
        __asan_load1(addr);
        __asan_load2(addr);
        __asan_load4(addr);
        __asan_load8(addr);
        __asan_load16(addr);
        __asan_store1(addr);
        __asan_store2(addr);
        __asan_store4(addr);
        __asan_store8(addr);
        __asan_store16(addr);
        __asan_load1_noabort(addr);
        __asan_load16_noabort(addr);
        __asan_store1_noabort(addr);
        __asan_store16_noabort(addr);
    }
    assert!(!KASAN.is_enabled());
    assert!(KASAN.last_report().is_none());
}

#[test]
fn test_variable_entry_points_are_noops() {
    for size in [0usize, 1, 17, 4096, usize::MAX] {
        __asan_loadN(0x10, size);
        __asan_storeN(0x10, size);
        __asan_loadN_noabort(usize::MAX, size);
        __asan_storeN_noabort(usize::MAX, size);
    }
    assert!(KASAN.last_report().is_none());
    assert_eq!(KASAN.stats().total, 0);
}

#[test]
fn test_lifecycle_hooks_are_noops() {
    let name = CString::new("early_module").unwrap();
    unsafe {
        __asan_before_dynamic_init(name.as_ptr());
        __asan_before_dynamic_init(core::ptr::null());
    }
    __asan_after_dynamic_init();
    __asan_handle_no_return();

    assert_eq!(KASAN.dynamic_init().current(), None);
    assert!(KASAN.dynamic_init().completed().is_empty());
}
