//! Entry points called by compiler instrumentation.
//!
//! Symbol names and signatures follow the address sanitizer calling
//! convention emitted by the compiler and must not change. Every entry
//! point forwards to the global [`crate::KASAN`] context together with the
//! return address of the instrumented code.
//!
//! This crate itself must be built without sanitizer instrumentation.

#![allow(non_snake_case)]

use core::ffi::{CStr, c_char};

use crate::KASAN;
use crate::arch::return_address;
use crate::check::{AccessKind, CheckMode};

/// Fixed-width check attributed to the caller of the entry point.
#[inline(always)]
fn check_sized<const N: usize>(kind: AccessKind, addr: usize, mode: CheckMode) {
    KASAN.check_sized::<N>(kind, addr, mode, return_address());
}

macro_rules! define_sized_checks {
    ($(
        $size:literal => $load:ident, $load_noabort:ident, $store:ident, $store_noabort:ident;
    )*) => {
        $(
            #[unsafe(no_mangle)]
            pub extern "C" fn $load(addr: usize) {
                check_sized::<$size>(AccessKind::Load, addr, CheckMode::Abort);
            }

            #[unsafe(no_mangle)]
            pub extern "C" fn $load_noabort(addr: usize) {
                check_sized::<$size>(AccessKind::Load, addr, CheckMode::NoAbort);
            }

            #[unsafe(no_mangle)]
            pub extern "C" fn $store(addr: usize) {
                check_sized::<$size>(AccessKind::Store, addr, CheckMode::Abort);
            }

            #[unsafe(no_mangle)]
            pub extern "C" fn $store_noabort(addr: usize) {
                check_sized::<$size>(AccessKind::Store, addr, CheckMode::NoAbort);
            }
        )*
    };
}

define_sized_checks! {
    1 => __asan_load1, __asan_load1_noabort, __asan_store1, __asan_store1_noabort;
    2 => __asan_load2, __asan_load2_noabort, __asan_store2, __asan_store2_noabort;
    4 => __asan_load4, __asan_load4_noabort, __asan_store4, __asan_store4_noabort;
    8 => __asan_load8, __asan_load8_noabort, __asan_store8, __asan_store8_noabort;
    16 => __asan_load16, __asan_load16_noabort, __asan_store16, __asan_store16_noabort;
}

#[unsafe(no_mangle)]
pub extern "C" fn __asan_loadN(addr: usize, size: usize) {
    KASAN.check_load(addr, size, CheckMode::Abort, return_address());
}

#[unsafe(no_mangle)]
pub extern "C" fn __asan_loadN_noabort(addr: usize, size: usize) {
    KASAN.check_load(addr, size, CheckMode::NoAbort, return_address());
}

#[unsafe(no_mangle)]
pub extern "C" fn __asan_storeN(addr: usize, size: usize) {
    KASAN.check_store(addr, size, CheckMode::Abort, return_address());
}

#[unsafe(no_mangle)]
pub extern "C" fn __asan_storeN_noabort(addr: usize, size: usize) {
    KASAN.check_store(addr, size, CheckMode::NoAbort, return_address());
}

/// Called right before a `noreturn` function takes over the stack.
#[unsafe(no_mangle)]
pub extern "C" fn __asan_handle_no_return() {
    KASAN.handle_no_return();
}

/// # Safety
///
/// `module_name` must be null or point to a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __asan_before_dynamic_init(module_name: *const c_char) {
    if !KASAN.is_enabled() {
        return;
    }
    let name = if module_name.is_null() {
        "<unknown>"
    } else {
        unsafe { CStr::from_ptr(module_name) }
            .to_str()
            .unwrap_or("<invalid>")
    };
    KASAN.before_dynamic_init(name);
}

#[unsafe(no_mangle)]
pub extern "C" fn __asan_after_dynamic_init() {
    KASAN.after_dynamic_init();
}
