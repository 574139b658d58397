//! Architecture helpers used by the instrumentation hooks.

/// Current stack pointer.
#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub fn stack_pointer() -> usize {
    let sp: usize;
    unsafe {
        core::arch::asm!("mov {}, sp", out(reg) sp, options(nomem, nostack, preserves_flags));
    }
    sp
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn stack_pointer() -> usize {
    let sp: usize;
    unsafe {
        core::arch::asm!("mov {}, rsp", out(reg) sp, options(nomem, nostack, preserves_flags));
    }
    sp
}

#[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
#[inline(always)]
pub fn stack_pointer() -> usize {
    let marker = 0u8;
    core::ptr::addr_of!(marker) as usize
}

/// Return address of the function this is inlined into.
///
/// Reads the frame record of the current frame, so the kernel must be
/// built with frame pointers (`-C force-frame-pointers=yes`). Hosted
/// builds give no such guarantee and always return 0.
#[cfg(all(target_os = "none", target_arch = "aarch64"))]
#[inline(always)]
pub fn return_address() -> usize {
    let fp: usize;
    unsafe {
        core::arch::asm!("mov {}, x29", out(reg) fp, options(nomem, nostack, preserves_flags));
    }
    if fp == 0 {
        return 0;
    }
    // Frame record: [fp] = previous fp, [fp + 8] = link register.
    unsafe { core::ptr::read_volatile((fp + 8) as *const usize) }
}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
#[inline(always)]
pub fn return_address() -> usize {
    let fp: usize;
    unsafe {
        core::arch::asm!("mov {}, rbp", out(reg) fp, options(nomem, nostack, preserves_flags));
    }
    if fp == 0 {
        return 0;
    }
    // [rbp] = saved rbp, [rbp + 8] = return address.
    unsafe { core::ptr::read_volatile((fp + 8) as *const usize) }
}

#[cfg(not(all(target_os = "none", any(target_arch = "aarch64", target_arch = "x86_64"))))]
#[inline(always)]
pub fn return_address() -> usize {
    0
}
