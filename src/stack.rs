//! Stack cleanup before non-returning control transfers.
//!
//! When a function marked as never returning is about to run (panic,
//! context switch to a fresh task, longjmp-like exits), the frames below the
//! current stack pointer are abandoned without their epilogues unpoisoning
//! their redzones. Those stale redzones would be hit by whatever reuses the
//! stack next, so [`KasanContext::handle_no_return`] unpoisons everything
//! between the stack base and the current stack pointer.
//!
//! The sanitizer does not know where stacks live; the kernel registers
//! each CPU's current stack with [`KasanContext::register_stack`].

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::context::KasanContext;
use crate::platform::{self, MAX_CPUS};
use crate::shadow::{GRANULE_MASK, ShadowMemory};

struct StackBounds {
    base: AtomicUsize,
    top: AtomicUsize,
}

impl StackBounds {
    const fn new() -> Self {
        Self {
            base: AtomicUsize::new(0),
            top: AtomicUsize::new(0),
        }
    }
}

/// Per-CPU kernel stack bounds.
pub(crate) struct StackRegistry {
    cpus: [StackBounds; MAX_CPUS],
}

impl StackRegistry {
    pub(crate) const fn new() -> Self {
        Self {
            cpus: [const { StackBounds::new() }; MAX_CPUS],
        }
    }

    fn set(&self, slot: usize, base: usize, top: usize) {
        let bounds = &self.cpus[slot];
        // An empty range disables lookups while the new bounds are written.
        bounds.top.store(0, Ordering::Release);
        bounds.base.store(base, Ordering::Relaxed);
        bounds.top.store(top, Ordering::Release);
    }

    fn get(&self, slot: usize) -> Option<(usize, usize)> {
        let bounds = &self.cpus[slot];
        let top = bounds.top.load(Ordering::Acquire);
        let base = bounds.base.load(Ordering::Relaxed);
        (top > base).then_some((base, top))
    }
}

impl<S: ShadowMemory> KasanContext<S> {
    /// Record the stack `[base, base + size)` currently used by `cpu`.
    ///
    /// Call again on every stack switch.
    pub fn register_stack(&self, cpu: u32, base: usize, size: usize) {
        let Some(top) = base.checked_add(size) else {
            log::warn!("KASAN: stack {:#x}+{:#x} overflows, ignored", base, size);
            return;
        };
        self.stacks.set(cpu as usize % MAX_CPUS, base, top);
        log::trace!("KASAN: cpu {} stack {:#x}..{:#x}", cpu, base, top);
    }

    /// Forget the stack of `cpu`.
    pub fn unregister_stack(&self, cpu: u32) {
        self.stacks.set(cpu as usize % MAX_CPUS, 0, 0);
    }

    /// Stack bounds registered for `cpu`, as `(base, top)`.
    pub fn stack_bounds(&self, cpu: u32) -> Option<(usize, usize)> {
        self.stacks.get(cpu as usize % MAX_CPUS)
    }

    /// Unpoison the abandoned part of the current CPU's stack.
    #[inline(never)]
    pub fn handle_no_return(&self) {
        if !self.is_enabled() {
            return;
        }
        self.handle_no_return_at(crate::arch::stack_pointer());
    }

    /// Unpoison `[stack_base, sp)` of the current CPU's stack.
    ///
    /// Does nothing if `sp` is not inside the registered stack (interrupt
    /// stacks, early boot before registration).
    pub fn handle_no_return_at(&self, sp: usize) {
        if !self.is_enabled() {
            return;
        }

        let Some((base, top)) = self.stacks.get(platform::cpu_slot()) else {
            return;
        };
        if sp < base || sp >= top {
            log::trace!(
                "KASAN: sp {:#x} outside stack {:#x}..{:#x}, no cleanup",
                sp,
                base,
                top
            );
            return;
        }

        // Whole granules only: the one holding `sp` belongs to the live
        // frame, the one straddling `base` to whatever lies below the stack.
        let Some(start) = base.checked_add(GRANULE_MASK).map(|b| b & !GRANULE_MASK) else {
            return;
        };
        let end = sp & !GRANULE_MASK;
        if end > start {
            self.unpoison(start, end - start);
        }
    }
}
