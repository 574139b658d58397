//! Access checks.
//!
//! Every instrumented load and store ends up in
//! [`KasanContext::check_access`], parameterized by access width and
//! direction. The fixed-width `__asan_*` entry points are thin wrappers
//! supplying a constant width.
//!
//! Per access:
//!
//! ```text
//! disabled ─────────────────────────────────────────────▶ return
//! enabled ─▶ translate ─▶ inspect shadow ─┬─ clean ─────▶ return
//!                                         └─ poisoned ─▶ report ─┬─ abort ───▶ panic
//!                                                                └─ noabort ─▶ return
//! ```

use crate::config::FaultMode;
use crate::context::KasanContext;
use crate::report::{BugType, Report};
use crate::shadow::{
    GRANULE_MASK, GRANULE_SIZE, ShadowMemory, granule_start, is_poison_value, mem_to_shadow,
};

/// Addresses below this are reported as NULL dereferences.
const NULL_PAGE_SIZE: usize = 0x1000;

/// Direction of a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Load,
    Store,
}

impl AccessKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Load => "Read",
            Self::Store => "Write",
        }
    }
}

/// What happens after a violation has been reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMode {
    /// Execution must not continue past the faulting access.
    Abort,
    /// Control returns to the instrumented code.
    NoAbort,
}

/// Descriptor of one instrumented access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessInfo {
    /// First accessed byte.
    pub addr: usize,
    /// Access size in bytes.
    pub size: usize,
    /// Load or store.
    pub kind: AccessKind,
    /// Return address of the instrumented caller, 0 if unknown.
    pub ip: usize,
}

impl AccessInfo {
    pub const fn new(addr: usize, size: usize, kind: AccessKind, ip: usize) -> Self {
        Self {
            addr,
            size,
            kind,
            ip,
        }
    }
}

/// Find the first inaccessible byte in `[start, last]`, in address order.
///
/// Granules without shadow metadata are treated as accessible.
pub fn first_poisoned_byte<S: ShadowMemory>(
    shadow: &S,
    start: usize,
    last: usize,
) -> Option<usize> {
    let mut granule = start & !GRANULE_MASK;
    loop {
        let granule_last = granule | GRANULE_MASK;
        if shadow.has_metadata(granule) {
            let value = shadow.load(mem_to_shadow(granule));
            if value != 0 {
                let lo = start.max(granule);
                if is_poison_value(value) {
                    return Some(lo);
                }
                // Only the first `value` bytes of the granule are accessible.
                let hi = last.min(granule_last);
                let accessible_end = granule + value as usize;
                if (value as usize) < GRANULE_SIZE && hi >= accessible_end {
                    return Some(lo.max(accessible_end));
                }
            }
        }
        if granule_last >= last {
            return None;
        }
        granule += GRANULE_SIZE;
    }
}

impl<S: ShadowMemory> KasanContext<S> {
    /// Check one access and handle a violation according to `mode`.
    #[inline]
    pub fn check_access(&self, access: AccessInfo, mode: CheckMode) {
        if !self.is_enabled() {
            return;
        }
        if let Some(report) = self.inspect(&access) {
            self.handle_violation(&report, mode);
        }
    }

    /// Fixed-width check.
    #[inline(always)]
    pub fn check_sized<const N: usize>(
        &self,
        kind: AccessKind,
        addr: usize,
        mode: CheckMode,
        ip: usize,
    ) {
        self.check_access(AccessInfo::new(addr, N, kind, ip), mode);
    }

    /// Check a load of `size` bytes at `addr`.
    #[inline]
    pub fn check_load(&self, addr: usize, size: usize, mode: CheckMode, ip: usize) {
        self.check_access(AccessInfo::new(addr, size, AccessKind::Load, ip), mode);
    }

    /// Check a store of `size` bytes at `addr`.
    #[inline]
    pub fn check_store(&self, addr: usize, size: usize, mode: CheckMode, ip: usize) {
        self.check_access(AccessInfo::new(addr, size, AccessKind::Store, ip), mode);
    }

    /// Look for a violation without reporting it.
    ///
    /// Returns `None` for clean accesses, zero-sized accesses and while
    /// the sanitizer is disabled.
    pub fn inspect(&self, access: &AccessInfo) -> Option<Report> {
        if !self.is_enabled() || access.size == 0 {
            return None;
        }

        let Some(last) = access.addr.checked_add(access.size - 1) else {
            return Some(Report::new(*access, access.addr, 0, BugType::WildAccess));
        };

        if !self.shadow().has_metadata(access.addr) && access.addr < NULL_PAGE_SIZE {
            return Some(Report::new(*access, access.addr, 0, BugType::NullPtrDeref));
        }

        let bad_addr = first_poisoned_byte(self.shadow(), access.addr, last)?;
        let value = self.shadow().load(mem_to_shadow(bad_addr));
        // The next granule may lie past the end of the mapped shadow.
        let next_granule = granule_start(bad_addr).wrapping_add(GRANULE_SIZE);
        let next = if self.shadow().has_metadata(next_granule) {
            self.shadow().load(mem_to_shadow(next_granule))
        } else {
            0
        };
        Some(Report::new(*access, bad_addr, value, BugType::classify(value, next)))
    }

    #[cold]
    #[inline(never)]
    fn handle_violation(&self, report: &Report, mode: CheckMode) {
        self.report(report);
        if mode == CheckMode::Abort || self.fault_mode() == FaultMode::Panic {
            fatal(report);
        }
    }
}

#[cold]
#[inline(never)]
fn fatal(report: &Report) -> ! {
    panic!(
        "KASAN: {}: {} of size {} at addr {:#x}",
        report.bug,
        report.access.kind.as_str(),
        report.access.size,
        report.access.addr
    );
}
