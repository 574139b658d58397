//! Violation reporting.
//!
//! Reports are printed through the `log` facade in the familiar KASAN
//! layout:
//!
//! ```text
//! ==================================================================
//! BUG: KASAN: slab-out-of-bounds in vcpu_run+0x48/0x120
//! Read of size 4 at addr 0x40001008 by cpu 0 (ts_ns=1000000000)
//!
//! Memory state around the buggy address:
//!  0x0000000040000f80: 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00
//! >0x0000000040001000: 00 fc fc fc 00 00 00 00 00 00 00 00 00 00 00 00
//!                         ^
//! ==================================================================
//! ```
//!
//! Only the first report is printed unless multi-shot reporting is on;
//! every report is still counted and remembered. The same holds for
//! reports raised on a CPU that is already printing one.

use alloc::string::String;
use core::fmt::Write;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::Mutex;

use crate::check::{AccessInfo, AccessKind};
use crate::context::KasanContext;
use crate::platform::{self, MAX_CPUS};
use crate::shadow::{PoisonKind, ShadowMemory, is_poison_value, mem_to_shadow, shadow_to_mem};

/// Shadow bytes printed per dump row.
const SHADOW_BYTES_PER_ROW: usize = 16;

/// Dump rows printed before and after the buggy row.
const SHADOW_ROWS_AROUND: usize = 2;

/// Classification of a detected violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BugType {
    OutOfBounds,
    SlabOutOfBounds,
    PageOutOfBounds,
    GlobalOutOfBounds,
    StackOutOfBounds,
    VmallocOutOfBounds,
    UseAfterFree,
    NullPtrDeref,
    WildAccess,
    Unknown,
}

impl BugType {
    /// Classify from the shadow byte of the bad address and the byte after it.
    ///
    /// A partially accessible granule says nothing about why the rest is
    /// inaccessible, so the following granule's kind is used instead.
    pub fn classify(value: u8, next: u8) -> Self {
        let value = if value > 0 && !is_poison_value(value) {
            next
        } else {
            value
        };

        match PoisonKind::from_shadow(value) {
            Some(PoisonKind::PageFree | PoisonKind::SlabFree) => Self::UseAfterFree,
            Some(PoisonKind::PageRedzone) => Self::PageOutOfBounds,
            Some(PoisonKind::SlabRedzone) => Self::SlabOutOfBounds,
            Some(PoisonKind::GlobalRedzone) => Self::GlobalOutOfBounds,
            Some(PoisonKind::VmallocInvalid) => Self::VmallocOutOfBounds,
            Some(PoisonKind::StackLeft | PoisonKind::StackMid | PoisonKind::StackRight) => {
                Self::StackOutOfBounds
            }
            None if is_poison_value(value) => Self::Unknown,
            None => Self::OutOfBounds,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OutOfBounds => "out-of-bounds",
            Self::SlabOutOfBounds => "slab-out-of-bounds",
            Self::PageOutOfBounds => "page-out-of-bounds",
            Self::GlobalOutOfBounds => "global-out-of-bounds",
            Self::StackOutOfBounds => "stack-out-of-bounds",
            Self::VmallocOutOfBounds => "vmalloc-out-of-bounds",
            Self::UseAfterFree => "use-after-free",
            Self::NullPtrDeref => "null-ptr-deref",
            Self::WildAccess => "wild-memory-access",
            Self::Unknown => "unknown-crash",
        }
    }
}

impl core::fmt::Display for BugType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected invalid access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    /// The offending access.
    pub access: AccessInfo,
    /// First inaccessible byte of the access.
    pub bad_addr: usize,
    /// Shadow byte describing `bad_addr`.
    pub shadow_value: u8,
    pub bug: BugType,
    /// CPU that performed the access.
    pub cpu: u32,
    pub timestamp_ns: u64,
}

impl Report {
    pub fn new(access: AccessInfo, bad_addr: usize, shadow_value: u8, bug: BugType) -> Self {
        Self {
            access,
            bad_addr,
            shadow_value,
            bug,
            cpu: platform::cpu_id(),
            timestamp_ns: platform::time_ns(),
        }
    }
}

/// Counters over all detected violations.
#[derive(Debug)]
struct ReportStats {
    total: AtomicU64,
    loads: AtomicU64,
    stores: AtomicU64,
    suppressed: AtomicU64,
}

impl ReportStats {
    const fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            loads: AtomicU64::new(0),
            stores: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
        }
    }
}

/// Immutable snapshot of report statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportStatsSnapshot {
    pub total: u64,
    pub loads: u64,
    pub stores: u64,
    /// Reports counted but not printed.
    pub suppressed: u64,
}

/// Reporting state held by each context.
pub(crate) struct ReportState {
    stats: ReportStats,
    last: Mutex<Option<Report>>,
    printed_once: AtomicBool,
    /// Per-CPU guard against reports raised while printing a report.
    in_report: [AtomicBool; MAX_CPUS],
    print_lock: Mutex<()>,
}

impl ReportState {
    pub(crate) const fn new() -> Self {
        Self {
            stats: ReportStats::new(),
            last: Mutex::new(None),
            printed_once: AtomicBool::new(false),
            in_report: [const { AtomicBool::new(false) }; MAX_CPUS],
            print_lock: Mutex::new(()),
        }
    }
}

impl<S: ShadowMemory> KasanContext<S> {
    /// Record and print a violation.
    pub fn report(&self, report: &Report) {
        let state = &self.reports;
        state.stats.total.fetch_add(1, Ordering::Relaxed);
        match report.access.kind {
            AccessKind::Load => state.stats.loads.fetch_add(1, Ordering::Relaxed),
            AccessKind::Store => state.stats.stores.fetch_add(1, Ordering::Relaxed),
        };

        let guard = &state.in_report[platform::cpu_slot()];
        if guard.swap(true, Ordering::Acquire) {
            // Raised while this CPU is printing: record it, print nothing.
            if let Some(mut last) = state.last.try_lock() {
                *last = Some(*report);
            }
            state.stats.suppressed.fetch_add(1, Ordering::Relaxed);
            return;
        }

        *state.last.lock() = Some(*report);

        if self.is_multi_shot() || !state.printed_once.swap(true, Ordering::Relaxed) {
            let _lock = state.print_lock.lock();
            self.print_report(report);
        } else {
            state.stats.suppressed.fetch_add(1, Ordering::Relaxed);
        }

        guard.store(false, Ordering::Release);
    }

    /// The most recent violation, if any.
    pub fn last_report(&self) -> Option<Report> {
        *self.reports.last.lock()
    }

    /// Snapshot of report counters.
    pub fn stats(&self) -> ReportStatsSnapshot {
        let stats = &self.reports.stats;
        ReportStatsSnapshot {
            total: stats.total.load(Ordering::Relaxed),
            loads: stats.loads.load(Ordering::Relaxed),
            stores: stats.stores.load(Ordering::Relaxed),
            suppressed: stats.suppressed.load(Ordering::Relaxed),
        }
    }

    /// Clear counters, the last report and the first-report latch.
    pub fn reset_stats(&self) {
        let state = &self.reports;
        state.stats.total.store(0, Ordering::Relaxed);
        state.stats.loads.store(0, Ordering::Relaxed);
        state.stats.stores.store(0, Ordering::Relaxed);
        state.stats.suppressed.store(0, Ordering::Relaxed);
        state.printed_once.store(false, Ordering::Relaxed);
        *state.last.lock() = None;
    }

    fn print_report(&self, report: &Report) {
        let access = &report.access;
        log::error!("==================================================================");
        log::error!("BUG: KASAN: {} in {}", report.bug, describe_caller(access.ip));
        log::error!(
            "{} of size {} at addr {:#x} by cpu {} (ts_ns={})",
            access.kind.as_str(),
            access.size,
            access.addr,
            report.cpu,
            report.timestamp_ns
        );
        if report.bad_addr != access.addr {
            log::error!("First bad byte at {:#x}", report.bad_addr);
        }
        if matches!(report.bug, BugType::NullPtrDeref | BugType::WildAccess) {
            log::error!("==================================================================");
            return;
        }
        log::error!("");
        log::error!("Memory state around the buggy address:");
        self.dump_shadow(report.bad_addr);
        log::error!("==================================================================");
    }

    /// Print shadow rows around the row holding `addr`'s shadow byte.
    ///
    /// Bytes outside the mapped shadow are shown as `..`.
    fn dump_shadow(&self, addr: usize) {
        let bad_shadow = mem_to_shadow(addr);
        let row = bad_shadow & !(SHADOW_BYTES_PER_ROW - 1);
        let first = row.wrapping_sub(SHADOW_ROWS_AROUND * SHADOW_BYTES_PER_ROW);

        for i in 0..=2 * SHADOW_ROWS_AROUND {
            let row_shadow = first.wrapping_add(i * SHADOW_BYTES_PER_ROW);
            let row_mem = shadow_to_mem(row_shadow);
            let mapped = (0..SHADOW_BYTES_PER_ROW)
                .any(|j| self.shadow().has_metadata(shadow_to_mem(row_shadow.wrapping_add(j))));
            if !mapped {
                continue;
            }

            let mut line = String::new();
            let marker = if row_shadow == row { '>' } else { ' ' };
            let _ = write!(line, "{}{:#018x}:", marker, row_mem);
            for j in 0..SHADOW_BYTES_PER_ROW {
                let byte = row_shadow.wrapping_add(j);
                if self.shadow().has_metadata(shadow_to_mem(byte)) {
                    let _ = write!(line, " {:02x}", self.shadow().load(byte));
                } else {
                    line.push_str(" ..");
                }
            }
            log::error!("{}", line);

            if row_shadow == row {
                let column = 21 + 3 * (bad_shadow - row);
                let mut caret = String::new();
                for _ in 0..column {
                    caret.push(' ');
                }
                caret.push('^');
                log::error!("{}", caret);
            }
        }
    }
}

/// Render the caller as `symbol+offset/size` when a symbol table is loaded.
fn describe_caller(ip: usize) -> String {
    let mut out = String::new();
    if ip == 0 {
        out.push_str("<unknown>");
        return out;
    }

    #[cfg(feature = "symbols")]
    if let Some(sym) = crate::symbols::lookup(ip) {
        let _ = write!(out, "{}", sym);
        return out;
    }

    let _ = write!(out, "{:#x}", ip);
    out
}
