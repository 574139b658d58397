//! Platform abstraction layer for kernel operations.
//!
//! Reports carry a timestamp and the reporting CPU, and the per-CPU
//! stack registry is indexed by CPU ID. This module abstracts those
//! queries so the sanitizer can be exercised in user space.

use core::sync::atomic::{AtomicU64, Ordering};

/// Upper bound on CPU IDs tracked by per-CPU tables.
pub const MAX_CPUS: usize = 64;

/// Platform operations trait.
///
/// Abstracts over kernel-specific operations to enable mock testing.
pub trait PlatformOps {
    /// Get current monotonic time in nanoseconds.
    fn time_ns() -> u64;

    /// Get current CPU ID.
    fn cpu_id() -> u32;
}

// =============================================================================
// Real Implementation (kernel environment with axhal)
// =============================================================================

/// Real platform operations using axhal.
#[cfg(all(not(test), feature = "axhal"))]
pub struct RealPlatform;

#[cfg(all(not(test), feature = "axhal"))]
impl PlatformOps for RealPlatform {
    fn time_ns() -> u64 {
        axhal::time::monotonic_time().as_nanos() as u64
    }

    fn cpu_id() -> u32 {
        axhal::percpu::this_cpu_id() as u32
    }
}

// =============================================================================
// Mock Implementation (test environment or no axhal)
// =============================================================================

static MOCK_TIME_NS: AtomicU64 = AtomicU64::new(1_000_000_000);

static MOCK_CPU_ID: AtomicU64 = AtomicU64::new(0);

/// Mock platform operations for hosted builds.
#[cfg(any(test, not(feature = "axhal")))]
pub struct MockPlatform;

#[cfg(any(test, not(feature = "axhal")))]
impl PlatformOps for MockPlatform {
    fn time_ns() -> u64 {
        MOCK_TIME_NS.load(Ordering::Relaxed)
    }

    fn cpu_id() -> u32 {
        MOCK_CPU_ID.load(Ordering::Relaxed) as u32
    }
}

/// Set mock time for testing.
pub fn set_mock_time(ns: u64) {
    MOCK_TIME_NS.store(ns, Ordering::Relaxed);
}

/// Set mock CPU ID for testing.
pub fn set_mock_cpu_id(id: u32) {
    MOCK_CPU_ID.store(id as u64, Ordering::Relaxed);
}

/// The active platform implementation.
#[cfg(all(not(test), feature = "axhal"))]
pub type Platform = RealPlatform;

#[cfg(any(test, not(feature = "axhal")))]
pub type Platform = MockPlatform;

/// Get current time in nanoseconds.
#[inline]
pub fn time_ns() -> u64 {
    Platform::time_ns()
}

/// Get current CPU ID.
#[inline]
pub fn cpu_id() -> u32 {
    Platform::cpu_id()
}

/// Slot of the current CPU in a `MAX_CPUS`-sized per-CPU table.
#[inline]
pub fn cpu_slot() -> usize {
    cpu_id() as usize % MAX_CPUS
}
