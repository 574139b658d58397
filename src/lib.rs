//! AxVisor Kernel Address Sanitizer
//!
//! Runtime half of KASAN: shadow memory addressing, the access checks
//! called by compiler instrumentation, violation reports and the lifecycle
//! hooks of the instrumentation calling convention.
//!
//! # Features
//!
//! - `kasan` - Real sanitizer (default). Without it every hook is a no-op
//!   and initialization does nothing.
//! - `abi` - Export the `__asan_*` entry points (default)
//! - `symbols` - Symbolize caller addresses in reports (default)
//! - `axhal` - Use the real shadow region and axhal platform services
//!   (default). Without it a software shadow is used, for hosted testing.
//!
//! # Quick Start
//!
//! ```ignore
//! use axkasan::{KasanConfig, MemRegion};
//!
//! // Once, on the boot CPU, before secondary CPUs come up.
//! let config = KasanConfig::from_cmdline(cmdline)
//!     .unwrap_or_default()
//!     .with_region(MemRegion::new(kernel_start, kernel_size));
//! axkasan::init_with_config(&config);
//!
//! // On every stack switch
//! axkasan::KASAN.register_stack(cpu_id, stack_base, stack_size);
//! ```

#![no_std]

extern crate alloc;

#[macro_use]
extern crate log;

// =============================================================================
// Platform Abstraction (for testing support)
// =============================================================================

pub mod arch;
pub mod platform;

// =============================================================================
// Shadow Memory
// =============================================================================

pub mod shadow;
pub mod shadow_map;

// =============================================================================
// Sanitizer Core
// =============================================================================

pub mod check;
pub mod config;
pub mod context;
pub mod dyninit;
pub mod report;
pub mod stack;

#[cfg(feature = "symbols")]
pub mod symbols;

#[cfg(feature = "abi")]
pub mod abi;

pub use check::{AccessInfo, AccessKind, CheckMode};
pub use config::{FaultMode, KasanConfig, MemRegion};
pub use context::{Error, KasanContext};
pub use report::{BugType, Report, ReportStatsSnapshot};
pub use shadow::{
    ActiveShadow, DirectShadow, NullShadow, PoisonKind, SHADOW_OFFSET, SHADOW_SCALE_SHIFT,
    ShadowMemory, SoftShadow, mem_to_shadow,
};

/// The global sanitizer context used by the instrumentation entry points.
pub static KASAN: KasanContext<ActiveShadow> = KasanContext::new(ActiveShadow::new());

// =============================================================================
// Initialization
// =============================================================================

/// Initialize the sanitizer with the default configuration.
///
/// No region gets shadow memory, so nothing is checked until the kernel
/// provides regions through [`init_with_config`]. Mostly useful to flip the
/// sanitizer on in hosted builds.
pub fn init() {
    init_with_config(&KasanConfig::default());
}

/// Initialize the sanitizer.
///
/// Must run on the boot CPU before any other CPU executes instrumented
/// code, after the page allocator is ready.
///
/// # Panics
/// Panics if the configuration is inconsistent with the shadow layout or
/// the shadow region cannot be mapped: running instrumented code on a
/// broken shadow mapping is not an option.
pub fn init_with_config(config: &KasanConfig) {
    if let Err(e) = try_init(config) {
        error!("KASAN initialization failed: {}", e);
        panic!("KASAN: {}", e);
    }
}

/// Initialize the sanitizer, returning configuration violations to the caller.
pub fn try_init(config: &KasanConfig) -> Result<(), Error> {
    KASAN.init(config)
}

/// Initialize the sanitizer and load the kernel symbol table for reports.
///
/// # Arguments
/// * `config` - Sanitizer configuration
/// * `kallsyms_data` - The kallsyms.bin binary blob (static lifetime required)
/// * `stext` - Start address of kernel text section (_stext)
/// * `etext` - End address of kernel text section (_etext)
#[cfg(feature = "symbols")]
pub fn init_with_symbols(
    config: &KasanConfig,
    kallsyms_data: &'static [u8],
    stext: u64,
    etext: u64,
) {
    match symbols::init(kallsyms_data, stext, etext) {
        Ok(()) => debug!("KASAN: symbol table loaded ({} bytes)", kallsyms_data.len()),
        Err(e) => warn!("KASAN: reports will not be symbolized: {}", e),
    }
    init_with_config(config);
}

/// Whether the global sanitizer is checking accesses.
#[inline]
pub fn is_enabled() -> bool {
    KASAN.is_enabled()
}
