//! Sanitizer context: enablement state, initialization and shadow writes.
//!
//! A [`KasanContext`] bundles everything the access checks consult. The
//! kernel uses the global [`crate::KASAN`] instance; tests build their own
//! context over a software shadow instead of touching process state.
//!
//! The enablement flag is written once by [`KasanContext::init`] with
//! `Release` ordering after the shadow region is mapped, and read with
//! `Acquire` ordering by every check, so no check observes the flag set
//! before the shadow memory it describes exists.

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use axerrno::AxError;

use crate::config::{self, FaultMode, KasanConfig};
use crate::dyninit::DynamicInitTracker;
use crate::report::ReportState;
use crate::shadow::{GRANULE_MASK, GRANULE_SIZE, PoisonKind, ShadowMemory, mem_to_shadow};
use crate::stack::StackRegistry;

/// Error types for sanitizer initialization.
#[derive(Debug)]
pub enum Error {
    /// Configuration inconsistent with the shadow layout.
    InvalidConfig(config::Error),
    /// The memory manager could not back a shadow range.
    ShadowMapFailed {
        start: usize,
        size: usize,
        err: AxError,
    },
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidConfig(e) => write!(f, "Invalid KASAN configuration: {}", e),
            Self::ShadowMapFailed { start, size, err } => write!(
                f,
                "Failed to map shadow for {:#x}+{:#x}: {:?}",
                start, size, err
            ),
        }
    }
}

impl core::error::Error for Error {}

impl From<config::Error> for Error {
    fn from(e: config::Error) -> Self {
        Self::InvalidConfig(e)
    }
}

const STATE_UNINIT: u8 = 0;
const STATE_INITIALIZING: u8 = 1;
const STATE_READY: u8 = 2;

/// Process-wide sanitizer state over a shadow backend `S`.
pub struct KasanContext<S: ShadowMemory> {
    state: AtomicU8,
    enabled: AtomicBool,
    fault_panic: AtomicBool,
    multi_shot: AtomicBool,
    shadow: S,
    pub(crate) reports: ReportState,
    pub(crate) stacks: StackRegistry,
    pub(crate) dyn_init: DynamicInitTracker,
}

impl<S: ShadowMemory> KasanContext<S> {
    pub const fn new(shadow: S) -> Self {
        Self {
            state: AtomicU8::new(STATE_UNINIT),
            enabled: AtomicBool::new(false),
            fault_panic: AtomicBool::new(false),
            multi_shot: AtomicBool::new(false),
            shadow,
            reports: ReportState::new(),
            stacks: StackRegistry::new(),
            dyn_init: DynamicInitTracker::new(),
        }
    }

    /// Initialize the sanitizer.
    ///
    /// Validates `config`, maps shadow memory for every configured region,
    /// then enables checking. Only the first successful call has an effect;
    /// later calls return `Ok(())` without logging the initialization again.
    /// A failed call releases the regions mapped so far and leaves the
    /// context uninitialized, so it can be retried.
    pub fn init(&self, config: &KasanConfig) -> Result<(), Error> {
        if !S::ACTIVE {
            return Ok(());
        }

        if self
            .state
            .compare_exchange(
                STATE_UNINIT,
                STATE_INITIALIZING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            log::debug!("KASAN already initialized");
            return Ok(());
        }

        match self.setup(config) {
            Ok(()) => {
                self.state.store(STATE_READY, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                self.shadow.release_regions();
                self.state.store(STATE_UNINIT, Ordering::Release);
                Err(e)
            }
        }
    }

    fn setup(&self, config: &KasanConfig) -> Result<(), Error> {
        config.validate()?;

        if !config.enabled {
            log::info!("KASAN disabled by configuration");
            return Ok(());
        }

        for region in &config.regions {
            self.shadow
                .map_region(region)
                .map_err(|err| Error::ShadowMapFailed {
                    start: region.start,
                    size: region.size,
                    err,
                })?;
        }

        self.fault_panic
            .store(config.fault == FaultMode::Panic, Ordering::Relaxed);
        self.multi_shot.store(config.multi_shot, Ordering::Relaxed);

        log::info!(
            "KASAN initialized: shadow offset {:#x}, {} region(s), fault={:?}{}",
            crate::shadow::SHADOW_OFFSET,
            config.regions.len(),
            config.fault,
            if config.multi_shot { ", multi-shot" } else { "" }
        );

        self.enabled.store(true, Ordering::Release);
        Ok(())
    }

    /// Whether `init` has completed.
    pub fn is_initialized(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_READY
    }

    /// Whether accesses are being checked.
    #[inline(always)]
    pub fn is_enabled(&self) -> bool {
        S::ACTIVE && self.enabled.load(Ordering::Acquire)
    }

    /// Fault handling configured for `noabort` violations.
    pub fn fault_mode(&self) -> FaultMode {
        if self.fault_panic.load(Ordering::Relaxed) {
            FaultMode::Panic
        } else {
            FaultMode::Report
        }
    }

    /// Whether every violation is printed, not only the first.
    pub fn is_multi_shot(&self) -> bool {
        self.multi_shot.load(Ordering::Relaxed)
    }

    /// Change multi-shot reporting at runtime.
    pub fn set_multi_shot(&self, enabled: bool) {
        self.multi_shot.store(enabled, Ordering::Relaxed);
        log::info!(
            "KASAN multi-shot: {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    /// The shadow backend.
    pub fn shadow(&self) -> &S {
        &self.shadow
    }

    /// Mark `[addr, addr + size)` as inaccessible.
    ///
    /// `addr` must be granule aligned; `size` is rounded up to whole
    /// granules. No effect while disabled.
    pub fn poison(&self, addr: usize, size: usize, kind: PoisonKind) {
        if !self.is_enabled() || size == 0 {
            return;
        }
        if addr & GRANULE_MASK != 0 {
            log::warn!("KASAN: poison of misaligned address {:#x} ignored", addr);
            return;
        }

        let granules = size.div_ceil(GRANULE_SIZE);
        let first = mem_to_shadow(addr);
        for i in 0..granules {
            self.shadow.store(first.wrapping_add(i), kind.as_shadow());
        }
    }

    /// Mark `[addr, addr + size)` as accessible.
    ///
    /// `addr` must be granule aligned. A trailing partial granule records
    /// how many of its leading bytes are accessible. No effect while
    /// disabled.
    pub fn unpoison(&self, addr: usize, size: usize) {
        if !self.is_enabled() || size == 0 {
            return;
        }
        if addr & GRANULE_MASK != 0 {
            log::warn!("KASAN: unpoison of misaligned address {:#x} ignored", addr);
            return;
        }

        let first = mem_to_shadow(addr);
        let full = size / GRANULE_SIZE;
        for i in 0..full {
            self.shadow.store(first.wrapping_add(i), 0);
        }
        let tail = size & GRANULE_MASK;
        if tail != 0 {
            self.shadow.store(first.wrapping_add(full), tail as u8);
        }
    }

    /// Mark the start of dynamic initializers for `module`.
    pub fn before_dynamic_init(&self, module: &str) {
        if self.is_enabled() {
            self.dyn_init.begin(module);
        }
    }

    /// Mark the end of the running dynamic initializers.
    pub fn after_dynamic_init(&self) {
        if self.is_enabled() {
            self.dyn_init.end();
        }
    }

    /// Dynamic initializer bookkeeping.
    pub fn dynamic_init(&self) -> &DynamicInitTracker {
        &self.dyn_init
    }
}
