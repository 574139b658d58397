//! Sanitizer configuration.
//!
//! Covers which kernel memory regions get shadow memory and how detected
//! violations are handled. A configuration can be built in code or parsed
//! from the boot command line:
//!
//! ```ignore
//! let config = KasanConfig::from_cmdline("console=ttyS0 kasan.fault=panic kasan_multi_shot")?
//!     .with_region(MemRegion::new(0x4000_0000, 0x4000_0000));
//! axkasan::init_with_config(&config);
//! ```

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::shadow::mem_to_shadow;

/// Maximum number of kernel regions that can have shadow memory.
pub const MAX_REGIONS: usize = 8;

/// Error types for configuration parsing and validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Region of zero length.
    EmptyRegion(usize),
    /// Region end does not fit in the address space.
    RegionOverflow { start: usize, size: usize },
    /// More regions than `MAX_REGIONS`.
    TooManyRegions(usize),
    /// The shadow of a region overlaps a covered kernel region.
    ShadowOverlap { region: usize, shadow: usize },
    /// Unrecognized `kasan` command line option.
    UnknownOption(String),
    /// Recognized option with an invalid value.
    InvalidValue(String),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::EmptyRegion(start) => write!(f, "Empty region at {:#x}", start),
            Self::RegionOverflow { start, size } => {
                write!(f, "Region {:#x}+{:#x} overflows the address space", start, size)
            }
            Self::TooManyRegions(n) => {
                write!(f, "Too many regions: {} (max {})", n, MAX_REGIONS)
            }
            Self::ShadowOverlap { region, shadow } => write!(
                f,
                "Shadow at {:#x} overlaps covered region at {:#x}",
                shadow, region
            ),
            Self::UnknownOption(opt) => write!(f, "Unknown option: {}", opt),
            Self::InvalidValue(opt) => write!(f, "Invalid value: {}", opt),
        }
    }
}

impl core::error::Error for Error {}

/// How non-aborting violations are handled after being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultMode {
    /// Report and continue.
    #[default]
    Report,
    /// Report and panic, even for `noabort` checks.
    Panic,
}

/// A range of kernel virtual memory covered by shadow memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRegion {
    pub start: usize,
    pub size: usize,
}

impl MemRegion {
    pub const fn new(start: usize, size: usize) -> Self {
        Self { start, size }
    }

    /// One past the last byte. Only meaningful for validated regions.
    pub const fn end(&self) -> usize {
        self.start.wrapping_add(self.size)
    }

    /// Last byte of the region.
    pub const fn last(&self) -> usize {
        self.start.wrapping_add(self.size).wrapping_sub(1)
    }

    /// Whether `addr` lies inside the region.
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr - self.start < self.size
    }

    /// Shadow bytes describing this region, as `(start, size)`.
    pub const fn shadow_range(&self) -> (usize, usize) {
        let first = mem_to_shadow(self.start);
        let last = mem_to_shadow(self.last());
        (first, last - first + 1)
    }

    fn overlaps(&self, start: usize, size: usize) -> bool {
        start < self.end() && self.start < start.wrapping_add(size)
    }
}

/// Runtime sanitizer configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KasanConfig {
    /// `kasan=off` leaves the sanitizer disabled.
    pub enabled: bool,
    /// Handling of `noabort` violations.
    pub fault: FaultMode,
    /// Print every report instead of only the first one.
    pub multi_shot: bool,
    /// Kernel memory that gets shadow memory.
    pub regions: Vec<MemRegion>,
}

impl Default for KasanConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl KasanConfig {
    pub const fn new() -> Self {
        Self {
            enabled: true,
            fault: FaultMode::Report,
            multi_shot: false,
            regions: Vec::new(),
        }
    }

    pub fn with_region(mut self, region: MemRegion) -> Self {
        self.regions.push(region);
        self
    }

    pub fn with_fault(mut self, fault: FaultMode) -> Self {
        self.fault = fault;
        self
    }

    pub fn with_multi_shot(mut self, multi_shot: bool) -> Self {
        self.multi_shot = multi_shot;
        self
    }

    /// Parse the `kasan` options of a kernel command line.
    ///
    /// Words not starting with `kasan` are ignored.
    pub fn from_cmdline(cmdline: &str) -> Result<Self, Error> {
        let mut config = Self::new();

        for word in cmdline.split_whitespace() {
            if !word.starts_with("kasan") {
                continue;
            }
            let (key, value) = match word.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (word, None),
            };
            match (key, value) {
                ("kasan", Some("on")) => config.enabled = true,
                ("kasan", Some("off")) => config.enabled = false,
                ("kasan.fault", Some("report")) => config.fault = FaultMode::Report,
                ("kasan.fault", Some("panic")) => config.fault = FaultMode::Panic,
                ("kasan_multi_shot", None) => config.multi_shot = true,
                ("kasan" | "kasan.fault", _) => return Err(Error::InvalidValue(word.to_string())),
                _ => return Err(Error::UnknownOption(word.to_string())),
            }
        }

        Ok(config)
    }

    /// Check that the shadow layout is consistent with the covered regions.
    pub fn validate(&self) -> Result<(), Error> {
        if self.regions.len() > MAX_REGIONS {
            return Err(Error::TooManyRegions(self.regions.len()));
        }

        for region in &self.regions {
            if region.size == 0 {
                return Err(Error::EmptyRegion(region.start));
            }
            if region.start.checked_add(region.size).is_none() {
                return Err(Error::RegionOverflow {
                    start: region.start,
                    size: region.size,
                });
            }
        }

        for region in &self.regions {
            let (shadow, shadow_size) = region.shadow_range();
            if let Some(hit) = self.regions.iter().find(|r| r.overlaps(shadow, shadow_size)) {
                return Err(Error::ShadowOverlap {
                    region: hit.start,
                    shadow,
                });
            }
        }

        Ok(())
    }
}
