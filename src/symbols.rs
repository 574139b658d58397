//! Kernel symbol lookup for report symbolization.
//!
//! Turns the caller return address of a faulting access into
//! `symbol+offset/size`. Backed by a kallsyms blob loaded once at boot.

use alloc::string::String;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU8, Ordering};
use ksym::KallsymsMapped;

const STATE_EMPTY: u8 = 0;
const STATE_LOADING: u8 = 1;
const STATE_READY: u8 = 2;

static STATE: AtomicU8 = AtomicU8::new(STATE_EMPTY);

struct GlobalSymbolTable(UnsafeCell<Option<KallsymsMapped<'static>>>);
unsafe impl Sync for GlobalSymbolTable {}
static SYMBOL_TABLE: GlobalSymbolTable = GlobalSymbolTable(UnsafeCell::new(None));

const KSYM_NAME_LEN: usize = 512;

/// Error types for symbol operations.
#[derive(Debug)]
pub enum Error {
    /// Symbol table has already been loaded.
    AlreadyInitialized,
    /// Failed to parse the kallsyms blob.
    ParseError(&'static str),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::AlreadyInitialized => write!(f, "Symbol table already initialized"),
            Self::ParseError(e) => write!(f, "Failed to parse symbol table: {}", e),
        }
    }
}

impl core::error::Error for Error {}

/// A resolved code address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    /// Offset of the address from the symbol start.
    pub offset: u64,
    /// Symbol size.
    pub size: u64,
}

impl core::fmt::Display for Symbol {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}+{:#x}/{:#x}", self.name, self.offset, self.size)
    }
}

/// Load the kernel symbol table.
///
/// Lookups see the table only once it is fully stored.
pub fn init(data: &'static [u8], stext: u64, etext: u64) -> Result<(), Error> {
    if STATE
        .compare_exchange(STATE_EMPTY, STATE_LOADING, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return Err(Error::AlreadyInitialized);
    }

    let table = match KallsymsMapped::from_blob(data, stext, etext) {
        Ok(table) => table,
        Err(e) => {
            STATE.store(STATE_EMPTY, Ordering::Release);
            return Err(Error::ParseError(e));
        }
    };

    // Only the CPU that won the `LOADING` transition writes the cell, and
    // lookups do not read it before `READY`.
    unsafe {
        *SYMBOL_TABLE.0.get() = Some(table);
    }
    STATE.store(STATE_READY, Ordering::Release);

    Ok(())
}

/// Check if the symbol table has been loaded.
pub fn is_initialized() -> bool {
    STATE.load(Ordering::Acquire) == STATE_READY
}

/// Resolve `addr` to the symbol containing it.
pub fn lookup(addr: usize) -> Option<Symbol> {
    if !is_initialized() {
        return None;
    }
    let table = unsafe { (*SYMBOL_TABLE.0.get()).as_ref() }?;

    let mut name_buf = [0u8; KSYM_NAME_LEN];
    let (name, size, offset, _ty) = table.lookup_address(addr as u64, &mut name_buf)?;
    Some(Symbol {
        name: String::from(name),
        offset,
        size,
    })
}
