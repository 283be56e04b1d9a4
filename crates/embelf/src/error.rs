//! Loader errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ElfError {
    #[error("invalid ELF image: {0}")]
    InvalidFormat(String),

    #[error("unsupported machine type {found:#06x} (expected {expected:#06x})")]
    UnsupportedArchitecture { found: u16, expected: u16 },

    #[error("unsupported relocation type {0}")]
    UnsupportedRelocation(u32),

    #[error("undefined symbol `{0}`")]
    UndefinedSymbol(String),

    #[error("I/O error reading ELF image")]
    Io(#[from] std::io::Error),

    #[error("unable to allocate {size:#x} bytes for program image")]
    AllocationFailed { size: usize },

    #[error("program needs {needed} protection regions, {available} available")]
    TooManyRegions { needed: usize, available: usize },
}
