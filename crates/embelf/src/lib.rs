//! embelf: a dynamic ELF loader for small embedded hosts.
//!
//! This crate provides:
//! - A streaming ELF reader over any `Read + Seek` byte source
//! - A loader that places `PT_LOAD` segments into embedder-provided memory
//! - A RISC-V relocation engine patching the loaded image in place
//! - A PMP-style memory-protection policy (one region per loaded segment)
//!
//! The embedder supplies the memory allocator, the global symbol resolver
//! and the protection-unit backend; the crate never executes the loaded
//! program. Diagnostics go through the `log` facade.
//!
//! # Usage
//!
//! ```ignore
//! use embelf::{ElfFile, ElfOptions};
//!
//! let src = std::fs::File::open("program.elf")?;
//! let mut elf = ElfFile::open_with(src, ElfOptions::default())?;
//! elf.read_dynamic()?;
//! let program = elf.load(&mut my_allocator)?;
//! embelf::reloc::relocate(&mut elf, &program, |name| my_symbols.get(name).copied())?;
//! embelf::mpu::protect(&mut elf, &program, &mut my_mpu, 1)?;
//! ```

pub mod builder;
pub mod elf;
pub mod error;
pub mod load;
pub mod mpu;
pub mod reloc;

pub use elf::{ElfFile, ElfHeader, ElfOptions, Section, Segment, Symbol};
pub use error::ElfError;
pub use load::{Allocation, Allocator, Program};

/// Virtual-address word matching the interpreted ELF class.
#[cfg(feature = "elf32")]
pub type Addr = u32;

/// Virtual-address word matching the interpreted ELF class.
#[cfg(not(feature = "elf32"))]
pub type Addr = u64;
