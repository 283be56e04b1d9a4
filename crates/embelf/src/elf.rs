//! Streaming ELF reader.
//!
//! Parses the file header, program headers, section headers, symbol tables
//! and the `PT_DYNAMIC` dependency list from any random-access byte source.
//! The reader borrows the source (it never closes it) and re-seeks for every
//! structured read, so the source's cursor position is scratch state.
//!
//! Only images whose word size and endianness match the compiled
//! configuration are accepted; all multi-byte fields are therefore decoded
//! native-endian.

use std::io::{Read, Seek, SeekFrom};

use serde::Serialize;

use crate::error::ElfError;
use crate::Addr;

/// ELF magic number: 0x7f 'E' 'L' 'F'.
pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// ELF class: 32-bit.
pub const ELFCLASS32: u8 = 1;

/// ELF class: 64-bit.
pub const ELFCLASS64: u8 = 2;

/// ELF data encoding: little-endian.
pub const ELFDATA2LSB: u8 = 1;

/// ELF data encoding: big-endian.
pub const ELFDATA2MSB: u8 = 2;

/// Current ELF version.
pub const EV_CURRENT: u8 = 1;

/// Class selected at compile time.
const ELFCLASS_HOST: u8 = if cfg!(feature = "elf32") {
    ELFCLASS32
} else {
    ELFCLASS64
};

const WORD: usize = core::mem::size_of::<Addr>();

/// On-disk ELF header size for the compiled class.
pub(crate) const EHDR_SIZE: usize = if cfg!(feature = "elf32") { 52 } else { 64 };

/// Minimum on-disk program header size.
pub(crate) const PHDR_SIZE: usize = if cfg!(feature = "elf32") { 32 } else { 56 };

/// Minimum on-disk section header size.
pub(crate) const SHDR_SIZE: usize = if cfg!(feature = "elf32") { 40 } else { 64 };

/// Minimum on-disk symbol entry size.
pub(crate) const SYM_SIZE: usize = if cfg!(feature = "elf32") { 16 } else { 24 };

/// On-disk relocation entry sizes.
pub(crate) const RELA_SIZE: usize = 3 * WORD;
pub(crate) const REL_SIZE: usize = 2 * WORD;

/// On-disk dynamic entry size (tag word + value word).
pub(crate) const DYN_SIZE: Addr = (2 * WORD) as Addr;

/// Machine types the loader knows how to pin against.
pub mod machine {
    /// x86.
    pub const EM_386: u16 = 0x03;
    /// x86-64.
    pub const EM_X86_64: u16 = 0x3e;
    /// RISC-V.
    pub const EM_RISCV: u16 = 0xf3;

    /// Machine type of the host this loader was compiled for, if known.
    pub fn host() -> Option<u16> {
        if cfg!(target_arch = "x86") {
            Some(EM_386)
        } else if cfg!(target_arch = "x86_64") {
            Some(EM_X86_64)
        } else if cfg!(any(target_arch = "riscv32", target_arch = "riscv64")) {
            Some(EM_RISCV)
        } else {
            None
        }
    }
}

/// Section types.
pub mod sht {
    pub const NULL: u32 = 0;
    pub const PROGBITS: u32 = 1;
    pub const SYMTAB: u32 = 2;
    pub const STRTAB: u32 = 3;
    pub const RELA: u32 = 4;
    pub const DYNAMIC: u32 = 6;
    pub const NOBITS: u32 = 8;
    pub const REL: u32 = 9;
    pub const DYNSYM: u32 = 11;
}

/// Section flags.
pub mod shf {
    use crate::Addr;

    pub const WRITE: Addr = 0x1;
    pub const ALLOC: Addr = 0x2;
    pub const EXECINSTR: Addr = 0x4;
}

/// Program header (segment) types.
pub mod pt {
    pub const NULL: u32 = 0;
    pub const LOAD: u32 = 1;
    pub const DYNAMIC: u32 = 2;
}

/// Segment flags.
pub mod pf {
    pub const X: u32 = 0x1;
    pub const W: u32 = 0x2;
    pub const R: u32 = 0x4;
}

/// Dynamic table tags. Only `DT_NEEDED` is interpreted.
pub mod dt {
    use crate::Addr;

    pub const NULL: Addr = 0;
    pub const NEEDED: Addr = 1;
}

/// Special section indices.
pub mod shn {
    /// Undefined section; symbols here resolve through the embedder.
    pub const UNDEF: u16 = 0;
    /// Start of the reserved index range; indices at or above this value
    /// are special (`SHN_ABS`, `SHN_COMMON`, ...) and pass bounds checks.
    pub const LORESERVE: u16 = 0xff00;
    /// Absolute symbol values.
    pub const ABS: u16 = 0xfff1;
}

// ============================================================================
// Parsed records
// ============================================================================

/// Parsed ELF file header.
#[derive(Debug, Clone, Serialize)]
pub struct ElfHeader {
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: Addr,
    pub e_phoff: Addr,
    pub e_shoff: Addr,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

/// Section descriptor with its name materialised from the name table.
#[derive(Debug, Clone, Serialize)]
pub struct Section {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: Addr,
    pub sh_addr: Addr,
    pub sh_offset: Addr,
    pub sh_size: Addr,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: Addr,
    pub sh_entsize: Addr,
    pub name: String,
}

/// Program header descriptor, on-file fields preserved as-is.
#[derive(Debug, Clone, Serialize)]
pub struct Segment {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: Addr,
    pub p_vaddr: Addr,
    pub p_paddr: Addr,
    pub p_filesz: Addr,
    pub p_memsz: Addr,
    pub p_align: Addr,
}

/// Symbol entry with its name materialised from the linked string table.
#[derive(Debug, Clone, Serialize)]
pub struct Symbol {
    pub st_name: u32,
    pub st_value: Addr,
    pub st_size: Addr,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
    pub name: String,
}

impl Symbol {
    /// Symbol binding (local, global, weak).
    pub fn binding(&self) -> u8 {
        self.st_info >> 4
    }

    /// Symbol type (notype, object, func, section, file).
    pub fn symbol_type(&self) -> u8 {
        self.st_info & 0xf
    }

    pub fn is_global(&self) -> bool {
        self.binding() == 1
    }

    pub fn is_function(&self) -> bool {
        self.symbol_type() == 2
    }

    /// True when the symbol must be resolved by the embedder.
    pub fn is_undefined(&self) -> bool {
        self.st_shndx == shn::UNDEF
    }
}

/// Reader configuration.
///
/// `machine` pins the accepted `e_machine` value; `None` accepts any machine
/// type and leaves the check to the embedder. The default pins to the host
/// architecture when it is one the loader knows about.
#[derive(Debug, Clone)]
pub struct ElfOptions {
    pub machine: Option<u16>,
}

impl Default for ElfOptions {
    fn default() -> Self {
        Self {
            machine: machine::host(),
        }
    }
}

impl ElfOptions {
    /// Accept any machine type.
    pub fn any_machine() -> Self {
        Self { machine: None }
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Streaming reader over an ELF image.
///
/// Owns every parsed table; the byte source is used as scratch and is never
/// closed. The first parse failure poisons the reader and subsequent
/// operations refuse to run.
pub struct ElfFile<R> {
    pub(crate) src: R,
    pub(crate) header: ElfHeader,
    pub(crate) valid: bool,
    pub(crate) segments: Vec<Segment>,
    pub(crate) sections: Vec<Section>,
    pub(crate) symbols: Vec<Symbol>,
    pub(crate) dyn_symbols: Vec<Symbol>,
    pub(crate) needed: Vec<String>,
}

fn format_err(msg: String) -> ElfError {
    log::error!("{}", msg);
    ElfError::InvalidFormat(msg)
}

fn read_u8<R: Read>(src: &mut R) -> Result<u8, ElfError> {
    let mut b = [0u8; 1];
    src.read_exact(&mut b)?;
    Ok(b[0])
}

fn read_u16<R: Read>(src: &mut R) -> Result<u16, ElfError> {
    let mut b = [0u8; 2];
    src.read_exact(&mut b)?;
    Ok(u16::from_ne_bytes(b))
}

fn read_u32<R: Read>(src: &mut R) -> Result<u32, ElfError> {
    let mut b = [0u8; 4];
    src.read_exact(&mut b)?;
    Ok(u32::from_ne_bytes(b))
}

fn read_word<R: Read>(src: &mut R) -> Result<Addr, ElfError> {
    let mut b = [0u8; WORD];
    src.read_exact(&mut b)?;
    Ok(Addr::from_ne_bytes(b))
}

/// NUL-terminated string at `index` in a bulk-loaded string table.
///
/// An index at or past the end of the table is a format error; the string
/// never extends past the table's last byte.
fn name_from_table(table: &[u8], index: usize) -> Result<String, ElfError> {
    if index >= table.len() {
        return Err(format_err(format!(
            "string index {} out of range (table size {})",
            index,
            table.len()
        )));
    }
    let max = table.len() - index - 1;
    let bytes = &table[index..];
    let len = bytes
        .iter()
        .take(max)
        .position(|&b| b == 0)
        .unwrap_or(max);
    Ok(String::from_utf8_lossy(&bytes[..len]).into_owned())
}

impl<R: Read + Seek> ElfFile<R> {
    /// Open an ELF image over `src`, validating the file header against the
    /// default options (host machine pin).
    pub fn open(src: R) -> Result<Self, ElfError> {
        Self::open_with(src, ElfOptions::default())
    }

    /// Open an ELF image with explicit options.
    ///
    /// Eagerly reads and validates the file header: magic, word-size class,
    /// endianness, version fields, header size and (when pinned) machine
    /// type. A rejected header never produces a reader.
    pub fn open_with(mut src: R, options: ElfOptions) -> Result<Self, ElfError> {
        src.seek(SeekFrom::Start(0))?;
        let mut ident = [0u8; 16];
        src.read_exact(&mut ident)?;

        if ident[0..4] != ELF_MAGIC {
            return Err(format_err(format!(
                "bad magic {:02x} {:02x} {:02x} {:02x}",
                ident[0], ident[1], ident[2], ident[3]
            )));
        }

        if ident[4] != ELFCLASS_HOST {
            return Err(if ident[4] == ELFCLASS32 || ident[4] == ELFCLASS64 {
                format_err("ELF class does not match the compiled word size".into())
            } else {
                format_err(format!("invalid EI_CLASS {}", ident[4]))
            });
        }

        let host_le = cfg!(target_endian = "little");
        match ident[5] {
            ELFDATA2LSB if !host_le => {
                return Err(format_err("ELF file is little-endian, host is big-endian".into()))
            }
            ELFDATA2MSB if host_le => {
                return Err(format_err("ELF file is big-endian, host is little-endian".into()))
            }
            ELFDATA2LSB | ELFDATA2MSB => {}
            other => return Err(format_err(format!("invalid EI_DATA {}", other))),
        }

        if ident[6] != EV_CURRENT {
            return Err(format_err(format!("invalid EI_VERSION {}", ident[6])));
        }

        let header = ElfHeader {
            e_type: read_u16(&mut src)?,
            e_machine: read_u16(&mut src)?,
            e_version: read_u32(&mut src)?,
            e_entry: read_word(&mut src)?,
            e_phoff: read_word(&mut src)?,
            e_shoff: read_word(&mut src)?,
            e_flags: read_u32(&mut src)?,
            e_ehsize: read_u16(&mut src)?,
            e_phentsize: read_u16(&mut src)?,
            e_phnum: read_u16(&mut src)?,
            e_shentsize: read_u16(&mut src)?,
            e_shnum: read_u16(&mut src)?,
            e_shstrndx: read_u16(&mut src)?,
        };

        if let Some(expected) = options.machine {
            if header.e_machine != expected {
                log::error!(
                    "ELF file has machine type {:#06x}, host expects {:#06x}",
                    header.e_machine,
                    expected
                );
                return Err(ElfError::UnsupportedArchitecture {
                    found: header.e_machine,
                    expected,
                });
            }
        }

        if header.e_ehsize as usize != EHDR_SIZE {
            return Err(format_err(format!("invalid e_ehsize {}", header.e_ehsize)));
        }
        if header.e_version != 1 {
            return Err(format_err(format!("invalid e_version {}", header.e_version)));
        }

        Ok(Self {
            src,
            header,
            valid: true,
            segments: Vec::new(),
            sections: Vec::new(),
            symbols: Vec::new(),
            dyn_symbols: Vec::new(),
            needed: Vec::new(),
        })
    }

    /// Whether the reader is still usable (no parse failure so far).
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn header(&self) -> &ElfHeader {
        &self.header
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn dyn_symbols(&self) -> &[Symbol] {
        &self.dyn_symbols
    }

    /// Dependency names collected from `PT_DYNAMIC` `DT_NEEDED` entries.
    pub fn needed(&self) -> &[String] {
        &self.needed
    }

    /// Read every table: program headers, sections (with names), `.symtab`
    /// and `.dynsym`. A missing symbol table is not an error; the
    /// corresponding table just stays empty.
    pub fn read_all(&mut self) -> Result<(), ElfError> {
        self.read_segments()?;
        self.read_sections()?;
        self.read_symbols()?;
        self.read_dyn_symbols()?;
        Ok(())
    }

    /// Read the subset required for dynamic loading: program headers,
    /// sections, `.dynsym` and the `DT_NEEDED` list. Fails when the image
    /// has no `PT_DYNAMIC` program header.
    pub fn read_dynamic(&mut self) -> Result<(), ElfError> {
        self.read_segments()?;
        self.read_sections()?;
        self.read_dyn_symbols()?;
        self.read_needed()?;
        Ok(())
    }

    /// Read the program header table. Idempotent.
    pub fn read_segments(&mut self) -> Result<(), ElfError> {
        if !self.segments.is_empty() {
            return Ok(());
        }
        let segments = self.run_parse(Self::parse_segments)?;
        self.segments = segments;
        Ok(())
    }

    /// Read the section header table and resolve section names. Idempotent.
    pub fn read_sections(&mut self) -> Result<(), ElfError> {
        if !self.sections.is_empty() {
            return Ok(());
        }
        let sections = self.run_parse(Self::parse_sections)?;
        self.sections = sections;
        Ok(())
    }

    /// Read the static symbol table (`.symtab`). Missing table is not an
    /// error.
    pub fn read_symbols(&mut self) -> Result<(), ElfError> {
        self.read_sections()?;
        if !self.symbols.is_empty() {
            return Ok(());
        }
        let symbols = self.run_parse(|f| f.parse_named_symbols(".symtab", sht::SYMTAB))?;
        self.symbols = symbols;
        Ok(())
    }

    /// Read the dynamic symbol table (`.dynsym`). Missing table is not an
    /// error.
    pub fn read_dyn_symbols(&mut self) -> Result<(), ElfError> {
        self.read_sections()?;
        if !self.dyn_symbols.is_empty() {
            return Ok(());
        }
        let symbols = self.run_parse(|f| f.parse_named_symbols(".dynsym", sht::DYNSYM))?;
        self.dyn_symbols = symbols;
        Ok(())
    }

    /// Collect `DT_NEEDED` dependency names from the `PT_DYNAMIC` segment.
    /// Fails when no `PT_DYNAMIC` program header exists.
    pub fn read_needed(&mut self) -> Result<(), ElfError> {
        self.read_segments()?;
        self.read_sections()?;
        if !self.needed.is_empty() {
            return Ok(());
        }
        let needed = self.run_parse(Self::parse_needed)?;
        self.needed = needed;
        Ok(())
    }

    /// Find a section by exact name.
    pub fn find_section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Find a static symbol by exact name.
    pub fn find_symbol(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.name == name)
    }

    /// Find a dynamic symbol by exact name.
    pub fn find_dyn_symbol(&self, name: &str) -> Option<&Symbol> {
        self.dyn_symbols.iter().find(|s| s.name == name)
    }

    /// Dump parsed tables through the logging sink.
    pub fn dump(&self) {
        log::info!("program headers:");
        log::info!("  TYPE      ADDR              FILE OFF  SIZE");
        for prog in &self.segments {
            log::info!(
                "  {:08x}  {:016x}  {:8x}  {:4x}",
                prog.p_type,
                prog.p_vaddr,
                prog.p_offset,
                prog.p_memsz
            );
        }

        log::info!("sections:");
        log::info!("  TYPE      ADDR              FILE OFF  SIZE  NAME");
        for sect in &self.sections {
            log::info!(
                "  {:08x}  {:016x}  {:8x}  {:4x}  {}",
                sect.sh_type,
                sect.sh_addr,
                sect.sh_offset,
                sect.sh_size,
                sect.name
            );
        }

        log::info!("symbols:");
        log::info!("  VALUE             NAME");
        for sym in &self.symbols {
            log::info!("  {:016x}  {}", sym.st_value, sym.name);
        }

        log::info!("dynamic symbols:");
        log::info!("  VALUE             NAME");
        for sym in &self.dyn_symbols {
            log::info!("  {:016x}  {}", sym.st_value, sym.name);
        }
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    /// Run a parse pass, refusing when poisoned and poisoning on failure.
    fn run_parse<T, F>(&mut self, f: F) -> Result<T, ElfError>
    where
        F: FnOnce(&mut Self) -> Result<T, ElfError>,
    {
        if !self.valid {
            return Err(ElfError::InvalidFormat(
                "reader poisoned by an earlier parse failure".into(),
            ));
        }
        match f(self) {
            Err(e) => {
                self.valid = false;
                Err(e)
            }
            ok => ok,
        }
    }

    pub(crate) fn seek_to(&mut self, offset: Addr) -> Result<(), ElfError> {
        self.src.seek(SeekFrom::Start(offset as u64))?;
        Ok(())
    }

    pub(crate) fn read_into(&mut self, buf: &mut [u8]) -> Result<(), ElfError> {
        self.src.read_exact(buf)?;
        Ok(())
    }

    pub(crate) fn read_word_src(&mut self) -> Result<Addr, ElfError> {
        read_word(&mut self.src)
    }

    /// Bulk-load a section's bytes (string tables, relocation tables).
    fn read_section_data(&mut self, sect: &Section) -> Result<Vec<u8>, ElfError> {
        self.seek_to(sect.sh_offset)?;
        let mut buf = vec![0u8; sect.sh_size as usize];
        self.src.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn parse_segments(&mut self) -> Result<Vec<Segment>, ElfError> {
        if (self.header.e_phentsize as usize) < PHDR_SIZE {
            return Err(format_err(format!(
                "program header entry size {} too small",
                self.header.e_phentsize
            )));
        }
        let mut segments = Vec::with_capacity(self.header.e_phnum as usize);
        for i in 0..self.header.e_phnum as Addr {
            self.seek_to(self.header.e_phoff + i * self.header.e_phentsize as Addr)?;
            segments.push(self.parse_phdr()?);
        }
        Ok(segments)
    }

    fn parse_phdr(&mut self) -> Result<Segment, ElfError> {
        let p_type = read_u32(&mut self.src)?;
        #[cfg(not(feature = "elf32"))]
        let p_flags = read_u32(&mut self.src)?;
        let p_offset = read_word(&mut self.src)?;
        let p_vaddr = read_word(&mut self.src)?;
        let p_paddr = read_word(&mut self.src)?;
        let p_filesz = read_word(&mut self.src)?;
        let p_memsz = read_word(&mut self.src)?;
        #[cfg(feature = "elf32")]
        let p_flags = read_u32(&mut self.src)?;
        let p_align = read_word(&mut self.src)?;
        Ok(Segment {
            p_type,
            p_flags,
            p_offset,
            p_vaddr,
            p_paddr,
            p_filesz,
            p_memsz,
            p_align,
        })
    }

    fn parse_sections(&mut self) -> Result<Vec<Section>, ElfError> {
        if (self.header.e_shentsize as usize) < SHDR_SIZE {
            return Err(format_err(format!(
                "section header entry size {} too small",
                self.header.e_shentsize
            )));
        }
        let mut sections = Vec::with_capacity(self.header.e_shnum as usize);
        for i in 0..self.header.e_shnum as Addr {
            self.seek_to(self.header.e_shoff + i * self.header.e_shentsize as Addr)?;
            sections.push(self.parse_shdr()?);
        }

        // The section name table is mandatory.
        let idx = self.header.e_shstrndx as usize;
        if idx == 0 || idx >= sections.len() {
            return Err(format_err(format!(
                "invalid e_shstrndx {}",
                self.header.e_shstrndx
            )));
        }

        let name_sect = sections[idx].clone();
        let cache = self.read_section_data(&name_sect)?;
        for sect in &mut sections {
            sect.name = name_from_table(&cache, sect.sh_name as usize)?;
        }
        Ok(sections)
    }

    fn parse_shdr(&mut self) -> Result<Section, ElfError> {
        Ok(Section {
            sh_name: read_u32(&mut self.src)?,
            sh_type: read_u32(&mut self.src)?,
            sh_flags: read_word(&mut self.src)?,
            sh_addr: read_word(&mut self.src)?,
            sh_offset: read_word(&mut self.src)?,
            sh_size: read_word(&mut self.src)?,
            sh_link: read_u32(&mut self.src)?,
            sh_info: read_u32(&mut self.src)?,
            sh_addralign: read_word(&mut self.src)?,
            sh_entsize: read_word(&mut self.src)?,
            name: String::new(),
        })
    }

    /// Parse a named symbol table. A missing table yields an empty vector;
    /// a present table with the wrong type or a broken string-table link is
    /// a format error.
    fn parse_named_symbols(&mut self, name: &str, expected: u32) -> Result<Vec<Symbol>, ElfError> {
        let Some(idx) = self.sections.iter().position(|s| s.name == name) else {
            return Ok(Vec::new());
        };
        let sect = &self.sections[idx];
        if sect.sh_type != expected {
            return Err(format_err(format!(
                "`{}`: sh_type = {:#010x}",
                name, sect.sh_type
            )));
        }
        self.symbols_at(idx)
    }

    /// Parse the symbol table held by section `index`, resolving names from
    /// its linked string table.
    pub(crate) fn symbols_at(&mut self, index: usize) -> Result<Vec<Symbol>, ElfError> {
        let sect = self
            .sections
            .get(index)
            .cloned()
            .ok_or_else(|| format_err(format!("symbol table section index {} out of range", index)))?;
        if sect.sh_type != sht::SYMTAB && sect.sh_type != sht::DYNSYM {
            return Err(format_err(format!(
                "section `{}` is not a symbol table (sh_type = {:#010x})",
                sect.name, sect.sh_type
            )));
        }
        if sect.sh_link == 0 || sect.sh_link as usize >= self.sections.len() {
            return Err(format_err(format!(
                "`{}`: sh_link = {:#010x}",
                sect.name, sect.sh_link
            )));
        }
        let strtab = self.sections[sect.sh_link as usize].clone();

        let entsize = if sect.sh_entsize != 0 {
            sect.sh_entsize
        } else {
            SYM_SIZE as Addr
        };
        if (entsize as usize) < SYM_SIZE {
            return Err(format_err(format!(
                "`{}`: sh_entsize = {}",
                sect.name, entsize
            )));
        }

        let shnum = self.sections.len();
        let count = sect.sh_size / entsize;
        let mut symbols = Vec::with_capacity(count as usize);
        for i in 0..count {
            self.seek_to(sect.sh_offset + i * entsize)?;
            let sym = self.parse_sym()?;
            // Indices between shnum and the reserved range are corrupt;
            // reserved indices (SHN_ABS and friends) pass through.
            if sym.st_shndx as usize >= shnum && sym.st_shndx < shn::LORESERVE {
                return Err(format_err(format!("invalid st_shndx {:#06x}", sym.st_shndx)));
            }
            symbols.push(sym);
        }

        let cache = self.read_section_data(&strtab)?;
        for sym in &mut symbols {
            sym.name = name_from_table(&cache, sym.st_name as usize)?;
        }
        Ok(symbols)
    }

    #[cfg(not(feature = "elf32"))]
    fn parse_sym(&mut self) -> Result<Symbol, ElfError> {
        let st_name = read_u32(&mut self.src)?;
        let st_info = read_u8(&mut self.src)?;
        let st_other = read_u8(&mut self.src)?;
        let st_shndx = read_u16(&mut self.src)?;
        let st_value = read_word(&mut self.src)?;
        let st_size = read_word(&mut self.src)?;
        Ok(Symbol {
            st_name,
            st_value,
            st_size,
            st_info,
            st_other,
            st_shndx,
            name: String::new(),
        })
    }

    #[cfg(feature = "elf32")]
    fn parse_sym(&mut self) -> Result<Symbol, ElfError> {
        let st_name = read_u32(&mut self.src)?;
        let st_value = read_word(&mut self.src)?;
        let st_size = read_word(&mut self.src)?;
        let st_info = read_u8(&mut self.src)?;
        let st_other = read_u8(&mut self.src)?;
        let st_shndx = read_u16(&mut self.src)?;
        Ok(Symbol {
            st_name,
            st_value,
            st_size,
            st_info,
            st_other,
            st_shndx,
            name: String::new(),
        })
    }

    fn parse_needed(&mut self) -> Result<Vec<String>, ElfError> {
        let dynamic = self
            .segments
            .iter()
            .find(|p| p.p_type == pt::DYNAMIC)
            .cloned()
            .ok_or_else(|| format_err("missing program header with type PT_DYNAMIC".into()))?;

        let strtab = self
            .find_section(".dynstr")
            .cloned()
            .ok_or_else(|| format_err("missing `.dynstr` section".into()))?;
        let cache = self.read_section_data(&strtab)?;

        let mut needed = Vec::new();
        for i in 0..dynamic.p_filesz / DYN_SIZE {
            self.seek_to(dynamic.p_offset + i * DYN_SIZE)?;
            let tag = self.read_word_src()?;
            let value = self.read_word_src()?;
            if tag == dt::NEEDED {
                let name = name_from_table(&cache, value as usize)?;
                log::debug!("needed library: {}", name);
                needed.push(name);
            } else if tag == dt::NULL {
                break;
            }
        }
        Ok(needed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ElfBuilder;
    use std::io::Cursor;

    fn open_any(bytes: Vec<u8>) -> Result<ElfFile<Cursor<Vec<u8>>>, ElfError> {
        ElfFile::open_with(Cursor::new(bytes), ElfOptions::any_machine())
    }

    #[test]
    fn parse_minimal_image() {
        let mut b = ElfBuilder::new(machine::EM_RISCV);
        b.entry(0x1000);
        b.segment(".text", 0x1000, pf::R | pf::X, &[0x13, 0x00, 0x00, 0x00]);
        let mut elf = open_any(b.build()).unwrap();
        elf.read_all().unwrap();

        assert_eq!(elf.header().e_machine, machine::EM_RISCV);
        assert_eq!(elf.header().e_entry, 0x1000);
        assert_eq!(elf.segments().len(), elf.header().e_phnum as usize);
        assert_eq!(elf.sections().len(), elf.header().e_shnum as usize);
        assert!(elf.find_section(".text").is_some());
        assert!(elf.find_section(".shstrtab").is_some());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut b = ElfBuilder::new(machine::EM_RISCV);
        b.segment(".text", 0x1000, pf::R | pf::X, &[0; 4]);
        let mut bytes = b.build();
        bytes[1] = b'F';
        assert!(matches!(
            open_any(bytes),
            Err(ElfError::InvalidFormat(_))
        ));
    }

    #[test]
    fn rejects_wrong_class() {
        let mut b = ElfBuilder::new(machine::EM_RISCV);
        b.segment(".text", 0x1000, pf::R | pf::X, &[0; 4]);
        let mut bytes = b.build();
        bytes[4] = if bytes[4] == ELFCLASS64 {
            ELFCLASS32
        } else {
            ELFCLASS64
        };
        assert!(open_any(bytes).is_err());
    }

    #[test]
    fn rejects_wrong_endianness() {
        let mut b = ElfBuilder::new(machine::EM_RISCV);
        b.segment(".text", 0x1000, pf::R | pf::X, &[0; 4]);
        let mut bytes = b.build();
        bytes[5] = if cfg!(target_endian = "little") {
            ELFDATA2MSB
        } else {
            ELFDATA2LSB
        };
        assert!(open_any(bytes).is_err());
    }

    #[test]
    fn rejects_bad_versions() {
        let mut b = ElfBuilder::new(machine::EM_RISCV);
        b.segment(".text", 0x1000, pf::R | pf::X, &[0; 4]);
        let base = b.build();

        let mut bad_ident = base.clone();
        bad_ident[6] = 2;
        assert!(open_any(bad_ident).is_err());

        let mut bad_version = base;
        bad_version[20] = 2;
        assert!(open_any(bad_version).is_err());
    }

    #[test]
    fn rejects_bad_ehsize() {
        let mut b = ElfBuilder::new(machine::EM_RISCV);
        b.segment(".text", 0x1000, pf::R | pf::X, &[0; 4]);
        let mut bytes = b.build();
        let off = if cfg!(feature = "elf32") { 40 } else { 52 };
        bytes[off] = bytes[off].wrapping_add(4);
        assert!(matches!(
            open_any(bytes),
            Err(ElfError::InvalidFormat(_))
        ));
    }

    #[test]
    fn rejects_machine_mismatch_when_pinned() {
        let mut b = ElfBuilder::new(machine::EM_RISCV);
        b.segment(".text", 0x1000, pf::R | pf::X, &[0; 4]);
        let bytes = b.build();
        let opts = ElfOptions {
            machine: Some(machine::EM_X86_64),
        };
        assert!(matches!(
            ElfFile::open_with(Cursor::new(bytes), opts),
            Err(ElfError::UnsupportedArchitecture { found, expected })
                if found == machine::EM_RISCV && expected == machine::EM_X86_64
        ));
    }

    #[test]
    fn missing_symtab_is_not_an_error() {
        let mut b = ElfBuilder::new(machine::EM_RISCV);
        b.segment(".text", 0x1000, pf::R | pf::X, &[0; 4]);
        let mut elf = open_any(b.build()).unwrap();
        elf.read_all().unwrap();
        assert!(elf.symbols().is_empty());
        assert!(elf.dyn_symbols().is_empty());
    }

    #[test]
    fn parses_symbols_with_names() {
        let mut b = ElfBuilder::new(machine::EM_RISCV);
        let text = b.segment(".text", 0x1000, pf::R | pf::X, &[0; 16]);
        b.symbol("main", 0x1004, text);
        b.symbol("helper", 0x1008, text);
        b.undef_symbol("external_fn");
        let mut elf = open_any(b.build()).unwrap();
        elf.read_all().unwrap();

        let main = elf.find_symbol("main").unwrap();
        assert_eq!(main.st_value, 0x1004);
        assert!(!main.is_undefined());
        let ext = elf.find_symbol("external_fn").unwrap();
        assert!(ext.is_undefined());
        assert!(elf.find_symbol("nonexistent").is_none());
    }

    #[test]
    fn reserved_section_indices_pass() {
        let mut b = ElfBuilder::new(machine::EM_RISCV);
        b.segment(".text", 0x1000, pf::R | pf::X, &[0; 8]);
        b.abs_symbol("absolute", 0xdeadbeef);
        let mut elf = open_any(b.build()).unwrap();
        elf.read_all().unwrap();
        assert_eq!(elf.find_symbol("absolute").unwrap().st_shndx, shn::ABS);
    }

    #[cfg(not(feature = "elf32"))]
    #[test]
    fn rejects_symtab_with_bad_strtab_link() {
        let mut b = ElfBuilder::new(machine::EM_RISCV);
        let text = b.segment(".text", 0x1000, pf::R | pf::X, &[0; 8]);
        b.symbol("main", 0x1000, text);
        let mut bytes = b.build();

        // Patch `.symtab`'s sh_link to an out-of-range index. Section order
        // is NULL, .text, .symtab, ... so the symtab header sits at index 2.
        let shoff = u64::from_ne_bytes(bytes[40..48].try_into().unwrap()) as usize;
        let link_off = shoff + 2 * SHDR_SIZE + 40;
        bytes[link_off..link_off + 4].copy_from_slice(&0x7fffu32.to_ne_bytes());

        let mut elf = open_any(bytes).unwrap();
        assert!(elf.read_all().is_err());
        assert!(!elf.is_valid());
        // Poisoned: further operations refuse.
        assert!(elf.read_all().is_err());
    }

    #[cfg(not(feature = "elf32"))]
    #[test]
    fn rejects_symbol_name_index_past_table() {
        let mut b = ElfBuilder::new(machine::EM_RISCV);
        let text = b.segment(".text", 0x1000, pf::R | pf::X, &[0; 8]);
        b.symbol("m", 0x1000, text);
        let mut bytes = b.build();

        // Corrupt the st_name of the first real symbol (entry 1) in
        // `.symtab` (section index 2) to point far past `.strtab`.
        let shoff = u64::from_ne_bytes(bytes[40..48].try_into().unwrap()) as usize;
        let symtab_hdr = shoff + 2 * SHDR_SIZE;
        let sym_off =
            u64::from_ne_bytes(bytes[symtab_hdr + 24..symtab_hdr + 32].try_into().unwrap())
                as usize;
        let entry1 = sym_off + SYM_SIZE;
        bytes[entry1..entry1 + 4].copy_from_slice(&0x0fff_ffffu32.to_ne_bytes());

        let mut elf = open_any(bytes).unwrap();
        assert!(matches!(elf.read_all(), Err(ElfError::InvalidFormat(_))));
    }

    #[test]
    fn collects_needed_libraries() {
        let mut b = ElfBuilder::new(machine::EM_RISCV);
        b.segment(".text", 0x1000, pf::R | pf::X, &[0; 8]);
        b.needed("libc.so");
        b.needed("libm.so");
        let mut elf = open_any(b.build()).unwrap();
        elf.read_dynamic().unwrap();
        assert_eq!(elf.needed(), ["libc.so", "libm.so"]);
    }

    #[test]
    fn read_dynamic_requires_dynamic_segment() {
        let mut b = ElfBuilder::new(machine::EM_RISCV);
        b.segment(".text", 0x1000, pf::R | pf::X, &[0; 8]);
        let mut elf = open_any(b.build()).unwrap();
        assert!(matches!(
            elf.read_dynamic(),
            Err(ElfError::InvalidFormat(_))
        ));
    }

    #[test]
    fn name_from_table_bounds() {
        let table = b"\0hello\0x\0";
        assert_eq!(name_from_table(table, 1).unwrap(), "hello");
        assert_eq!(name_from_table(table, 0).unwrap(), "");
        assert!(name_from_table(table, table.len()).is_err());
        assert!(name_from_table(table, table.len() + 10).is_err());
        // Unterminated tail stops at the table's last byte.
        assert_eq!(name_from_table(b"\0abc", 1).unwrap(), "ab");
    }
}
