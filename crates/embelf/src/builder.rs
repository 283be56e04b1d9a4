//! Minimal ELF image builder used by tests and benchmarks.
//!
//! Produces well-formed images of the compiled class and host endianness:
//! loadable segments, static symbol table, RELA relocation sections and a
//! `PT_DYNAMIC` segment with `DT_NEEDED` entries. Malformed variants are
//! made by mutating the returned bytes.

use crate::elf::{
    dt, pf, pt, shf, shn, sht, DYN_SIZE, EHDR_SIZE, ELFCLASS32, ELFCLASS64, ELFDATA2LSB,
    ELFDATA2MSB, ELF_MAGIC, EV_CURRENT, PHDR_SIZE, RELA_SIZE, SHDR_SIZE, SYM_SIZE,
};
use crate::Addr;

const ET_EXEC: u16 = 2;

/// GLOBAL binding, NOTYPE.
const ST_INFO_GLOBAL: u8 = 0x10;

struct SegSpec {
    name: String,
    vaddr: Addr,
    flags: u32,
    data: Vec<u8>,
    memsz: Addr,
    align: Addr,
}

struct SymSpec {
    name: String,
    value: Addr,
    shndx: u16,
}

struct RelaSpec {
    section: u16,
    offset: Addr,
    rtype: u32,
    sym: u32,
    addend: i64,
}

pub struct ElfBuilder {
    machine: u16,
    entry: Addr,
    segments: Vec<SegSpec>,
    symbols: Vec<SymSpec>,
    dyn_symbols: Vec<SymSpec>,
    relas: Vec<RelaSpec>,
    needed: Vec<String>,
}

impl ElfBuilder {
    pub fn new(machine: u16) -> Self {
        Self {
            machine,
            entry: 0,
            segments: Vec::new(),
            symbols: Vec::new(),
            dyn_symbols: Vec::new(),
            relas: Vec::new(),
            needed: Vec::new(),
        }
    }

    pub fn entry(&mut self, addr: Addr) {
        self.entry = addr;
    }

    /// Add a loadable segment backed by `data`. Returns the index of the
    /// section created for it, usable as a relocation target or symbol home.
    pub fn segment(&mut self, name: &str, vaddr: Addr, flags: u32, data: &[u8]) -> u16 {
        self.push_segment(name, vaddr, flags, data, data.len() as Addr, 4)
    }

    /// Like [`segment`](Self::segment) with a memory size larger than the
    /// file size (zero-filled tail).
    pub fn segment_with_memsz(
        &mut self,
        name: &str,
        vaddr: Addr,
        flags: u32,
        data: &[u8],
        memsz: Addr,
    ) -> u16 {
        self.push_segment(name, vaddr, flags, data, memsz, 4)
    }

    /// Like [`segment`](Self::segment) with an explicit `p_align`.
    pub fn segment_with_align(
        &mut self,
        name: &str,
        vaddr: Addr,
        flags: u32,
        data: &[u8],
        align: Addr,
    ) -> u16 {
        self.push_segment(name, vaddr, flags, data, data.len() as Addr, align)
    }

    fn push_segment(
        &mut self,
        name: &str,
        vaddr: Addr,
        flags: u32,
        data: &[u8],
        memsz: Addr,
        align: Addr,
    ) -> u16 {
        self.segments.push(SegSpec {
            name: name.to_string(),
            vaddr,
            flags,
            data: data.to_vec(),
            memsz,
            align,
        });
        self.segments.len() as u16
    }

    /// Add a defined symbol bound to section `shndx`. Returns its index in
    /// `.symtab` (the null entry occupies index 0).
    pub fn symbol(&mut self, name: &str, value: Addr, shndx: u16) -> u32 {
        self.symbols.push(SymSpec {
            name: name.to_string(),
            value,
            shndx,
        });
        self.symbols.len() as u32
    }

    /// Add an undefined symbol (resolved by the embedder at relocation time).
    pub fn undef_symbol(&mut self, name: &str) -> u32 {
        self.symbol(name, 0, shn::UNDEF)
    }

    /// Add an absolute-valued symbol.
    pub fn abs_symbol(&mut self, name: &str, value: Addr) -> u32 {
        self.symbol(name, value, shn::ABS)
    }

    /// Add a RELA entry applying to `section` (as returned by
    /// [`segment`](Self::segment)) at `offset` bytes into it.
    pub fn rela(&mut self, section: u16, offset: Addr, rtype: u32, sym: u32, addend: i64) {
        self.relas.push(RelaSpec {
            section,
            offset,
            rtype,
            sym,
            addend,
        });
    }

    /// Add a `DT_NEEDED` dependency; implies a `PT_DYNAMIC` segment and a
    /// `.dynsym`/`.dynstr` pair.
    pub fn needed(&mut self, name: &str) {
        self.needed.push(name.to_string());
    }

    pub fn build(&self) -> Vec<u8> {
        let mut sects: Vec<Plan> = vec![Plan::null()];

        for seg in &self.segments {
            let mut sh_flags = shf::ALLOC;
            if seg.flags & pf::W != 0 {
                sh_flags |= shf::WRITE;
            }
            if seg.flags & pf::X != 0 {
                sh_flags |= shf::EXECINSTR;
            }
            sects.push(Plan {
                name: seg.name.clone(),
                sh_type: sht::PROGBITS,
                sh_flags,
                sh_addr: seg.vaddr,
                data: seg.data.clone(),
                sh_link: 0,
                sh_info: 0,
                sh_addralign: 4,
                sh_entsize: 0,
                ..Plan::null()
            });
        }

        // Static symbol table; relocations need at least the null symbol.
        let has_symtab = !self.symbols.is_empty() || !self.relas.is_empty();
        let mut symtab_index = 0u32;
        if has_symtab {
            let (symtab_data, strtab_data) = serialize_symbols(&self.symbols);
            symtab_index = sects.len() as u32;
            sects.push(Plan {
                name: ".symtab".into(),
                sh_type: sht::SYMTAB,
                data: symtab_data,
                sh_link: symtab_index + 1,
                sh_info: 1,
                sh_addralign: 8,
                sh_entsize: SYM_SIZE as Addr,
                ..Plan::null()
            });
            sects.push(Plan {
                name: ".strtab".into(),
                sh_type: sht::STRTAB,
                data: strtab_data,
                sh_addralign: 1,
                ..Plan::null()
            });
        }

        // Dynamic symbol table, string table and dynamic table.
        let has_dyn = !self.needed.is_empty() || !self.dyn_symbols.is_empty();
        let mut dynamic_plan = 0usize;
        let mut dyn_vaddr: Addr = 0;
        if has_dyn {
            let (dynsym_data, mut dynstr_data) = serialize_symbols(&self.dyn_symbols);
            let needed_offs: Vec<Addr> = self
                .needed
                .iter()
                .map(|n| {
                    let off = dynstr_data.len() as Addr;
                    dynstr_data.extend_from_slice(n.as_bytes());
                    dynstr_data.push(0);
                    off
                })
                .collect();

            let dynsym_index = sects.len() as u32;
            sects.push(Plan {
                name: ".dynsym".into(),
                sh_type: sht::DYNSYM,
                data: dynsym_data,
                sh_link: dynsym_index + 1,
                sh_info: 1,
                sh_addralign: 8,
                sh_entsize: SYM_SIZE as Addr,
                ..Plan::null()
            });
            let dynstr_index = sects.len() as u32;
            sects.push(Plan {
                name: ".dynstr".into(),
                sh_type: sht::STRTAB,
                data: dynstr_data,
                sh_addralign: 1,
                ..Plan::null()
            });

            let mut dyn_data = Vec::new();
            for off in &needed_offs {
                push_word(&mut dyn_data, dt::NEEDED);
                push_word(&mut dyn_data, *off);
            }
            push_word(&mut dyn_data, dt::NULL);
            push_word(&mut dyn_data, 0);

            dyn_vaddr = self
                .segments
                .iter()
                .map(|s| s.vaddr + s.memsz.max(s.data.len() as Addr))
                .max()
                .map(|end| (end + 7) & !7)
                .unwrap_or(0x4000);
            dynamic_plan = sects.len();
            sects.push(Plan {
                name: ".dynamic".into(),
                sh_type: sht::DYNAMIC,
                sh_flags: shf::ALLOC | shf::WRITE,
                sh_addr: dyn_vaddr,
                data: dyn_data,
                sh_link: dynstr_index,
                sh_addralign: 8,
                sh_entsize: DYN_SIZE,
                ..Plan::null()
            });
        }

        // Relocation sections, grouped by target, linked to `.symtab`.
        let mut targets: Vec<u16> = Vec::new();
        for r in &self.relas {
            if !targets.contains(&r.section) {
                targets.push(r.section);
            }
        }
        for target in targets {
            let mut data = Vec::new();
            for r in self.relas.iter().filter(|r| r.section == target) {
                push_word(&mut data, r.offset);
                push_word(&mut data, pack_info(r.sym, r.rtype));
                push_word(&mut data, r.addend as Addr);
            }
            let name = format!(".rela{}", sects[target as usize].name);
            sects.push(Plan {
                name,
                sh_type: sht::RELA,
                data,
                sh_link: symtab_index,
                sh_info: target as u32,
                sh_addralign: 8,
                sh_entsize: RELA_SIZE as Addr,
                ..Plan::null()
            });
        }

        // Section name table comes last and names itself.
        let mut shstrtab = vec![0u8];
        for plan in sects.iter_mut().skip(1) {
            plan.sh_name = shstrtab.len() as u32;
            shstrtab.extend_from_slice(plan.name.as_bytes());
            shstrtab.push(0);
        }
        let shstrndx = sects.len() as u16;
        let mut shstr_plan = Plan {
            name: ".shstrtab".into(),
            sh_type: sht::STRTAB,
            sh_addralign: 1,
            ..Plan::null()
        };
        shstr_plan.sh_name = shstrtab.len() as u32;
        shstrtab.extend_from_slice(b".shstrtab\0");
        shstr_plan.data = shstrtab;
        sects.push(shstr_plan);

        // Lay out section data after the program header table.
        let phnum = self.segments.len() + if has_dyn { 2 } else { 0 };
        let mut off = EHDR_SIZE + phnum * PHDR_SIZE;
        for plan in sects.iter_mut().skip(1) {
            off = align_up(off, plan.sh_addralign.max(1) as usize);
            plan.sh_offset = off as Addr;
            off += plan.data.len();
        }
        let shoff = align_up(off, 8);

        // File header.
        let mut buf = Vec::with_capacity(shoff + sects.len() * SHDR_SIZE);
        buf.extend_from_slice(&ELF_MAGIC);
        buf.push(if cfg!(feature = "elf32") {
            ELFCLASS32
        } else {
            ELFCLASS64
        });
        buf.push(if cfg!(target_endian = "little") {
            ELFDATA2LSB
        } else {
            ELFDATA2MSB
        });
        buf.push(EV_CURRENT);
        buf.push(0);
        buf.extend_from_slice(&[0u8; 8]);
        push_u16(&mut buf, ET_EXEC);
        push_u16(&mut buf, self.machine);
        push_u32(&mut buf, 1);
        push_word(&mut buf, self.entry);
        push_word(&mut buf, EHDR_SIZE as Addr);
        push_word(&mut buf, shoff as Addr);
        push_u32(&mut buf, 0);
        push_u16(&mut buf, EHDR_SIZE as u16);
        push_u16(&mut buf, PHDR_SIZE as u16);
        push_u16(&mut buf, phnum as u16);
        push_u16(&mut buf, SHDR_SIZE as u16);
        push_u16(&mut buf, sects.len() as u16);
        push_u16(&mut buf, shstrndx);

        // Program headers.
        for (i, seg) in self.segments.iter().enumerate() {
            push_phdr(
                &mut buf,
                pt::LOAD,
                seg.flags,
                sects[i + 1].sh_offset,
                seg.vaddr,
                seg.data.len() as Addr,
                seg.memsz,
                seg.align,
            );
        }
        if has_dyn {
            let plan = &sects[dynamic_plan];
            let len = plan.data.len() as Addr;
            push_phdr(
                &mut buf,
                pt::LOAD,
                pf::R | pf::W,
                plan.sh_offset,
                dyn_vaddr,
                len,
                len,
                8,
            );
            push_phdr(
                &mut buf,
                pt::DYNAMIC,
                pf::R | pf::W,
                plan.sh_offset,
                dyn_vaddr,
                len,
                len,
                8,
            );
        }

        // Section data.
        for plan in sects.iter().skip(1) {
            pad_to(&mut buf, plan.sh_offset as usize);
            buf.extend_from_slice(&plan.data);
        }

        // Section headers.
        pad_to(&mut buf, shoff);
        for plan in &sects {
            push_u32(&mut buf, plan.sh_name);
            push_u32(&mut buf, plan.sh_type);
            push_word(&mut buf, plan.sh_flags);
            push_word(&mut buf, plan.sh_addr);
            push_word(&mut buf, plan.sh_offset);
            push_word(&mut buf, plan.data.len() as Addr);
            push_u32(&mut buf, plan.sh_link);
            push_u32(&mut buf, plan.sh_info);
            push_word(&mut buf, plan.sh_addralign);
            push_word(&mut buf, plan.sh_entsize);
        }

        buf
    }
}

struct Plan {
    name: String,
    sh_name: u32,
    sh_type: u32,
    sh_flags: Addr,
    sh_addr: Addr,
    sh_offset: Addr,
    sh_link: u32,
    sh_info: u32,
    sh_addralign: Addr,
    sh_entsize: Addr,
    data: Vec<u8>,
}

impl Plan {
    fn null() -> Self {
        Self {
            name: String::new(),
            sh_name: 0,
            sh_type: sht::NULL,
            sh_flags: 0,
            sh_addr: 0,
            sh_offset: 0,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 0,
            sh_entsize: 0,
            data: Vec::new(),
        }
    }
}

/// Serialize a symbol list (null entry prepended) plus its string table.
fn serialize_symbols(symbols: &[SymSpec]) -> (Vec<u8>, Vec<u8>) {
    let mut strtab = vec![0u8];
    let mut symtab = vec![0u8; SYM_SIZE];
    for sym in symbols {
        let name_off = strtab.len() as u32;
        strtab.extend_from_slice(sym.name.as_bytes());
        strtab.push(0);
        push_sym(&mut symtab, name_off, sym.value, ST_INFO_GLOBAL, sym.shndx);
    }
    (symtab, strtab)
}

fn push_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_ne_bytes());
}

fn push_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_ne_bytes());
}

fn push_word(buf: &mut Vec<u8>, v: Addr) {
    buf.extend_from_slice(&v.to_ne_bytes());
}

fn pad_to(buf: &mut Vec<u8>, off: usize) {
    debug_assert!(off >= buf.len());
    buf.resize(off, 0);
}

fn align_up(v: usize, a: usize) -> usize {
    (v + a - 1) & !(a - 1)
}

fn push_phdr(
    buf: &mut Vec<u8>,
    p_type: u32,
    flags: u32,
    offset: Addr,
    vaddr: Addr,
    filesz: Addr,
    memsz: Addr,
    align: Addr,
) {
    push_u32(buf, p_type);
    #[cfg(not(feature = "elf32"))]
    push_u32(buf, flags);
    push_word(buf, offset);
    push_word(buf, vaddr);
    push_word(buf, vaddr);
    push_word(buf, filesz);
    push_word(buf, memsz);
    #[cfg(feature = "elf32")]
    push_u32(buf, flags);
    push_word(buf, align);
}

#[cfg(not(feature = "elf32"))]
fn push_sym(buf: &mut Vec<u8>, name: u32, value: Addr, info: u8, shndx: u16) {
    push_u32(buf, name);
    buf.push(info);
    buf.push(0);
    push_u16(buf, shndx);
    push_word(buf, value);
    push_word(buf, 0);
}

#[cfg(feature = "elf32")]
fn push_sym(buf: &mut Vec<u8>, name: u32, value: Addr, info: u8, shndx: u16) {
    push_u32(buf, name);
    push_word(buf, value);
    push_word(buf, 0);
    buf.push(info);
    buf.push(0);
    push_u16(buf, shndx);
}

/// Pack (symbol index, relocation type) into `r_info` for the compiled
/// class.
#[cfg(feature = "elf32")]
fn pack_info(sym: u32, rtype: u32) -> Addr {
    (sym << 8) | (rtype & 0xff)
}

#[cfg(not(feature = "elf32"))]
fn pack_info(sym: u32, rtype: u32) -> Addr {
    ((sym as u64) << 32) | rtype as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::{ElfFile, ElfOptions};
    use std::io::Cursor;

    #[test]
    fn built_image_parses_cleanly() {
        let mut b = ElfBuilder::new(crate::elf::machine::EM_RISCV);
        b.entry(0x1000);
        let text = b.segment(".text", 0x1000, pf::R | pf::X, &[1, 2, 3, 4]);
        b.symbol("start", 0x1000, text);
        b.needed("libgcc.so");
        b.rela(text, 0, crate::reloc::rv::R_RISCV_RELATIVE, 0, 0x10);

        let bytes = b.build();
        let mut elf = ElfFile::open_with(Cursor::new(bytes), ElfOptions::any_machine()).unwrap();
        elf.read_all().unwrap();
        elf.read_needed().unwrap();

        assert_eq!(elf.segments().len(), elf.header().e_phnum as usize);
        assert_eq!(elf.sections().len(), elf.header().e_shnum as usize);
        assert!(elf.find_section(".rela.text").is_some());
        assert_eq!(elf.find_symbol("start").unwrap().st_value, 0x1000);
        assert_eq!(elf.needed(), ["libgcc.so"]);
    }
}
