//! Relocation engine.
//!
//! Walks every `SHT_REL`/`SHT_RELA` section of a loaded image and patches
//! the placed segments so the code runs correctly at its real base address.
//! Dispatch is by the image's machine type; RISC-V is the one architecture
//! implemented here.
//!
//! `PCREL_HI20`/`PCREL_LO12` pairs are resolved through a table of HI20
//! sites keyed by their file-view target address, populated in a first pass
//! over all relocation sections.

use std::collections::HashMap;
use std::io::{Read, Seek};

use crate::elf::{machine, shn, sht, ElfFile, Section, RELA_SIZE, REL_SIZE};
use crate::error::ElfError;
use crate::load::Program;
use crate::Addr;

/// RISC-V relocation types understood by the engine.
pub mod rv {
    pub const R_RISCV_NONE: u32 = 0;
    pub const R_RISCV_32: u32 = 1;
    pub const R_RISCV_64: u32 = 2;
    pub const R_RISCV_RELATIVE: u32 = 3;
    pub const R_RISCV_JUMP_SLOT: u32 = 5;
    pub const R_RISCV_BRANCH: u32 = 16;
    pub const R_RISCV_JAL: u32 = 17;
    pub const R_RISCV_CALL: u32 = 18;
    pub const R_RISCV_CALL_PLT: u32 = 19;
    pub const R_RISCV_PCREL_HI20: u32 = 23;
    pub const R_RISCV_PCREL_LO12_I: u32 = 24;
    pub const R_RISCV_PCREL_LO12_S: u32 = 25;
}

/// Apply every relocation of `file` to the loaded `program` image.
///
/// `resolver` is consulted for symbols with `SHN_UNDEF`; everything else
/// resolves to its own value plus the load bias. Returns the number of
/// entries patched.
///
/// A failure may leave the image partially patched; the embedder owns the
/// allocation and must release it.
pub fn relocate<R, F>(
    file: &mut ElfFile<R>,
    program: &Program,
    resolver: F,
) -> Result<usize, ElfError>
where
    R: Read + Seek,
    F: Fn(&str) -> Option<Addr>,
{
    file.read_sections()?;
    match file.header().e_machine {
        machine::EM_RISCV => riscv_relocate(file, program, &resolver),
        other => Err(ElfError::UnsupportedArchitecture {
            found: other,
            expected: machine::EM_RISCV,
        }),
    }
}

struct RawReloc {
    offset: Addr,
    sym: u32,
    rtype: u32,
    addend: i64,
}

/// One entry with its target and symbol already resolved to host addresses.
struct Pending {
    rtype: u32,
    target: Addr,
    s: Addr,
    addend: i64,
    /// File-view address of the paired HI20 site (`PCREL_LO12_*` only).
    lo_key: Addr,
}

#[cfg(feature = "elf32")]
fn word_signed(w: Addr) -> i64 {
    w as i32 as i64
}

#[cfg(not(feature = "elf32"))]
fn word_signed(w: Addr) -> i64 {
    w as i64
}

/// Split `r_info` into (symbol index, relocation type).
#[cfg(feature = "elf32")]
fn split_info(info: Addr) -> (u32, u32) {
    ((info >> 8) as u32, (info & 0xff) as u32)
}

/// Split `r_info` into (symbol index, relocation type).
#[cfg(not(feature = "elf32"))]
fn split_info(info: Addr) -> (u32, u32) {
    ((info >> 32) as u32, (info & 0xffff_ffff) as u32)
}

fn needs_symbol(rtype: u32) -> bool {
    matches!(
        rtype,
        rv::R_RISCV_32
            | rv::R_RISCV_64
            | rv::R_RISCV_JUMP_SLOT
            | rv::R_RISCV_CALL
            | rv::R_RISCV_CALL_PLT
            | rv::R_RISCV_BRANCH
            | rv::R_RISCV_JAL
            | rv::R_RISCV_PCREL_HI20
    )
}

fn read_reloc_entries<R: Read + Seek>(
    file: &mut ElfFile<R>,
    sect: &Section,
) -> Result<Vec<RawReloc>, ElfError> {
    let rela = sect.sh_type == sht::RELA;
    let min = if rela { RELA_SIZE } else { REL_SIZE };
    let entsize = if sect.sh_entsize != 0 {
        sect.sh_entsize
    } else {
        min as Addr
    };
    if (entsize as usize) < min {
        return Err(ElfError::InvalidFormat(format!(
            "`{}`: sh_entsize = {}",
            sect.name, entsize
        )));
    }

    let count = sect.sh_size / entsize;
    let mut out = Vec::with_capacity(count as usize);
    for i in 0..count {
        file.seek_to(sect.sh_offset + i * entsize)?;
        let offset = file.read_word_src()?;
        let info = file.read_word_src()?;
        let addend = if rela {
            word_signed(file.read_word_src()?)
        } else {
            0
        };
        let (sym, rtype) = split_info(info);
        out.push(RawReloc {
            offset,
            sym,
            rtype,
            addend,
        });
    }
    Ok(out)
}

/// In-place addend for `SHT_REL` entries. Only word-sized relocations carry
/// a meaningful one; the RISC-V psABI emits RELA for instruction patches.
fn implicit_addend(rtype: u32, target: Addr) -> i64 {
    match rtype {
        rv::R_RISCV_32 => unsafe { read_u32_at(target) as i32 as i64 },
        rv::R_RISCV_64 | rv::R_RISCV_RELATIVE => unsafe { word_signed(read_word_at(target)) },
        _ => 0,
    }
}

fn riscv_relocate<R, F>(
    file: &mut ElfFile<R>,
    program: &Program,
    resolver: &F,
) -> Result<usize, ElfError>
where
    R: Read + Seek,
    F: Fn(&str) -> Option<Addr>,
{
    let offs = program.offset();

    let reloc_sects: Vec<Section> = file
        .sections()
        .iter()
        .filter(|s| s.sh_type == sht::REL || s.sh_type == sht::RELA)
        .cloned()
        .collect();

    let mut pending: Vec<Pending> = Vec::new();
    let mut hi_sites: HashMap<Addr, i64> = HashMap::new();

    for sect in &reloc_sects {
        let link = sect.sh_link as usize;
        let apply_to = sect.sh_info as usize;
        if link == 0 || link >= file.sections().len() || apply_to >= file.sections().len() {
            log::warn!(
                "skipping relocation section `{}`: invalid sh_link/sh_info",
                sect.name
            );
            continue;
        }
        let symbols = file.symbols_at(link)?;
        let base = file.sections()[apply_to].sh_addr;
        let rela = sect.sh_type == sht::RELA;

        for raw in read_reloc_entries(file, sect)? {
            let file_target = base.wrapping_add(raw.offset);
            let target = file_target.wrapping_add(offs);
            let sym = symbols.get(raw.sym as usize).ok_or_else(|| {
                ElfError::InvalidFormat(format!(
                    "relocation symbol index {} out of range",
                    raw.sym
                ))
            })?;

            let s = if needs_symbol(raw.rtype) {
                if sym.st_shndx == shn::UNDEF {
                    resolver(&sym.name).ok_or_else(|| {
                        log::error!("undefined symbol `{}` in relocation", sym.name);
                        ElfError::UndefinedSymbol(sym.name.clone())
                    })?
                } else {
                    sym.st_value.wrapping_add(offs)
                }
            } else {
                0
            };

            let addend = if rela {
                raw.addend
            } else {
                implicit_addend(raw.rtype, target)
            };

            let lo_key = match raw.rtype {
                rv::R_RISCV_PCREL_LO12_I | rv::R_RISCV_PCREL_LO12_S => {
                    sym.st_value.wrapping_add(addend as Addr)
                }
                _ => 0,
            };

            // First pass: remember where every HI20 lands so LO12 entries
            // can inherit its displacement.
            if raw.rtype == rv::R_RISCV_PCREL_HI20 {
                let disp = (s as i64).wrapping_add(addend).wrapping_sub(target as i64);
                hi_sites.insert(file_target, disp);
            }

            pending.push(Pending {
                rtype: raw.rtype,
                target,
                s,
                addend,
                lo_key,
            });
        }
    }

    let mut applied = 0;
    for r in &pending {
        applied += apply(r, offs, &hi_sites)?;
    }
    log::debug!("applied {} relocations", applied);
    Ok(applied)
}

fn disp_of(r: &Pending) -> i64 {
    (r.s as i64)
        .wrapping_add(r.addend)
        .wrapping_sub(r.target as i64)
}

fn range_err(target: Addr, disp: i64) -> ElfError {
    log::error!(
        "pc-relative displacement {:#x} out of range at {:#x}",
        disp,
        target
    );
    ElfError::InvalidFormat(format!(
        "relocation displacement out of range at {:#x}",
        target
    ))
}

/// Displacement for AUIPC-based relocations, checked to the ±2 GiB window.
fn pcrel(r: &Pending) -> Result<i64, ElfError> {
    let disp = disp_of(r);
    if i32::try_from(disp).is_err() {
        return Err(range_err(r.target, disp));
    }
    Ok(disp)
}

fn paired_disp(r: &Pending, hi_sites: &HashMap<Addr, i64>) -> Result<i64, ElfError> {
    hi_sites.get(&r.lo_key).copied().ok_or_else(|| {
        ElfError::InvalidFormat(format!(
            "no pcrel_hi20 paired with relocation referencing {:#x}",
            r.lo_key
        ))
    })
}

fn apply(r: &Pending, offs: Addr, hi_sites: &HashMap<Addr, i64>) -> Result<usize, ElfError> {
    match r.rtype {
        rv::R_RISCV_NONE => return Ok(0),
        rv::R_RISCV_32 => unsafe {
            write_u32_at(r.target, (r.s as i64).wrapping_add(r.addend) as u32);
        },
        rv::R_RISCV_64 => {
            #[cfg(feature = "elf32")]
            return Err(ElfError::UnsupportedRelocation(r.rtype));
            #[cfg(not(feature = "elf32"))]
            unsafe {
                write_u64_at(r.target, (r.s as i64).wrapping_add(r.addend) as u64);
            }
        }
        rv::R_RISCV_RELATIVE => unsafe {
            write_word_at(r.target, (offs as i64).wrapping_add(r.addend) as Addr);
        },
        rv::R_RISCV_JUMP_SLOT => unsafe {
            write_word_at(r.target, r.s);
        },
        rv::R_RISCV_CALL | rv::R_RISCV_CALL_PLT => {
            let disp = pcrel(r)?;
            // AUIPC at the target, JALR right behind it.
            unsafe {
                patch_u_imm(r.target, hi20(disp));
                patch_i_imm(r.target.wrapping_add(4), lo12(disp));
            }
        }
        rv::R_RISCV_BRANCH => {
            let disp = disp_of(r);
            if !(-4096..=4094).contains(&disp) || disp & 1 != 0 {
                return Err(range_err(r.target, disp));
            }
            unsafe {
                patch_b_imm(r.target, disp as i32);
            }
        }
        rv::R_RISCV_JAL => {
            let disp = disp_of(r);
            if !(-(1 << 20)..=(1 << 20) - 2).contains(&disp) || disp & 1 != 0 {
                return Err(range_err(r.target, disp));
            }
            unsafe {
                patch_j_imm(r.target, disp as i32);
            }
        }
        rv::R_RISCV_PCREL_HI20 => {
            let disp = pcrel(r)?;
            unsafe {
                patch_u_imm(r.target, hi20(disp));
            }
        }
        rv::R_RISCV_PCREL_LO12_I => {
            let disp = paired_disp(r, hi_sites)?;
            unsafe {
                patch_i_imm(r.target, lo12(disp));
            }
        }
        rv::R_RISCV_PCREL_LO12_S => {
            let disp = paired_disp(r, hi_sites)?;
            unsafe {
                patch_s_imm(r.target, lo12(disp));
            }
        }
        other => return Err(ElfError::UnsupportedRelocation(other)),
    }
    Ok(1)
}

/// Upper 20 bits of a displacement, rounded so the sign-extended low half
/// recombines exactly: `sext(hi20 << 12) + lo12 == disp`.
fn hi20(disp: i64) -> u32 {
    (((disp + 0x800) >> 12) & 0xf_ffff) as u32
}

/// Signed low 12 bits complementing [`hi20`].
fn lo12(disp: i64) -> i32 {
    (disp - (((disp + 0x800) >> 12) << 12)) as i32
}

// ----------------------------------------------------------------------
// raw image access
// ----------------------------------------------------------------------
//
// Targets live inside the allocation backing the Program, so plain pointer
// access is valid under the Allocator contract. Unaligned forms: data
// relocations may land on any byte.

unsafe fn read_u32_at(addr: Addr) -> u32 {
    (addr as usize as *const u32).read_unaligned()
}

unsafe fn write_u32_at(addr: Addr, v: u32) {
    (addr as usize as *mut u32).write_unaligned(v)
}

#[cfg(not(feature = "elf32"))]
unsafe fn write_u64_at(addr: Addr, v: u64) {
    (addr as usize as *mut u64).write_unaligned(v)
}

unsafe fn read_word_at(addr: Addr) -> Addr {
    (addr as usize as *const Addr).read_unaligned()
}

unsafe fn write_word_at(addr: Addr, v: Addr) {
    (addr as usize as *mut Addr).write_unaligned(v)
}

/// Replace the U-type immediate (bits 31:12) of the instruction at `addr`.
unsafe fn patch_u_imm(addr: Addr, imm20: u32) {
    let insn = read_u32_at(addr) & 0x0000_0fff;
    write_u32_at(addr, insn | (imm20 << 12));
}

/// Replace the I-type immediate (bits 31:20) of the instruction at `addr`.
unsafe fn patch_i_imm(addr: Addr, imm: i32) {
    let insn = read_u32_at(addr) & 0x000f_ffff;
    write_u32_at(addr, insn | ((imm as u32 & 0xfff) << 20));
}

/// Replace the S-type immediate (imm[11:5] in bits 31:25, imm[4:0] in bits
/// 11:7) of the instruction at `addr`.
unsafe fn patch_s_imm(addr: Addr, imm: i32) {
    let v = imm as u32 & 0xfff;
    let insn = read_u32_at(addr) & !0xfe00_0f80;
    write_u32_at(addr, insn | ((v >> 5) << 25) | ((v & 0x1f) << 7));
}

/// Replace the B-type immediate (imm[12|10:5] in bits 31:25, imm[4:1|11]
/// in bits 11:7) of the instruction at `addr`.
unsafe fn patch_b_imm(addr: Addr, disp: i32) {
    let v = disp as u32;
    let insn = read_u32_at(addr) & !0xfe00_0f80;
    let enc = (((v >> 12) & 1) << 31)
        | (((v >> 5) & 0x3f) << 25)
        | (((v >> 1) & 0xf) << 8)
        | (((v >> 11) & 1) << 7);
    write_u32_at(addr, insn | enc);
}

/// Replace the J-type immediate (imm[20|10:1|11|19:12] in bits 31:12) of
/// the instruction at `addr`.
unsafe fn patch_j_imm(addr: Addr, disp: i32) {
    let v = disp as u32;
    let insn = read_u32_at(addr) & 0x0000_0fff;
    let enc = (((v >> 20) & 1) << 31)
        | (((v >> 1) & 0x3ff) << 21)
        | (((v >> 11) & 1) << 20)
        | (((v >> 12) & 0xff) << 12);
    write_u32_at(addr, insn | enc);
}
