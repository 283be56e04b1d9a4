//! Segment placement.
//!
//! `load` computes the virtual-address span of all `PT_LOAD` segments,
//! requests one contiguous backing region from the embedder's allocator,
//! copies file-backed bytes into it and zero-fills the `p_memsz - p_filesz`
//! tails. Relocation and MPU programming are separate steps chosen by the
//! embedder afterwards.

use std::io::{Read, Seek};

use crate::elf::{pf, pt, ElfFile, Segment};
use crate::error::ElfError;
use crate::Addr;

/// Memory handed out by the embedder's allocator.
///
/// `base` is the real host address of the region; 0 signals failure. The
/// cookie is opaque to the loader and travels into the [`Program`] handle so
/// the embedder can release the region later.
#[derive(Debug, Clone, Copy)]
pub struct Allocation {
    pub base: Addr,
    pub cookie: usize,
}

/// Embedder-provided memory allocator.
///
/// The loader asks once per image for the whole load span. The returned
/// region must be valid for reads and writes of `size` bytes, aligned to
/// `align`, for at least as long as the [`Program`] is in use; `vaddr` is
/// the address the image asked for, which the allocator is free to ignore.
pub trait Allocator {
    fn allocate(&mut self, vaddr: Addr, size: Addr, align: Addr) -> Option<Allocation>;
}

impl<F> Allocator for F
where
    F: FnMut(Addr, Addr, Addr) -> Option<Allocation>,
{
    fn allocate(&mut self, vaddr: Addr, size: Addr, align: Addr) -> Option<Allocation> {
        self(vaddr, size, align)
    }
}

/// Handle to a loaded program image.
#[derive(Debug, Clone)]
pub struct Program {
    /// Base virtual address the image asked for (min over `PT_LOAD`).
    pub vaddr_req: Addr,
    /// Base address the allocator actually provided.
    pub vaddr_real: Addr,
    /// Total size of the load span in bytes.
    pub size: Addr,
    /// Opaque allocator cookie; pass it back to release the region.
    pub cookie: usize,
    /// Entry point translated into host space.
    pub entry: Addr,
    /// Host address of the in-memory dynamic table, when present.
    pub dynamic: Option<Addr>,
}

impl Program {
    /// Load bias: the constant to add to a file-view address to obtain the
    /// host address it was placed at.
    pub fn offset(&self) -> Addr {
        self.vaddr_real.wrapping_sub(self.vaddr_req)
    }
}

/// Alignment floor used when segments do not ask for more.
const MIN_ALIGN: Addr = 32;

fn rwx(flags: u32) -> String {
    format!(
        "{}{}{}",
        if flags & pf::R != 0 { 'r' } else { '-' },
        if flags & pf::W != 0 { 'w' } else { '-' },
        if flags & pf::X != 0 { 'x' } else { '-' },
    )
}

impl<R: Read + Seek> ElfFile<R> {
    /// Place every `PT_LOAD` segment into memory obtained from `alloc`.
    ///
    /// The region's alignment is the largest `p_align` over the load
    /// segments, floored at 32 bytes. File bytes are copied at
    /// `p_vaddr + offset` and the remainder of each segment is zeroed.
    ///
    /// The image's `PT_DYNAMIC` segment, when present, is translated into
    /// host space and recorded in the handle; a dynamic segment outside the
    /// load span is logged but tolerated.
    pub fn load(&mut self, alloc: &mut impl Allocator) -> Result<Program, ElfError> {
        self.read_segments()?;

        let mut addr_min = Addr::MAX;
        let mut addr_max: Addr = 0;
        let mut align = MIN_ALIGN;
        for seg in self.segments.iter().filter(|s| s.p_type == pt::LOAD) {
            if seg.p_memsz < seg.p_filesz {
                return Err(ElfError::InvalidFormat(format!(
                    "segment at {:#x} has p_memsz < p_filesz",
                    seg.p_vaddr
                )));
            }
            addr_min = addr_min.min(seg.p_vaddr);
            addr_max = addr_max.max(seg.p_vaddr.wrapping_add(seg.p_memsz));
            align = align.max(seg.p_align);
        }
        if addr_min == Addr::MAX {
            return Err(ElfError::InvalidFormat(
                "image has no PT_LOAD segments".into(),
            ));
        }

        let size = addr_max - addr_min;
        let allocation = alloc
            .allocate(addr_min, size, align)
            .filter(|a| a.base != 0)
            .ok_or_else(|| {
                log::error!("unable to allocate {:#x} bytes for loading", size);
                ElfError::AllocationFailed {
                    size: size as usize,
                }
            })?;
        let offs = allocation.base.wrapping_sub(addr_min);

        let loadable: Vec<Segment> = self
            .segments
            .iter()
            .filter(|s| s.p_type == pt::LOAD)
            .cloned()
            .collect();
        for seg in &loadable {
            self.seek_to(seg.p_offset)?;
            let dst = seg.p_vaddr.wrapping_add(offs);
            // SAFETY: `dst..dst + p_memsz` lies inside the allocation, whose
            // contract guarantees validity for the whole load span.
            unsafe {
                let bytes =
                    core::slice::from_raw_parts_mut(dst as usize as *mut u8, seg.p_filesz as usize);
                self.read_into(bytes)?;
                core::ptr::write_bytes(
                    dst.wrapping_add(seg.p_filesz) as usize as *mut u8,
                    0,
                    (seg.p_memsz - seg.p_filesz) as usize,
                );
            }
            log::debug!(
                "segment: {:#x} bytes at {:#x} {}",
                seg.p_filesz,
                dst,
                rwx(seg.p_flags)
            );
        }

        let entry = self.header.e_entry.wrapping_add(offs);

        let mut dynamic = None;
        if let Some(seg) = self.segments.iter().find(|s| s.p_type == pt::DYNAMIC) {
            if seg.p_vaddr < addr_min || seg.p_vaddr.wrapping_add(seg.p_memsz) > addr_max {
                log::error!(
                    "dynamic segment {:#x}..{:#x} does not fall within loaded memory",
                    seg.p_vaddr,
                    seg.p_vaddr.wrapping_add(seg.p_memsz)
                );
            }
            dynamic = Some(seg.p_vaddr.wrapping_add(offs));
        }

        Ok(Program {
            vaddr_req: addr_min,
            vaddr_real: allocation.base,
            size,
            cookie: allocation.cookie,
            entry,
            dynamic,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ElfBuilder;
    use crate::elf::{machine, ElfOptions};
    use std::io::Cursor;

    /// Allocator backed by a plain heap buffer, poisoned with 0xaa so the
    /// zero-fill is observable.
    pub(crate) struct BufAllocator {
        buf: Vec<u8>,
        pub last_align: Addr,
    }

    impl BufAllocator {
        pub(crate) fn new() -> Self {
            Self {
                buf: Vec::new(),
                last_align: 0,
            }
        }
    }

    impl Allocator for BufAllocator {
        fn allocate(&mut self, _vaddr: Addr, size: Addr, align: Addr) -> Option<Allocation> {
            self.last_align = align;
            self.buf = vec![0xaa; size as usize + align as usize];
            let base = self.buf.as_ptr() as usize as Addr;
            let aligned = (base + align - 1) & !(align - 1);
            Some(Allocation {
                base: aligned,
                cookie: 7,
            })
        }
    }

    fn open(bytes: Vec<u8>) -> ElfFile<Cursor<Vec<u8>>> {
        ElfFile::open_with(Cursor::new(bytes), ElfOptions::any_machine()).unwrap()
    }

    #[test]
    fn placement_and_zero_fill() {
        let code: Vec<u8> = (1..=32u8).collect();
        let data = [0x11, 0x22, 0x33, 0x44];
        let mut b = ElfBuilder::new(machine::EM_RISCV);
        b.entry(0x1008);
        b.segment(".text", 0x1000, pf::R | pf::X, &code);
        b.segment_with_memsz(".data", 0x2000, pf::R | pf::W, &data, 20);

        let mut elf = open(b.build());
        let mut alloc = BufAllocator::new();
        let prog = elf.load(&mut alloc).unwrap();

        assert_eq!(prog.vaddr_req, 0x1000);
        assert_eq!(prog.size, 0x2000 + 20 - 0x1000);
        assert_eq!(prog.cookie, 7);
        // Entry keeps its distance from the load base.
        assert_eq!(
            prog.entry.wrapping_sub(prog.vaddr_real),
            0x1008 - prog.vaddr_req
        );

        let image = unsafe {
            core::slice::from_raw_parts(prog.vaddr_real as usize as *const u8, prog.size as usize)
        };
        assert_eq!(&image[0..32], &code[..]);
        assert_eq!(&image[0x1000..0x1004], &data[..]);
        // Tail of .data is zeroed, not allocator poison.
        assert_eq!(&image[0x1004..0x1014], &[0u8; 16][..]);
    }

    #[test]
    fn alignment_takes_segment_maximum() {
        let mut b = ElfBuilder::new(machine::EM_RISCV);
        b.segment_with_align(".text", 0x1000, pf::R | pf::X, &[0; 8], 0x1000);
        let mut elf = open(b.build());
        let mut alloc = BufAllocator::new();
        elf.load(&mut alloc).unwrap();
        assert_eq!(alloc.last_align, 0x1000);
    }

    #[test]
    fn alignment_floor_is_32() {
        let mut b = ElfBuilder::new(machine::EM_RISCV);
        b.segment_with_align(".text", 0x1000, pf::R | pf::X, &[0; 8], 4);
        let mut elf = open(b.build());
        let mut alloc = BufAllocator::new();
        elf.load(&mut alloc).unwrap();
        assert_eq!(alloc.last_align, 32);
    }

    #[test]
    fn allocation_failure_is_reported() {
        let mut b = ElfBuilder::new(machine::EM_RISCV);
        b.segment(".text", 0x1000, pf::R | pf::X, &[0; 8]);
        let mut elf = open(b.build());
        let mut failing = |_: Addr, _: Addr, _: Addr| -> Option<Allocation> { None };
        assert!(matches!(
            elf.load(&mut failing),
            Err(ElfError::AllocationFailed { .. })
        ));

        // A zero base is failure too.
        let mut b = ElfBuilder::new(machine::EM_RISCV);
        b.segment(".text", 0x1000, pf::R | pf::X, &[0; 8]);
        let mut elf = open(b.build());
        let mut zero = |_: Addr, _: Addr, _: Addr| -> Option<Allocation> {
            Some(Allocation { base: 0, cookie: 0 })
        };
        assert!(elf.load(&mut zero).is_err());
    }

    #[test]
    fn no_load_segments_is_an_error() {
        let b = ElfBuilder::new(machine::EM_RISCV);
        let mut elf = open(b.build());
        let mut alloc = BufAllocator::new();
        assert!(matches!(
            elf.load(&mut alloc),
            Err(ElfError::InvalidFormat(_))
        ));
    }

    #[test]
    fn dynamic_segment_is_translated() {
        let mut b = ElfBuilder::new(machine::EM_RISCV);
        b.segment(".text", 0x1000, pf::R | pf::X, &[0; 8]);
        b.needed("libfoo.so");
        let mut elf = open(b.build());
        elf.read_dynamic().unwrap();
        let mut alloc = BufAllocator::new();
        let prog = elf.load(&mut alloc).unwrap();

        let dyn_seg = elf
            .segments()
            .iter()
            .find(|s| s.p_type == pt::DYNAMIC)
            .unwrap();
        assert_eq!(
            prog.dynamic,
            Some(dyn_seg.p_vaddr.wrapping_add(prog.offset()))
        );
    }
}
