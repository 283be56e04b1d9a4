//! Benchmarks for ELF parsing and segment placement.
//!
//! Run with: cargo bench -p embelf --bench load_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::io::Cursor;

use embelf::builder::ElfBuilder;
use embelf::elf::{machine, pf};
use embelf::{Addr, Allocation, Allocator, ElfFile, ElfOptions};

struct BufAllocator {
    buf: Vec<u8>,
}

impl Allocator for BufAllocator {
    fn allocate(&mut self, _vaddr: Addr, size: Addr, align: Addr) -> Option<Allocation> {
        self.buf = vec![0; size as usize + align as usize];
        let base = self.buf.as_ptr() as usize as Addr;
        Some(Allocation {
            base: (base + align - 1) & !(align - 1),
            cookie: 0,
        })
    }
}

fn build_image(code_size: usize, symbols: usize) -> Vec<u8> {
    let code = vec![0x13u8; code_size]; // nop sled
    let mut b = ElfBuilder::new(machine::EM_RISCV);
    b.entry(0x1000);
    let text = b.segment(".text", 0x1000, pf::R | pf::X, &code);
    b.segment_with_memsz(
        ".data",
        0x1000 + code_size as Addr,
        pf::R | pf::W,
        &vec![0u8; 256],
        4096,
    );
    for i in 0..symbols {
        b.symbol(&format!("fn_{}", i), 0x1000 + (i as Addr) * 4, text);
    }
    b.build()
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("Parse");

    for symbols in [16usize, 256, 1024].iter() {
        let image = build_image(4096, *symbols);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}syms", symbols)),
            symbols,
            |b, _| {
                b.iter(|| {
                    let mut elf = ElfFile::open_with(
                        Cursor::new(image.clone()),
                        ElfOptions::any_machine(),
                    )
                    .unwrap();
                    elf.read_all().unwrap();
                    black_box(elf.symbols().len())
                })
            },
        );
    }

    group.finish();
}

fn bench_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("Load");

    for size in [4096usize, 65536, 1 << 20].iter() {
        let image = build_image(*size, 4);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}B", size)),
            size,
            |b, _| {
                b.iter(|| {
                    let mut elf = ElfFile::open_with(
                        Cursor::new(image.clone()),
                        ElfOptions::any_machine(),
                    )
                    .unwrap();
                    let mut alloc = BufAllocator { buf: Vec::new() };
                    let prog = elf.load(&mut alloc).unwrap();
                    black_box(prog.entry)
                })
            },
        );
    }

    group.finish();
}

fn bench_symbol_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("Lookup");

    let image = build_image(4096, 1024);
    let mut elf =
        ElfFile::open_with(Cursor::new(image), ElfOptions::any_machine()).unwrap();
    elf.read_all().unwrap();

    group.bench_function("find_symbol_last", |b| {
        b.iter(|| black_box(elf.find_symbol("fn_1023")))
    });

    group.finish();
}

criterion_group!(benches, bench_parse, bench_load, bench_symbol_lookup);
criterion_main!(benches);
