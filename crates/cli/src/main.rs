//! embelf CLI: inspect ELF images with the embelf reader.

mod logger;

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Serialize;

use embelf::elf::{pt, ElfHeader, Section, Segment, Symbol};
use embelf::{ElfError, ElfFile, ElfOptions};

/// embelf: embedded ELF loader tooling
#[derive(Parser)]
#[command(name = "embelf")]
#[command(version = "0.1.0")]
#[command(about = "Inspect ELF images with the embelf loader", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dump headers, sections and symbol tables
    Info {
        /// Path to the ELF image
        image: PathBuf,

        /// Emit JSON instead of the human-readable dump
        #[arg(long)]
        json: bool,
    },

    /// List DT_NEEDED dependencies
    Needed {
        /// Path to the ELF image
        image: PathBuf,
    },

    /// Look up a symbol by name
    Sym {
        /// Path to the ELF image
        image: PathBuf,

        /// Symbol name (exact match)
        name: String,

        /// Search the dynamic symbol table instead of .symtab
        #[arg(long)]
        dynamic: bool,
    },
}

// ── Info output ──────────────────────────────────────────────────────

#[derive(Serialize)]
struct InfoOutput<'a> {
    header: &'a ElfHeader,
    segments: &'a [Segment],
    sections: &'a [Section],
    symbols: &'a [Symbol],
    dyn_symbols: &'a [Symbol],
    needed: &'a [String],
}

fn open_image(path: &PathBuf) -> Result<ElfFile<BufReader<File>>, ElfError> {
    let file = File::open(path)?;
    // The CLI inspects images built for foreign targets; don't pin the
    // machine type to the host.
    ElfFile::open_with(BufReader::new(file), ElfOptions::any_machine())
}

fn info(path: &PathBuf, json: bool) -> Result<(), ElfError> {
    let mut elf = open_image(path)?;
    elf.read_all()?;
    // Static images have no PT_DYNAMIC; the dump then omits needed libs.
    if elf.segments().iter().any(|s| s.p_type == pt::DYNAMIC) {
        elf.read_needed()?;
    }

    if json {
        let out = InfoOutput {
            header: elf.header(),
            segments: elf.segments(),
            sections: elf.sections(),
            symbols: elf.symbols(),
            dyn_symbols: elf.dyn_symbols(),
            needed: elf.needed(),
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&out).expect("serializable output")
        );
    } else {
        elf.dump();
        if !elf.needed().is_empty() {
            log::info!("needed libraries:");
            for lib in elf.needed() {
                log::info!("  {}", lib);
            }
        }
    }
    Ok(())
}

fn needed(path: &PathBuf) -> Result<(), ElfError> {
    let mut elf = open_image(path)?;
    elf.read_dynamic()?;
    for lib in elf.needed() {
        println!("{}", lib);
    }
    Ok(())
}

fn sym(path: &PathBuf, name: &str, dynamic: bool) -> Result<bool, ElfError> {
    let mut elf = open_image(path)?;
    elf.read_all()?;
    let found = if dynamic {
        elf.find_dyn_symbol(name)
    } else {
        elf.find_symbol(name)
    };
    match found {
        Some(sym) => {
            println!("{:#018x} {:5} {}", sym.st_value, sym.st_size, sym.name);
            Ok(true)
        }
        None => {
            log::warn!("symbol `{}` not found", name);
            Ok(false)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logger::init(cli.verbose);

    let result = match &cli.command {
        Commands::Info { image, json } => info(image, *json).map(|_| true),
        Commands::Needed { image } => needed(image).map(|_| true),
        Commands::Sym {
            image,
            name,
            dynamic,
        } => sym(image, name, *dynamic),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
