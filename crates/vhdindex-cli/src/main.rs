//! `vhd-index`: build or update a VHD chain's sector index, or print a
//! summary of an existing one.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::info;
use vhdindex_core::{Error, Result};
use vhdindex_store::{BatFile, FileTable, IndexFile};

/// Build/update a VHD differencing chain's index, or summarize one already built.
#[derive(Parser, Debug)]
#[command(name = "vhd-index")]
struct Cli {
    /// Build or update the index rooted at <INDEX> (requires -v).
    #[arg(short = 'i', value_name = "INDEX", conflicts_with = "summary")]
    index: Option<PathBuf>,

    /// VHD whose ancestor chain to index, or to report on with -s.
    #[arg(short = 'v', value_name = "VHD")]
    vhd: Option<PathBuf>,

    /// Summarize the index rooted at <INDEX> (requires -i to be absent).
    #[arg(short = 's', value_name = "INDEX")]
    summary: Option<PathBuf>,

    /// With -s and -v, print only this block's entries.
    #[arg(short = 'b', value_name = "BLOCK")]
    block: Option<u32>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match (cli.index, cli.summary) {
        (Some(_), Some(_)) => Err(Error::invalid_argument("-i and -s are mutually exclusive")),
        (None, None) => Err(Error::invalid_argument("one of -i or -s is required")),
        (Some(index_base), None) => {
            let vhd = cli.vhd.ok_or_else(|| Error::invalid_argument("-i requires -v"))?;
            if cli.block.is_some() {
                return Err(Error::invalid_argument("-b is only valid with -s"));
            }
            info!(index = %index_base.display(), vhd = %vhd.display(), "building index");
            vhdindex_builder::build(&index_base, &vhd)
        }
        (None, Some(index_base)) => {
            if cli.block.is_some() && cli.vhd.is_none() {
                return Err(Error::invalid_argument("-b requires -v"));
            }
            summarize(&index_base, cli.vhd.as_deref(), cli.block)
        }
    }
}

fn summarize(index_base: &std::path::Path, vhd: Option<&std::path::Path>, block: Option<u32>) -> Result<()> {
    let (index_path, files_path) = vhdindex_builder::index_paths(index_base);

    let mut index_file = IndexFile::open(&index_path)?;
    let mut file_table = FileTable::open(&files_path)?;
    let entries = file_table.load()?;

    println!("VHD INDEX          : {}", index_path.display());
    println!("--------------------");
    println!("block size         : {}", index_file.block_size());
    println!("files              : {}", entries.len());
    println!();
    for entry in &entries {
        let uuid = uuid::Uuid::from_bytes(entry.vhd_uuid);
        let unix_secs = vhdindex_core::vhd_time_to_unix(entry.vhd_timestamp);
        let time = chrono::DateTime::from_timestamp(unix_secs, 0)
            .map(|t| t.to_rfc2822())
            .unwrap_or_else(|| "invalid timestamp".to_string());
        println!("        fid 0x{:04x} : {}, {}, {}", entry.file_id, entry.path, uuid.hyphenated(), time);
    }
    println!();

    let Some(vhd) = vhd else {
        return Ok(());
    };

    let bat_path = vhdindex_builder::bat_path_for(vhd);
    let mut bat = BatFile::load(&bat_path)?;

    println!("VHD INDEX BAT      : {}", bat_path.display());
    println!("--------------------");
    println!("blocks             : {}", bat.vhd_blocks());
    println!("block size         : {}", bat.vhd_block_size());
    println!("vhd path           : {}", bat.vhd_path());
    println!("index path         : {}", bat.index_path());
    println!("file table path    : {}", bat.file_table_path());
    println!();

    match block {
        None => {
            let entries = bat.load_entries()?;
            for (i, offset) in entries.iter().enumerate() {
                println!("      block 0x{i:04x} : offset 0x{offset:08x}");
            }
        }
        Some(block) => {
            if block as u64 > bat.vhd_blocks() {
                return Err(Error::invalid_argument(format!(
                    "block {block} past end of bat ({})",
                    bat.vhd_blocks()
                )));
            }

            let sector = bat.get(block as u64)?;
            if sector == 0 {
                println!("block {block} is unallocated");
                return Ok(());
            }

            let entries = index_file.read_block(sector)?;
            println!("BLOCK 0x{block:08x}");
            for (i, entry) in entries.iter().enumerate() {
                println!("        sec 0x{i:04x} : fid 0x{:04x}, offset 0x{:08x}", entry.file_id, entry.offset);
            }
        }
    }

    Ok(())
}
