//! Pinned BPF map dumper
//!
//! Opens a map pinned in bpffs read-only and writes a snapshot of its
//! entries as JSON or text.
//!
//! ## Usage
//!
//! ```bash
//! # Dump a well-known map; sizes come from the built-in catalogue
//! sudo ./bpf-map-dump /sys/fs/bpf/netd_shared/map_netd_uid_owner_map
//!
//! # Any other map needs explicit sizes
//! sudo ./bpf-map-dump /sys/fs/bpf/my_map --key-size 8 --value-size 16 --format text
//!
//! # Write to a file instead of stdout
//! sudo ./bpf-map-dump /sys/fs/bpf/my_map -k 4 -s 4 --output dump.json
//! ```

use anyhow::{Context, Result};
use bpf_map_store::{
    dump::{dump_map, DumpExporter, ExporterType, JsonExporter, TextExporter},
    AccessMode, MapRegistry,
};
use clap::Parser;
use log::info;
use map_common::known_map;
use std::path::PathBuf;

/// Dump the contents of a pinned BPF map
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Pin path of the map
    path: String,

    /// Key size in bytes (defaults to the catalogued size for known maps)
    #[clap(short, long)]
    key_size: Option<u32>,

    /// Value size in bytes (defaults to the catalogued size for known maps)
    #[clap(short = 's', long)]
    value_size: Option<u32>,

    /// Output format (json, text)
    #[clap(short, long, default_value = "json")]
    format: String,

    /// Output file (stdout if omitted)
    #[clap(short, long)]
    output: Option<PathBuf>,

    /// Verbose logging
    #[clap(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    let export_format = match args.format.to_lowercase().as_str() {
        "json" => ExporterType::Json,
        "text" | "txt" => ExporterType::Text,
        _ => anyhow::bail!("Unsupported format: {}. Use json or text", args.format),
    };

    let known = known_map(&args.path);
    let key_size = args
        .key_size
        .or(known.map(|m| m.key_size))
        .with_context(|| format!("{} is not a known map; pass --key-size", args.path))?;
    let value_size = args
        .value_size
        .or(known.map(|m| m.value_size))
        .with_context(|| format!("{} is not a known map; pass --value-size", args.path))?;

    info!("Dumping {} (key {} bytes, value {} bytes)", args.path, key_size, value_size);

    let map = MapRegistry::system()
        .obtain(&args.path, AccessMode::ReadOnly, key_size, value_size)
        .with_context(|| format!("Failed to open {}", args.path))?;
    let dump = dump_map(map.as_ref())?;

    if dump.vanished > 0 {
        info!("{} entries were deleted while dumping", dump.vanished);
    }

    match export_format {
        ExporterType::Json => JsonExporter::new(args.output.clone(), true).export(&dump)?,
        ExporterType::Text => TextExporter::new(args.output.clone()).export(&dump)?,
    }

    match &args.output {
        Some(path) => info!("{} entries written to {:?}", dump.entries.len(), path),
        None => info!("{} entries", dump.entries.len()),
    }

    Ok(())
}
