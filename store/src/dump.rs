//! Map snapshots and exporters
//!
//! A [`MapDump`] is a point-in-time copy of a map's raw entries, hex
//! encoded so any geometry can be serialized. Exporters write a dump as
//! JSON or as one `key value` line per entry.

use crate::{error::Result as MapResult, kernel::KernelMap};
use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{self, Write},
    path::PathBuf,
};

/// One key/value pair, hex encoded
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DumpEntry {
    pub key: String,
    pub value: String,
}

/// Snapshot of a map
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MapDump {
    /// RFC 3339 timestamp of the snapshot
    pub timestamp: String,
    pub path: String,
    pub key_size: usize,
    pub value_size: usize,
    pub entries: Vec<DumpEntry>,
    /// Keys deleted between being listed and being read
    pub vanished: usize,
}

/// Walk every key of `map` and copy its value
///
/// Keys removed by another writer while the walk is in progress are
/// counted in `vanished` rather than failing the dump.
pub fn dump_map(map: &dyn KernelMap) -> MapResult<MapDump> {
    let mut entries = Vec::new();
    let mut vanished = 0;

    let mut cursor = map.next_key(None)?;
    while let Some(key) = cursor {
        let value = map.lookup(&key)?;
        cursor = map.next_key(Some(&key))?;
        match value {
            Some(value) => entries.push(DumpEntry {
                key: hex::encode(&key),
                value: hex::encode(value),
            }),
            None => vanished += 1,
        }
    }
    debug!(
        "dumped {} entries from {} ({} vanished)",
        entries.len(),
        map.path(),
        vanished
    );

    Ok(MapDump {
        timestamp: chrono::Utc::now().to_rfc3339(),
        path: map.path().to_string(),
        key_size: map.key_size(),
        value_size: map.value_size(),
        entries,
        vanished,
    })
}

/// Trait for dump exporters
pub trait DumpExporter {
    /// Export a dump
    ///
    /// # Arguments
    ///
    /// * `dump` - Snapshot to write
    ///
    /// # Returns
    ///
    /// Result indicating success or failure
    fn export(&self, dump: &MapDump) -> Result<()>;
}

/// Export format type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExporterType {
    /// JSON document
    Json,
    /// One `key value` line per entry
    Text,
}

/// Open the output file, or stdout when there is none
fn open_output(output_path: Option<&PathBuf>) -> Result<Box<dyn Write>> {
    match output_path {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create output file: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(io::stdout().lock())),
    }
}

/// JSON exporter
pub struct JsonExporter {
    output_path: Option<PathBuf>,
    pretty: bool,
}

impl JsonExporter {
    /// Create a new JSON exporter
    ///
    /// # Arguments
    ///
    /// * `output_path` - Path to output file, stdout if `None`
    /// * `pretty` - Enable pretty-printing
    pub fn new(output_path: Option<PathBuf>, pretty: bool) -> Self {
        Self {
            output_path,
            pretty,
        }
    }
}

impl DumpExporter for JsonExporter {
    fn export(&self, dump: &MapDump) -> Result<()> {
        let json = if self.pretty {
            serde_json::to_string_pretty(dump)?
        } else {
            serde_json::to_string(dump)?
        };

        let mut out = open_output(self.output_path.as_ref())?;
        writeln!(out, "{}", json)
            .with_context(|| format!("Failed to write dump of {}", dump.path))?;
        Ok(())
    }
}

/// Plain text exporter, one `key value` line per entry
pub struct TextExporter {
    output_path: Option<PathBuf>,
}

impl TextExporter {
    /// Create a new text exporter
    ///
    /// # Arguments
    ///
    /// * `output_path` - Path to output file, stdout if `None`
    pub fn new(output_path: Option<PathBuf>) -> Self {
        Self { output_path }
    }

    fn to_text_format(dump: &MapDump) -> String {
        let mut output = format!(
            "# {} key_size={} value_size={} entries={} vanished={} at {}\n",
            dump.path,
            dump.key_size,
            dump.value_size,
            dump.entries.len(),
            dump.vanished,
            dump.timestamp
        );
        for entry in &dump.entries {
            output.push_str(&format!("{} {}\n", entry.key, entry.value));
        }
        output
    }
}

impl DumpExporter for TextExporter {
    fn export(&self, dump: &MapDump) -> Result<()> {
        let mut out = open_output(self.output_path.as_ref())?;
        out.write_all(Self::to_text_format(dump).as_bytes())
            .with_context(|| format!("Failed to write dump of {}", dump.path))?;
        Ok(())
    }
}
