use crate::config::Configuration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

const REPORT_MAGIC: &[u8; 8] = b"PMSARPT1";

/// Named numeric metrics collected by a stage or by the whole run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    values: BTreeMap<String, f64>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, key: impl Into<String>, value: impl Into<f64>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Merge another set of metrics; existing keys are overwritten.
    pub fn join(&mut self, other: &Statistics) {
        for (key, value) in &other.values {
            self.values.insert(key.clone(), *value);
        }
    }

    /// Entries in natural key order (`time.2` before `time.10`).
    pub fn entries(&self) -> Vec<(&str, f64)> {
        let mut entries: Vec<(&str, f64)> =
            self.values.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        entries.sort_by(|a, b| natord::compare(a.0, b.0));
        entries
    }

    /// One `key\tvalue` line per metric.
    pub fn to_tsv(&self) -> String {
        let mut output = String::new();
        for (key, value) in self.entries() {
            output.push_str(&format!("{}\t{}\n", key, value));
        }
        output
    }
}

/// Peak resident set size of the process in bytes.
pub fn peak_memory_bytes() -> u64 {
    // SAFETY: getrusage only writes into the zeroed struct we pass.
    let usage = unsafe {
        let mut usage: libc::rusage = std::mem::zeroed();
        if libc::getrusage(libc::RUSAGE_SELF, &mut usage) != 0 {
            return 0;
        }
        usage
    };
    let max_rss = usage.ru_maxrss.max(0) as u64;
    if cfg!(target_os = "macos") {
        max_rss
    } else {
        max_rss * 1024
    }
}

/// Configuration and metrics of one run, persisted in a binary file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub config: Configuration,
    pub stats: Statistics,
}

impl RunReport {
    pub fn save<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(REPORT_MAGIC)?;
        bincode::serde::encode_into_std_write(self, &mut writer, bincode::config::standard())
            .map_err(io::Error::other)?;
        writer.flush()?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path.as_ref())?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != REPORT_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Invalid magic bytes in {:?}", path.as_ref()),
            ));
        }

        bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard()).map_err(
            |e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Failed to load run report: {e}"),
                )
            },
        )
    }
}
