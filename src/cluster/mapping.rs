//! Key→node mapping persistence
//!
//! A line-oriented text file, `<key> <endpoint> <node_id>` per line.
//! Inserts append a single line after the store accepted the entry;
//! rebalances and removals rewrite the file whole. The loader treats a
//! missing or unreadable file as an empty map and skips malformed lines,
//! letting later duplicates win. The distributor is the only writer
//! within a process.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use modkv_core::Result;

/// Default location of the mapping file.
pub const MAPPING_FILE_PATH: &str = "./mappings.txt";

/// Handle to the mapping file.
#[derive(Debug, Clone)]
pub struct MappingFile {
    path: PathBuf,
}

impl Default for MappingFile {
    fn default() -> Self {
        Self::new(MAPPING_FILE_PATH)
    }
}

impl MappingFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the key→node map. Missing file means a fresh start; a line
    /// that does not parse is skipped with a warning.
    pub fn load(&self) -> HashMap<i32, usize> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => {
                tracing::info!(path = %self.path.display(), "no existing mapping file, starting fresh");
                return HashMap::new();
            }
        };

        let mut map = HashMap::new();
        for (lineno, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let parsed = (
                parts.next().and_then(|s| s.parse::<i32>().ok()),
                parts.next(),
                parts.next().and_then(|s| s.parse::<usize>().ok()),
            );
            match parsed {
                (Some(key), Some(_endpoint), Some(node)) if parts.next().is_none() => {
                    map.insert(key, node);
                }
                _ => {
                    tracing::warn!(
                        path = %self.path.display(),
                        line = lineno + 1,
                        "skipping malformed mapping line"
                    );
                }
            }
        }
        tracing::info!(count = map.len(), "loaded key mappings from file");
        map
    }

    /// Appends one entry after a successful insert.
    pub fn append(&self, key: i32, endpoint: &str, node: usize) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{key} {endpoint} {node}")?;
        Ok(())
    }

    /// Replaces the file with the full map after a structural change.
    pub fn rewrite<'a, I>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (i32, &'a str, usize)>,
    {
        let mut file = std::fs::File::create(&self.path)?;
        let mut count = 0usize;
        for (key, endpoint, node) in entries {
            writeln!(file, "{key} {endpoint} {node}")?;
            count += 1;
        }
        tracing::info!(count, path = %self.path.display(), "rewrote mapping file");
        Ok(())
    }
}
