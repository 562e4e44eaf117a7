//! Cluster configuration
//!
//! The cluster is described by a JSON file listing the provider id, the
//! transport protocol, the node endpoints in index order, the segment size
//! in megabytes and optionally the endpoint that names the local host.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{Result, StoreError};

const KB: u64 = 1024;
const MB: u64 = 1024 * 1024;
const GB: u64 = 1024 * 1024 * 1024;

/// Fallback segment size when the size argument cannot be parsed.
pub const DEFAULT_MEM_SIZE: u64 = 100 * MB;

/// Cluster configuration, read once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Provider selector shared by all nodes
    pub provider_id: u16,
    /// Transport protocol prefix, e.g. `ofi+tcp`
    pub protocol: String,
    /// Number of nodes in the membership
    pub count_of_node: usize,
    /// Endpoint per node index, keyed by the decimal index
    pub ip_addresses: HashMap<String, String>,
    /// Segment size in megabytes
    pub size: u64,
    /// Authoritative local endpoint; the identity oracle is the fallback
    #[serde(default)]
    pub local_ip: Option<String>,
}

impl ClusterConfig {
    /// Loads the configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            StoreError::Config(format!("could not open config file {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| StoreError::Config(format!("malformed config {}: {e}", path.display())))
    }

    /// Returns the membership endpoints in node-index order.
    ///
    /// A missing index is a configuration error; the membership must be
    /// dense in `0..count_of_node`.
    pub fn endpoints(&self) -> Result<Vec<String>> {
        (0..self.count_of_node)
            .map(|i| {
                self.ip_addresses
                    .get(&i.to_string())
                    .cloned()
                    .ok_or_else(|| StoreError::Config(format!("missing endpoint for node {i}")))
            })
            .collect()
    }

    /// Segment size in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.size * MB
    }
}

/// Parses a memory size argument with an optional `K`/`M`/`G` suffix.
///
/// A bare number is megabytes. Unparseable input falls back to
/// [`DEFAULT_MEM_SIZE`] with a warning, matching the tolerant server
/// startup behavior.
pub fn parse_mem_size(arg: &str) -> u64 {
    let upper = arg.trim().to_ascii_uppercase();
    let (num_part, unit) = match upper.chars().last() {
        Some(c @ ('K' | 'M' | 'G')) => (&upper[..upper.len() - 1], c),
        _ => (upper.as_str(), 'M'),
    };

    match num_part.parse::<f64>() {
        Ok(n) if n > 0.0 => {
            let factor = match unit {
                'K' => KB,
                'G' => GB,
                _ => MB,
            };
            (n * factor as f64) as u64
        }
        _ => {
            tracing::warn!(arg, "could not parse memory size, using 100M");
            DEFAULT_MEM_SIZE
        }
    }
}
