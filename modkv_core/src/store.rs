//! The shared key-value store
//!
//! One [`KvStore`] per process wraps a [`Segment`] and the named mutex
//! guarding it. Every operation takes the mutex for its full duration,
//! so all processes attached to the same segment serialize their table
//! access. The owner cleans up the segment, the mapping file and any
//! per-node side files on drop; an attacher only detaches.

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::Mutex;

use crate::error::{Result, StoreError};
use crate::mutex::NamedMutex;
use crate::segment::{entry_cost, Role, Segment, SegmentConfig, SegmentMode};

/// Snapshot of the segment's capacity accounting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryStats {
    pub total: usize,
    pub used: usize,
    pub free: usize,
    pub usage_percent: f64,
}

/// Process-wide handle to the shared store.
#[derive(Debug)]
pub struct KvStore {
    segment: Mutex<Segment>,
    mutex: NamedMutex,
    role: Role,
    mode: SegmentMode,
    aux_dir: PathBuf,
}

impl KvStore {
    /// Creates the store as the segment owner.
    pub fn open_owner(cfg: &SegmentConfig) -> Result<Self> {
        let mutex = NamedMutex::create(&cfg.mutex_name);
        let segment = Segment::open_owner(cfg)?;
        Ok(Self::assemble(segment, mutex, Role::Owner, cfg))
    }

    /// Attaches to a segment some other process owns.
    pub fn open_attacher(cfg: &SegmentConfig) -> Result<Self> {
        let mutex = NamedMutex::open(&cfg.mutex_name);
        let segment = Segment::open_attacher(cfg)?;
        Ok(Self::assemble(segment, mutex, Role::Attacher, cfg))
    }

    fn assemble(segment: Segment, mutex: NamedMutex, role: Role, cfg: &SegmentConfig) -> Self {
        let aux_dir = match (&cfg.path, segment.path().parent()) {
            (Some(_), Some(parent)) => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mode = segment.mode();
        Self {
            segment: Mutex::new(segment),
            mutex,
            role,
            mode,
            aux_dir,
        }
    }

    /// Adds a new entry. Present keys are rejected, and an entry that
    /// does not fit leaves the store untouched.
    pub fn insert(&self, key: i32, value: &[u8]) -> Result<()> {
        let _lock = self.mutex.lock()?;
        let mut seg = self.segment.lock();
        let mut table = load_map(&seg)?;

        if table.contains_key(&key) {
            tracing::warn!(key, "insert rejected: key already exists");
            return Err(StoreError::AlreadyExists(key));
        }
        let needed = entry_cost(value.len());
        if !seg.has_capacity(needed) {
            let stats = stats_of(&seg);
            tracing::warn!(
                key,
                needed,
                free = stats.free,
                used = stats.used,
                total = stats.total,
                "insert rejected: not enough memory"
            );
            return Err(StoreError::OutOfCapacity {
                needed,
                free: stats.free,
            });
        }

        table.insert(key, value.to_vec());
        store_map(&mut seg, table)
    }

    /// Replaces the value of an existing key in place.
    pub fn update(&self, key: i32, value: &[u8]) -> Result<()> {
        let _lock = self.mutex.lock()?;
        let mut seg = self.segment.lock();
        let mut table = load_map(&seg)?;

        let old_len = match table.get(&key) {
            Some(old) => old.len(),
            None => return Err(StoreError::NotFound(key)),
        };
        let delta = value.len().saturating_sub(old_len);
        if delta > 0 && !seg.has_capacity(delta) {
            let stats = stats_of(&seg);
            tracing::warn!(
                key,
                needed = delta,
                free = stats.free,
                "update rejected: not enough memory for growth"
            );
            return Err(StoreError::OutOfCapacity {
                needed: delta,
                free: stats.free,
            });
        }

        table.insert(key, value.to_vec());
        store_map(&mut seg, table)
    }

    /// Removes an entry.
    pub fn delete(&self, key: i32) -> Result<()> {
        let _lock = self.mutex.lock()?;
        let mut seg = self.segment.lock();
        let mut table = load_map(&seg)?;

        if table.remove(&key).is_none() {
            return Err(StoreError::NotFound(key));
        }
        store_map(&mut seg, table)
    }

    /// Looks up the value for a key.
    pub fn find(&self, key: i32) -> Result<Vec<u8>> {
        let _lock = self.mutex.lock()?;
        let seg = self.segment.lock();
        let table = load_map(&seg)?;
        table.get(&key).cloned().ok_or(StoreError::NotFound(key))
    }

    /// Number of entries in the table.
    pub fn entry_count(&self) -> usize {
        self.segment.lock().entry_count()
    }

    /// Bytes free under the capacity accounting.
    pub fn free_bytes(&self) -> usize {
        self.segment.lock().free_bytes()
    }

    pub fn memory_stats(&self) -> MemoryStats {
        stats_of(&self.segment.lock())
    }

    pub fn mode(&self) -> SegmentMode {
        self.mode
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// All keys currently stored, sorted.
    pub fn list_keys(&self) -> Result<Vec<i32>> {
        let _lock = self.mutex.lock()?;
        let seg = self.segment.lock();
        let mut keys: Vec<i32> = load_map(&seg)?.into_keys().collect();
        keys.sort_unstable();
        Ok(keys)
    }
}

fn load_map(seg: &Segment) -> Result<HashMap<i32, Vec<u8>>> {
    Ok(seg.read_table()?.into_iter().collect())
}

fn store_map(seg: &mut Segment, table: HashMap<i32, Vec<u8>>) -> Result<()> {
    let mut entries: Vec<(i32, Vec<u8>)> = table.into_iter().collect();
    entries.sort_unstable_by_key(|(k, _)| *k);
    seg.write_table(&entries)
}

fn stats_of(seg: &Segment) -> MemoryStats {
    let total = seg.capacity();
    let used = seg.used_bytes();
    let free = seg.free_bytes();
    MemoryStats {
        total,
        used,
        free,
        usage_percent: if total > 0 {
            used as f64 / total as f64 * 100.0
        } else {
            0.0
        },
    }
}

impl Drop for KvStore {
    fn drop(&mut self) {
        if self.role == Role::Attacher {
            tracing::debug!("attacher disconnecting, leaving shared resources intact");
            return;
        }

        // Owner shutdown. A persistent data file survives for the next
        // run; everything else is removed.
        if self.mode == SegmentMode::Memory {
            let seg = self.segment.lock();
            seg.remove_backing_file();
            drop(seg);
            self.remove_aux_files();
        }
        self.mutex.remove();
        tracing::info!(mode = ?self.mode, "store owner shut down");
    }
}

impl KvStore {
    fn remove_aux_files(&self) {
        let mapping = self.aux_dir.join("mappings.txt");
        if mapping.exists() {
            if let Err(e) = std::fs::remove_file(&mapping) {
                tracing::warn!(path = %mapping.display(), error = %e, "failed to remove mapping file");
            }
        }

        let entries = match std::fs::read_dir(&self.aux_dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("local_store_node_") && name.ends_with(".dat") {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }
}
