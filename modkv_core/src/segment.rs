//! Named storage segments
//!
//! A segment is a single memory-mapped file holding the serialized hash
//! table behind a fixed-size header. Memory-mode segments live in the
//! system temp directory (tmpfs on Linux) and are unlinked when the owner
//! goes away; persistent segments live at a fixed path and survive
//! restarts. Both expose the same operations, so callers never see the
//! backing distinction.
//!
//! Layout:
//!
//! ```text
//! offset  size  field
//! ------  ----  -----
//!  0       8    magic "MKVSEG1\0"
//!  8       8    capacity (u64 LE, total segment bytes)
//! 16       8    used_bytes (u64 LE, accounted entry cost)
//! 24       8    entry_count (u64 LE)
//! 32       8    table_len (u64 LE, serialized table image length)
//! 40       -    bincode image of Vec<(i32, Vec<u8>)>
//! ```

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::{Result, StoreError};
use crate::mutex::SHARED_MUTEX_NAME;

/// Fixed location of the persistent data file.
pub const PERSISTENT_FILE_PATH: &str = "./kvstore_persistent.dat";

/// Default segment name for memory mode.
pub const DEFAULT_SEGMENT_NAME: &str = "modkv";

/// Accounted cost of an entry beyond its value bytes: the key plus a
/// conservative allowance for table bookkeeping.
pub const ENTRY_OVERHEAD: usize = 64;

/// Allocator overhead allowance applied by capacity checks.
pub const CAPACITY_FACTOR: usize = 2;

const MAGIC: [u8; 8] = *b"MKVSEG1\0";
const HEADER_LEN: usize = 40;
const MIN_CAPACITY: usize = 4096;

/// Which backing a segment uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentMode {
    /// Anonymous named segment, lost once the owner removes it
    Memory,
    /// Memory-mapped data file, flushed after every mutation
    Persistent,
}

/// Connection role for a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates the segment and destroys it on exit
    Owner,
    /// Opens an existing segment and leaves it intact on exit
    Attacher,
}

/// Parameters for opening a segment.
#[derive(Debug, Clone)]
pub struct SegmentConfig {
    /// Segment name; names the backing file and scopes cleanup
    pub name: String,
    pub mode: SegmentMode,
    /// Total segment size in bytes
    pub capacity: usize,
    /// Override for the backing file location (tests)
    pub path: Option<PathBuf>,
    /// Named mutex guarding the table
    pub mutex_name: String,
}

impl SegmentConfig {
    pub fn new(mode: SegmentMode, capacity: usize) -> Self {
        Self {
            name: DEFAULT_SEGMENT_NAME.to_string(),
            mode,
            capacity,
            path: None,
            mutex_name: SHARED_MUTEX_NAME.to_string(),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        // A test segment must not contend on the global mutex.
        self.mutex_name = format!("{name}-mutex");
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    fn resolve_path(&self) -> PathBuf {
        match (&self.path, self.mode) {
            (Some(p), _) => p.clone(),
            (None, SegmentMode::Memory) => {
                std::env::temp_dir().join(format!("{}.seg", self.name))
            }
            (None, SegmentMode::Persistent) => PathBuf::from(PERSISTENT_FILE_PATH),
        }
    }
}

/// One mapped segment. Table access goes through [`Segment::read_table`]
/// and [`Segment::write_table`]; the caller is responsible for holding
/// the named mutex around them.
pub struct Segment {
    map: MmapMut,
    capacity: usize,
    mode: SegmentMode,
    role: Role,
    path: PathBuf,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("role", &self.role)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Accounted byte cost of one entry.
pub fn entry_cost(value_len: usize) -> usize {
    value_len + std::mem::size_of::<i32>() + ENTRY_OVERHEAD
}

impl Segment {
    /// Creates the segment, removing whatever was there before.
    ///
    /// In persistent mode an existing valid data file is reopened with its
    /// entries intact; a file that fails validation is unlinked and
    /// recreated, with the recovery logged.
    pub fn open_owner(cfg: &SegmentConfig) -> Result<Self> {
        if cfg.capacity < MIN_CAPACITY {
            return Err(StoreError::Config(format!(
                "segment capacity {} below minimum {MIN_CAPACITY}",
                cfg.capacity
            )));
        }
        let path = cfg.resolve_path();

        match cfg.mode {
            SegmentMode::Memory => {
                if path.exists() {
                    tracing::info!(segment = %path.display(), "removing pre-existing memory segment");
                    std::fs::remove_file(&path)?;
                }
                Self::create(&path, cfg.mode, cfg.capacity)
            }
            SegmentMode::Persistent => {
                if path.exists() {
                    match Self::open_existing(&path, cfg.mode, Role::Owner) {
                        Ok(seg) => {
                            tracing::info!(
                                segment = %path.display(),
                                entries = seg.entry_count(),
                                "reopened persistent segment"
                            );
                            return Ok(seg);
                        }
                        Err(e) => {
                            tracing::warn!(
                                segment = %path.display(),
                                error = %e,
                                "persistent segment failed validation, recreating"
                            );
                            std::fs::remove_file(&path)?;
                        }
                    }
                }
                Self::create(&path, cfg.mode, cfg.capacity)
            }
        }
    }

    /// Opens an existing segment without taking ownership.
    ///
    /// A missing or unusable segment surfaces as `Unavailable`; the
    /// attacher never repairs anything.
    pub fn open_attacher(cfg: &SegmentConfig) -> Result<Self> {
        let path = cfg.resolve_path();
        if !path.exists() {
            return Err(StoreError::Unavailable(format!(
                "segment {} does not exist; is the server running?",
                path.display()
            )));
        }
        Self::open_existing(&path, cfg.mode, Role::Attacher).map_err(|e| match e {
            StoreError::Corrupt(msg) => StoreError::Unavailable(msg),
            other => other,
        })
    }

    fn create(path: &Path, mode: SegmentMode, capacity: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(capacity as u64)?;
        let map = unsafe { MmapMut::map_mut(&file)? };

        let mut seg = Self {
            map,
            capacity,
            mode,
            role: Role::Owner,
            path: path.to_path_buf(),
        };
        seg.write_table(&[])?;
        tracing::info!(
            segment = %path.display(),
            capacity,
            mode = ?mode,
            "created segment"
        );
        Ok(seg)
    }

    fn open_existing(path: &Path, mode: SegmentMode, role: Role) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len < HEADER_LEN {
            return Err(StoreError::Corrupt(format!(
                "segment {} is shorter than its header",
                path.display()
            )));
        }
        let map = unsafe { MmapMut::map_mut(&file)? };
        if map[..8] != MAGIC {
            return Err(StoreError::Corrupt(format!(
                "segment {} has no valid magic",
                path.display()
            )));
        }

        let seg = Self {
            map,
            capacity: len,
            mode,
            role,
            path: path.to_path_buf(),
        };
        // The table must deserialize; anything else means a torn write or
        // a foreign file.
        seg.read_table()?;
        Ok(seg)
    }

    /// Deserializes the current table image.
    pub fn read_table(&self) -> Result<Vec<(i32, Vec<u8>)>> {
        let table_len = self.header_u64(32) as usize;
        if HEADER_LEN + table_len > self.capacity {
            return Err(StoreError::Corrupt(format!(
                "table image of {} bytes exceeds segment capacity",
                table_len
            )));
        }
        bincode::deserialize(&self.map[HEADER_LEN..HEADER_LEN + table_len])
            .map_err(|e| StoreError::Corrupt(format!("table image does not deserialize: {e}")))
    }

    /// Serializes `table` into the segment and refreshes the header.
    ///
    /// Fails with `OutOfCapacity` before touching the mapping when the
    /// image no longer fits, so a failed write leaves the segment as it
    /// was. Persistent segments are flushed before returning.
    pub fn write_table(&mut self, table: &[(i32, Vec<u8>)]) -> Result<()> {
        let image = bincode::serialize(&table)
            .map_err(|e| StoreError::Corrupt(format!("table serialization failed: {e}")))?;
        if HEADER_LEN + image.len() > self.capacity {
            return Err(StoreError::OutOfCapacity {
                needed: HEADER_LEN + image.len(),
                free: self.capacity,
            });
        }

        let used: usize = table.iter().map(|(_, v)| entry_cost(v.len())).sum();

        self.map[..8].copy_from_slice(&MAGIC);
        self.set_header_u64(8, self.capacity as u64);
        self.set_header_u64(16, used as u64);
        self.set_header_u64(24, table.len() as u64);
        self.set_header_u64(32, image.len() as u64);
        self.map[HEADER_LEN..HEADER_LEN + image.len()].copy_from_slice(&image);

        if self.mode == SegmentMode::Persistent {
            self.map.flush()?;
        }
        Ok(())
    }

    /// Bytes free in the segment under the accounting model.
    pub fn free_bytes(&self) -> usize {
        self.capacity.saturating_sub(self.used_bytes())
    }

    /// Accounted bytes in use.
    pub fn used_bytes(&self) -> usize {
        self.header_u64(16) as usize
    }

    pub fn entry_count(&self) -> usize {
        self.header_u64(24) as usize
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn mode(&self) -> SegmentMode {
        self.mode
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Conservative capacity check: twice the requested bytes must be
    /// free to absorb allocator overhead.
    pub fn has_capacity(&self, needed: usize) -> bool {
        self.free_bytes() >= CAPACITY_FACTOR * needed
    }

    /// Unlinks the backing file. Owner shutdown only.
    pub(crate) fn remove_backing_file(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(segment = %self.path.display(), error = %e, "failed to remove segment file");
        }
    }

    fn header_u64(&self, offset: usize) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.map[offset..offset + 8]);
        u64::from_le_bytes(buf)
    }

    fn set_header_u64(&mut self, offset: usize, value: u64) {
        self.map[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }
}
