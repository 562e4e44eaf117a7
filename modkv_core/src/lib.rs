pub mod config;
pub mod error;
pub mod mutex;
pub mod segment;
pub mod store;

pub use config::{parse_mem_size, ClusterConfig, DEFAULT_MEM_SIZE};
pub use error::{Result, StoreError};
pub use mutex::{NamedMutex, NamedMutexGuard, SHARED_MUTEX_NAME};
pub use segment::{
    entry_cost, Role, Segment, SegmentConfig, SegmentMode, DEFAULT_SEGMENT_NAME,
    PERSISTENT_FILE_PATH,
};
pub use store::{KvStore, MemoryStats};
