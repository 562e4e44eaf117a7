//! Named cross-process mutex
//!
//! Mutual exclusion between every process attached to the same segment is
//! provided by an exclusively-created lock file in the system temp
//! directory. Acquisition blocks without bound; the guard releases the
//! lock on every exit path. Recovery after a crashed holder is the
//! owner's responsibility: [`NamedMutex::create`] removes a stale lock
//! file left behind by a previous process and logs the cleanup.

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use crate::error::Result;

/// Name of the mutex guarding the shared map, fixed across processes.
pub const SHARED_MUTEX_NAME: &str = "SharedMapMutex";

const RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// Handle to a named inter-process mutex.
#[derive(Debug)]
pub struct NamedMutex {
    path: PathBuf,
}

/// Held lock; dropping it releases the mutex.
#[derive(Debug)]
pub struct NamedMutexGuard {
    path: PathBuf,
}

fn lock_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{name}.lock"))
}

impl NamedMutex {
    /// Owner-side constructor: removes any stale lock file with the same
    /// name before handing out the handle.
    pub fn create(name: &str) -> Self {
        let path = lock_path(name);
        if path.exists() {
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::info!(mutex = name, "removed stale lock file from previous run"),
                Err(e) => tracing::warn!(mutex = name, error = %e, "could not remove stale lock file"),
            }
        }
        Self { path }
    }

    /// Attacher-side constructor: shares the lock file, never cleans up.
    pub fn open(name: &str) -> Self {
        Self { path: lock_path(name) }
    }

    /// Acquires the mutex, blocking until it is free.
    pub fn lock(&self) -> Result<NamedMutexGuard> {
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
            {
                Ok(_) => {
                    return Ok(NamedMutexGuard {
                        path: self.path.clone(),
                    })
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    thread::sleep(RETRY_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Removes the lock file itself. Owner shutdown only.
    pub fn remove(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Drop for NamedMutexGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release named mutex");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_lock_and_release() {
        let mutex = NamedMutex::create("modkv-test-lock-basic");
        {
            let _guard = mutex.lock().unwrap();
            assert!(lock_path("modkv-test-lock-basic").exists());
        }
        assert!(!lock_path("modkv-test-lock-basic").exists());
    }

    #[test]
    fn test_mutual_exclusion_between_threads() {
        let mutex = Arc::new(NamedMutex::create("modkv-test-lock-threads"));
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for _ in 0..4 {
            let mutex = Arc::clone(&mutex);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..25 {
                    let _guard = mutex.lock().unwrap();
                    let seen = counter.fetch_add(1, Ordering::SeqCst);
                    // Nobody else may enter while we hold the lock.
                    assert_eq!(counter.load(Ordering::SeqCst), seen + 1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_create_removes_stale_lock() {
        let path = lock_path("modkv-test-lock-stale");
        std::fs::write(&path, b"").unwrap();
        let mutex = NamedMutex::create("modkv-test-lock-stale");
        // A stale holder must not block a fresh owner.
        let _guard = mutex.lock().unwrap();
    }
}
