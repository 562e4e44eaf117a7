//! Per-node connection cache
//!
//! One slot per node index. A slot is a small state machine: empty until
//! first use, ready while fresh, invalid after a failure. Lookups refresh
//! a slot that is empty, invalid or unused for longer than
//! [`REFRESH_AFTER`]; otherwise they bump the last-used stamp and hand
//! back the existing connection. The cache mutex only covers slot
//! bookkeeping; connections are established with the lock released.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use modkv_core::{Result, StoreError};

use crate::rpc::client::KvClient;

/// Connections unused for this long are re-established on next use.
pub const REFRESH_AFTER: Duration = Duration::from_secs(30);

/// Shared handle to one live connection.
pub type SharedClient = Arc<Mutex<KvClient>>;

#[derive(Debug, Default)]
enum Slot {
    #[default]
    Empty,
    Ready {
        client: SharedClient,
        last_used: Instant,
    },
    Invalid,
}

impl Slot {
    /// Refresh policy: a pure function of the slot state and wall-clock
    /// age.
    fn needs_refresh(&self, now: Instant, refresh_after: Duration) -> bool {
        match self {
            Slot::Empty | Slot::Invalid => true,
            Slot::Ready { last_used, .. } => past_window(*last_used, now, refresh_after),
        }
    }
}

fn past_window(last_used: Instant, now: Instant, refresh_after: Duration) -> bool {
    now.duration_since(last_used) > refresh_after
}

/// Cache of provider connections, one slot per node index.
#[derive(Debug)]
pub struct ConnectionCache {
    slots: Mutex<Vec<Slot>>,
    refresh_after: Duration,
    reconnects: AtomicU64,
}

impl Default for ConnectionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionCache {
    pub fn new() -> Self {
        Self::with_refresh_after(REFRESH_AFTER)
    }

    /// Overrides the freshness window; used by tests to observe the
    /// refresh behavior without waiting 30 seconds.
    pub fn with_refresh_after(refresh_after: Duration) -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            refresh_after,
            reconnects: AtomicU64::new(0),
        }
    }

    /// Grows or shrinks the slot vector to the membership size.
    pub async fn resize(&self, len: usize) {
        let mut slots = self.slots.lock().await;
        slots.resize_with(len, Slot::default);
    }

    /// Drops the slot for a removed node, shifting the ones above it.
    pub async fn remove(&self, idx: usize) {
        let mut slots = self.slots.lock().await;
        if idx < slots.len() {
            slots.remove(idx);
        }
    }

    /// Pre-establishes a connection when a node joins. A failure leaves
    /// the slot invalid and is only logged; the next use retries.
    pub async fn prewarm(&self, idx: usize, endpoint: &str, provider_id: u16) {
        match self.reconnect(idx, endpoint, provider_id).await {
            Ok(_) => tracing::info!(node = idx, endpoint, "pre-established connection"),
            Err(e) => {
                tracing::warn!(node = idx, endpoint, error = %e, "failed to pre-establish connection")
            }
        }
    }

    /// Returns a live connection for the node, reconnecting when the
    /// slot is empty, invalid or past its freshness window.
    pub async fn get(&self, idx: usize, endpoint: &str, provider_id: u16) -> Result<SharedClient> {
        let now = Instant::now();
        {
            let mut slots = self.slots.lock().await;
            if slots.len() <= idx {
                slots.resize_with(idx + 1, Slot::default);
            }
            if !slots[idx].needs_refresh(now, self.refresh_after) {
                if let Slot::Ready { client, last_used } = &mut slots[idx] {
                    *last_used = now;
                    return Ok(Arc::clone(client));
                }
            }
        }
        self.reconnect(idx, endpoint, provider_id).await
    }

    /// Marks the slot invalid after an RPC failure, forcing the next
    /// call to reconnect.
    pub async fn invalidate(&self, idx: usize) {
        let mut slots = self.slots.lock().await;
        if idx < slots.len() {
            slots[idx] = Slot::Invalid;
        }
    }

    /// Number of connections established so far.
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    async fn reconnect(&self, idx: usize, endpoint: &str, provider_id: u16) -> Result<SharedClient> {
        // Connect with the cache unlocked; slow peers must not block
        // lookups for other nodes.
        let client = match KvClient::connect(endpoint, provider_id).await {
            Ok(c) => c,
            Err(e) => {
                self.invalidate(idx).await;
                return Err(StoreError::Unavailable(format!(
                    "failed to establish connection to node {idx}: {e}"
                )));
            }
        };
        let shared = Arc::new(Mutex::new(client));
        let mut slots = self.slots.lock().await;
        if slots.len() <= idx {
            slots.resize_with(idx + 1, Slot::default);
        }
        slots[idx] = Slot::Ready {
            client: Arc::clone(&shared),
            last_used: Instant::now(),
        };
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        Ok(shared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_policy() {
        let now = Instant::now();
        let window = Duration::from_secs(30);

        assert!(Slot::Empty.needs_refresh(now, window));
        assert!(Slot::Invalid.needs_refresh(now, window));

        // A ready slot refreshes only once its age crosses the window.
        assert!(!past_window(now, now + Duration::from_secs(29), window));
        assert!(!past_window(now, now + Duration::from_secs(30), window));
        assert!(past_window(now, now + Duration::from_secs(31), window));
    }
}
