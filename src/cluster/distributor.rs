//! The distributor: key placement, routing and rebalancing
//!
//! Owns the ordered membership and the key→node table. Every operation
//! resolves its target node with `key mod N` (inserts) or the recorded
//! mapping (reads, updates, deletes) and dispatches either straight into
//! the local store or through the connection cache to a remote provider.
//! Membership changes trigger the rebalance that keeps the placement
//! invariant: at rest, every mapped key lives on node `key mod N`.

use std::collections::HashMap;
use std::sync::Arc;

use modkv_core::{KvStore, Result, StoreError};

use crate::cluster::identity::{detect_local_node, IdentityOracle};
use crate::cluster::mapping::MappingFile;
use crate::cluster::NodeInfo;
use crate::rpc::connection::ConnectionCache;

/// Where an operation is dispatched.
enum Target<'a> {
    /// The partition lives in this address space; no network involved.
    Local(&'a KvStore),
    /// The partition lives on the node with this index.
    Remote(usize),
}

/// Routing and membership state for one process.
pub struct Distributor {
    members: Vec<NodeInfo>,
    key_to_node: HashMap<i32, usize>,
    local_node_id: Option<usize>,
    local_store: Option<Arc<KvStore>>,
    cache: ConnectionCache,
    mapping: MappingFile,
    oracle: Box<dyn IdentityOracle>,
}

impl Distributor {
    /// Builds an empty distributor; the key→node table is reloaded from
    /// the mapping file.
    pub fn new(
        oracle: Box<dyn IdentityOracle>,
        mapping: MappingFile,
        local_store: Option<Arc<KvStore>>,
    ) -> Self {
        let key_to_node = mapping.load();
        Self {
            members: Vec::new(),
            key_to_node,
            local_node_id: None,
            local_store,
            cache: ConnectionCache::new(),
            mapping,
            oracle,
        }
    }

    /// Installs the initial membership in one step: no rebalancing, one
    /// identity detection, remote slots pre-warmed.
    pub async fn join_all(&mut self, members: Vec<NodeInfo>) {
        self.members = members;
        self.cache.resize(self.members.len()).await;
        self.local_node_id = detect_local_node(&self.members, self.oracle.as_ref());
        for (i, node) in self.members.iter().enumerate() {
            if Some(i) != self.local_node_id {
                self.cache.prewarm(i, &node.endpoint, node.provider_id).await;
            }
        }
        tracing::info!(
            nodes = self.members.len(),
            local = ?self.local_node_id,
            "cluster membership initialized"
        );
    }

    /// Appends a node to the membership and rebalances the keyspace onto
    /// the grown cluster.
    pub async fn add_node(&mut self, endpoint: &str, provider_id: u16) -> Result<()> {
        let old_count = self.members.len();
        self.members.push(NodeInfo::new(endpoint, provider_id));
        let new_idx = self.members.len() - 1;
        self.cache.resize(self.members.len()).await;

        tracing::info!(node = new_idx, endpoint, "added node");

        if Some(new_idx) != self.local_node_id {
            self.cache.prewarm(new_idx, endpoint, provider_id).await;
        }
        if self.members.len() == 1 || self.local_node_id.is_none() {
            self.local_node_id = detect_local_node(&self.members, self.oracle.as_ref());
        }
        if old_count > 0 {
            self.rebalance(old_count).await?;
        }
        Ok(())
    }

    /// Removes a node, rescuing its keys onto the shrunk membership.
    pub async fn remove_node(&mut self, idx: usize) -> Result<()> {
        if idx >= self.members.len() {
            return Err(StoreError::Config(format!("invalid node index {idx}")));
        }
        tracing::info!(node = idx, endpoint = %self.members[idx].endpoint, "removing node");

        let keys_on_node: Vec<i32> = self
            .key_to_node
            .iter()
            .filter_map(|(k, v)| (*v == idx).then_some(*k))
            .collect();

        // Pull the values off the node while it is still reachable.
        let mut rescued = Vec::with_capacity(keys_on_node.len());
        for key in keys_on_node {
            match self.dispatch_fetch(idx, key).await {
                Ok(value) => rescued.push((key, value)),
                Err(e) => {
                    tracing::warn!(key, error = %e, "could not fetch key from node being removed")
                }
            }
        }

        let removing_local = self.local_node_id == Some(idx);
        self.members.remove(idx);
        self.cache.remove(idx).await;

        if removing_local {
            self.local_node_id = detect_local_node(&self.members, self.oracle.as_ref());
        } else if let Some(local) = self.local_node_id {
            if local > idx {
                self.local_node_id = Some(local - 1);
            }
        }

        // Keys that stay put shift down with the membership; rescued
        // keys are re-placed from scratch below.
        for node in self.key_to_node.values_mut() {
            if *node > idx {
                *node -= 1;
            }
        }
        for (key, _) in &rescued {
            self.key_to_node.remove(key);
        }

        if self.members.is_empty() {
            if !rescued.is_empty() {
                tracing::warn!(count = rescued.len(), "no nodes remain, dropping rescued keys");
            }
        } else {
            for (key, value) in rescued {
                let new_idx = self.route(key)?;
                match self.place_value(new_idx, key, &value).await {
                    Ok(()) => {
                        self.key_to_node.insert(key, new_idx);
                        tracing::info!(key, node = new_idx, "redistributed key");
                    }
                    Err(e) => tracing::warn!(key, error = %e, "failed to redistribute key"),
                }
            }
        }

        self.rewrite_mapping()
    }

    /// Stores a new key-value pair on node `key mod N`.
    pub async fn insert(&mut self, key: i32, value: &[u8]) -> Result<()> {
        if self.members.is_empty() {
            return Err(StoreError::Unavailable(
                "no nodes available to store data".to_string(),
            ));
        }
        if let Some(&node) = self.key_to_node.get(&key) {
            tracing::warn!(key, node, "insert rejected: key already assigned");
            return Err(StoreError::AlreadyExists(key));
        }

        let idx = self.route(key)?;
        tracing::debug!(key, node = idx, "key hashes to node");
        self.dispatch_insert(idx, key, value).await?;

        // Record the placement only once the store accepted the entry,
        // so a crash cannot leave a mapping line for a value that was
        // never written.
        self.key_to_node.insert(key, idx);
        self.mapping.append(key, &self.members[idx].endpoint, idx)?;
        tracing::info!(key, node = idx, "stored key");
        Ok(())
    }

    /// Replaces the value of a known key on its recorded node.
    pub async fn update(&self, key: i32, value: &[u8]) -> Result<()> {
        let idx = *self
            .key_to_node
            .get(&key)
            .ok_or(StoreError::NotFound(key))?;
        self.dispatch_update(idx, key, value).await?;
        tracing::info!(key, node = idx, "updated key");
        Ok(())
    }

    /// Removes a known key from its recorded node.
    pub async fn delete(&mut self, key: i32) -> Result<()> {
        let idx = *self
            .key_to_node
            .get(&key)
            .ok_or(StoreError::NotFound(key))?;
        self.dispatch_delete(idx, key).await?;
        self.key_to_node.remove(&key);
        self.rewrite_mapping()?;
        tracing::info!(key, node = idx, "deleted key");
        Ok(())
    }

    /// Fetches the value of a known key from its recorded node.
    pub async fn get(&self, key: i32) -> Result<Vec<u8>> {
        let idx = *self
            .key_to_node
            .get(&key)
            .ok_or(StoreError::NotFound(key))?;
        tracing::debug!(key, node = idx, local = self.is_local(idx), "routing get");
        self.dispatch_fetch(idx, key).await
    }

    /// `key mod N` placement over the current membership.
    pub fn route(&self, key: i32) -> Result<usize> {
        if self.members.is_empty() {
            return Err(StoreError::Unavailable(
                "no nodes available in the cluster".to_string(),
            ));
        }
        Ok(key.rem_euclid(self.members.len() as i32) as usize)
    }

    pub fn node_count(&self) -> usize {
        self.members.len()
    }

    pub fn local_node_id(&self) -> Option<usize> {
        self.local_node_id
    }

    pub fn mapped_keys(&self) -> usize {
        self.key_to_node.len()
    }

    /// Membership with local markers, for the shell's `listnodes`.
    pub fn list_nodes(&self) -> Vec<(usize, NodeInfo, bool)> {
        self.members
            .iter()
            .enumerate()
            .map(|(i, node)| (i, node.clone(), Some(i) == self.local_node_id))
            .collect()
    }

    /// Keys per node, for the shell's `distribution`.
    pub fn key_distribution(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.members.len()];
        for node in self.key_to_node.values() {
            if let Some(slot) = counts.get_mut(*node) {
                *slot += 1;
            }
        }
        counts
    }

    /// Recorded owner of a key, if any.
    pub fn node_of(&self, key: i32) -> Option<usize> {
        self.key_to_node.get(&key).copied()
    }

    fn is_local(&self, idx: usize) -> bool {
        self.local_node_id == Some(idx) && self.local_store.is_some()
    }

    fn target(&self, idx: usize) -> Target<'_> {
        match &self.local_store {
            Some(store) if self.local_node_id == Some(idx) => Target::Local(store),
            _ => Target::Remote(idx),
        }
    }

    /// Moves every key whose `key mod N` changed when the membership
    /// grew. The per-key order is strictly fetch, insert, delete, so an
    /// interruption leaves the value retrievable from one of the two
    /// nodes and the mapping file stays authoritative.
    async fn rebalance(&mut self, old_count: usize) -> Result<()> {
        if self.members.len() <= old_count {
            tracing::debug!("no rebalancing needed, node count has not increased");
            return Ok(());
        }

        let moves: Vec<(i32, usize, usize)> = self
            .key_to_node
            .iter()
            .filter_map(|(&key, &old_idx)| {
                let new_idx = key.rem_euclid(self.members.len() as i32) as usize;
                (new_idx != old_idx).then_some((key, old_idx, new_idx))
            })
            .collect();

        tracing::info!(moves = moves.len(), "starting key rebalancing");
        let mut moved = 0usize;
        for (key, old_idx, new_idx) in moves {
            let value = match self.dispatch_fetch(old_idx, key).await {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(key, node = old_idx, error = %e, "could not fetch key for rebalancing, leaving in place");
                    continue;
                }
            };
            if let Err(e) = self.place_value(new_idx, key, &value).await {
                tracing::warn!(key, node = new_idx, error = %e, "could not move key to new node");
                continue;
            }
            // The new copy is live; a leftover on the old node is merely
            // unreachable.
            self.key_to_node.insert(key, new_idx);
            moved += 1;
            if let Err(e) = self.dispatch_delete(old_idx, key).await {
                tracing::warn!(key, node = old_idx, error = %e, "could not delete key from old node");
            }
        }

        self.rewrite_mapping()?;
        tracing::info!(moved, "rebalancing complete");
        Ok(())
    }

    /// Insert-or-overwrite used while moving keys; a stale copy on the
    /// target node is overwritten rather than treated as a conflict.
    async fn place_value(&self, idx: usize, key: i32, value: &[u8]) -> Result<()> {
        match self.dispatch_insert(idx, key, value).await {
            Ok(()) => Ok(()),
            Err(StoreError::Transport(e)) => Err(StoreError::Transport(e)),
            Err(_) => self.dispatch_update(idx, key, value).await,
        }
    }

    fn rewrite_mapping(&self) -> Result<()> {
        let mut entries: Vec<(i32, &str, usize)> = self
            .key_to_node
            .iter()
            .filter_map(|(&key, &node)| {
                self.members
                    .get(node)
                    .map(|info| (key, info.endpoint.as_str(), node))
            })
            .collect();
        entries.sort_unstable_by_key(|(key, _, _)| *key);
        self.mapping.rewrite(entries)
    }

    async fn dispatch_fetch(&self, idx: usize, key: i32) -> Result<Vec<u8>> {
        match self.target(idx) {
            Target::Local(store) => store.find(key),
            Target::Remote(idx) => {
                let client = self.remote(idx).await?;
                let mut client = client.lock().await;
                self.note_failure(idx, client.fetch(key).await).await
            }
        }
    }

    async fn dispatch_insert(&self, idx: usize, key: i32, value: &[u8]) -> Result<()> {
        match self.target(idx) {
            Target::Local(store) => store.insert(key, value),
            Target::Remote(idx) => {
                let client = self.remote(idx).await?;
                let mut client = client.lock().await;
                self.note_failure(idx, client.insert(key, value).await).await
            }
        }
    }

    async fn dispatch_update(&self, idx: usize, key: i32, value: &[u8]) -> Result<()> {
        match self.target(idx) {
            Target::Local(store) => store.update(key, value),
            Target::Remote(idx) => {
                let client = self.remote(idx).await?;
                let mut client = client.lock().await;
                self.note_failure(idx, client.update(key, value).await).await
            }
        }
    }

    async fn dispatch_delete(&self, idx: usize, key: i32) -> Result<()> {
        match self.target(idx) {
            Target::Local(store) => store.delete(key),
            Target::Remote(idx) => {
                let client = self.remote(idx).await?;
                let mut client = client.lock().await;
                self.note_failure(idx, client.delete(key).await).await
            }
        }
    }

    async fn remote(&self, idx: usize) -> Result<crate::rpc::connection::SharedClient> {
        let node = self
            .members
            .get(idx)
            .ok_or_else(|| StoreError::Config(format!("invalid node index {idx}")))?;
        self.cache.get(idx, &node.endpoint, node.provider_id).await
    }

    /// Invalidates the cache slot on connection-level failures so the
    /// next call reconnects.
    async fn note_failure<T>(&self, idx: usize, result: Result<T>) -> Result<T> {
        if let Err(StoreError::Transport(_)) = &result {
            tracing::warn!(node = idx, "rpc failed, invalidating connection");
            self.cache.invalidate(idx).await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::identity::FixedIdentity;

    fn empty_distributor(dir: &tempfile::TempDir) -> Distributor {
        Distributor::new(
            Box::new(FixedIdentity::default()),
            MappingFile::new(dir.path().join("mappings.txt")),
            None,
        )
    }

    #[tokio::test]
    async fn test_route_is_mod_n() {
        let dir = tempfile::tempdir().unwrap();
        let mut d = empty_distributor(&dir);
        d.join_all(vec![
            NodeInfo::new("ofi+tcp://127.0.0.1:1", 1),
            NodeInfo::new("ofi+tcp://127.0.0.1:2", 1),
            NodeInfo::new("ofi+tcp://127.0.0.1:3", 1),
        ])
        .await;

        assert_eq!(d.route(0).unwrap(), 0);
        assert_eq!(d.route(4).unwrap(), 1);
        assert_eq!(d.route(5).unwrap(), 2);
        // Negative keys still land inside the membership.
        assert_eq!(d.route(-1).unwrap(), 2);
        assert!(d.route(i32::MIN).unwrap() < 3);
    }

    #[tokio::test]
    async fn test_route_without_nodes_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let d = empty_distributor(&dir);
        assert!(matches!(d.route(1), Err(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_get_unknown_key_is_not_found_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let mut d = empty_distributor(&dir);
        d.join_all(vec![NodeInfo::new("ofi+tcp://127.0.0.1:1", 1)])
            .await;
        assert!(matches!(d.get(99).await, Err(StoreError::NotFound(99))));
        assert!(matches!(
            d.update(99, b"v").await,
            Err(StoreError::NotFound(99))
        ));
        assert!(matches!(d.delete(99).await, Err(StoreError::NotFound(99))));
    }

    #[tokio::test]
    async fn test_insert_without_nodes_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let mut d = empty_distributor(&dir);
        assert!(matches!(
            d.insert(1, b"v").await,
            Err(StoreError::Unavailable(_))
        ));
    }
}
