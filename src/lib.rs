//! modkv — a distributed key-value store
//!
//! Integer keys are partitioned across a static cluster of peer nodes by
//! `key mod N`. Each node runs a shared store exported through an RPC
//! provider; a client cooperating with a node reaches the whole keyspace
//! through one routed interface, short-circuiting to the local store when
//! the target partition lives in its own address space.

pub mod cluster;
pub mod rpc;

use std::sync::Arc;

use tokio::sync::Mutex;

use modkv_core::{ClusterConfig, KvStore, Result};

use cluster::distributor::Distributor;
use cluster::identity::{FixedIdentity, IdentityOracle, SystemIdentity};
use cluster::mapping::MappingFile;
use cluster::NodeInfo;

pub use cluster::{endpoint_addr, endpoint_host};
pub use rpc::{KvClient, KvProvider};

/// Top-level facade: the four operations plus membership management,
/// delegating everything to the [`Distributor`].
pub struct DistributedKv {
    inner: Mutex<Distributor>,
}

impl DistributedKv {
    /// Builds the facade from the cluster configuration. When the
    /// configuration names a `local_ip` it is the authoritative identity
    /// input; otherwise the system oracle probes for one.
    pub async fn from_config(cfg: &ClusterConfig, local_store: Option<Arc<KvStore>>) -> Result<Self> {
        let oracle: Box<dyn IdentityOracle> = match &cfg.local_ip {
            Some(endpoint) => Box::new(FixedIdentity::from_endpoint(endpoint)),
            None => Box::new(SystemIdentity),
        };
        let members: Vec<NodeInfo> = cfg
            .endpoints()?
            .into_iter()
            .map(|endpoint| NodeInfo::new(endpoint, cfg.provider_id))
            .collect();

        let mut distributor = Distributor::new(oracle, MappingFile::default(), local_store);
        distributor.join_all(members).await;
        Ok(Self {
            inner: Mutex::new(distributor),
        })
    }

    /// Wraps an already-assembled distributor.
    pub fn from_distributor(distributor: Distributor) -> Self {
        Self {
            inner: Mutex::new(distributor),
        }
    }

    pub async fn get(&self, key: i32) -> Result<Vec<u8>> {
        self.inner.lock().await.get(key).await
    }

    pub async fn insert(&self, key: i32, value: &[u8]) -> Result<()> {
        self.inner.lock().await.insert(key, value).await
    }

    pub async fn update(&self, key: i32, value: &[u8]) -> Result<()> {
        self.inner.lock().await.update(key, value).await
    }

    pub async fn delete(&self, key: i32) -> Result<()> {
        self.inner.lock().await.delete(key).await
    }

    pub async fn add_node(&self, endpoint: &str, provider_id: u16) -> Result<()> {
        self.inner.lock().await.add_node(endpoint, provider_id).await
    }

    pub async fn remove_node(&self, idx: usize) -> Result<()> {
        self.inner.lock().await.remove_node(idx).await
    }

    pub async fn node_count(&self) -> usize {
        self.inner.lock().await.node_count()
    }

    pub async fn local_node_id(&self) -> Option<usize> {
        self.inner.lock().await.local_node_id()
    }

    /// The node `key mod N` currently routes to.
    pub async fn route(&self, key: i32) -> Result<usize> {
        self.inner.lock().await.route(key)
    }

    pub async fn list_nodes(&self) -> Vec<(usize, NodeInfo, bool)> {
        self.inner.lock().await.list_nodes()
    }

    /// Keys per node alongside the membership, for display.
    pub async fn key_distribution(&self) -> Vec<(NodeInfo, usize)> {
        let inner = self.inner.lock().await;
        inner
            .list_nodes()
            .into_iter()
            .zip(inner.key_distribution())
            .map(|((_, node, _), count)| (node, count))
            .collect()
    }

    pub async fn mapped_keys(&self) -> usize {
        self.inner.lock().await.mapped_keys()
    }
}
