//! Remote handle to a provider
//!
//! A [`KvClient`] owns one TCP connection to a remote provider and issues
//! the four operations over it. The fetch sentinel and empty replies are
//! normalized to `NotFound` here, so callers only ever see error kinds.

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use modkv_core::{Result, StoreError};

use crate::cluster::endpoint_addr;
use crate::rpc::protocol::{ClientCodec, Method, Request, Response, FETCH_MISSING_SENTINEL};

/// Bound on establishing a TCP connection to a peer.
const CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Connected client for a single remote provider.
pub struct KvClient {
    framed: Framed<TcpStream, ClientCodec>,
    provider_id: u16,
    endpoint: String,
}

impl std::fmt::Debug for KvClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvClient")
            .field("endpoint", &self.endpoint)
            .field("provider_id", &self.provider_id)
            .finish()
    }
}

impl KvClient {
    /// Resolves the endpoint and establishes the connection.
    pub async fn connect(endpoint: &str, provider_id: u16) -> Result<Self> {
        let addr = endpoint_addr(endpoint).ok_or_else(|| {
            StoreError::Config(format!("endpoint {endpoint} is not scheme://host:port"))
        })?;
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| StoreError::Unavailable(format!("connection to {endpoint} timed out")))?
            .map_err(|e| StoreError::Unavailable(format!("cannot reach {endpoint}: {e}")))?;
        Ok(Self {
            framed: Framed::new(stream, ClientCodec),
            provider_id,
            endpoint: endpoint.to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn call(&mut self, method: Method, key: i32, value: Option<Vec<u8>>) -> Result<Response> {
        let req = Request {
            provider_id: self.provider_id,
            method,
            key,
            value,
        };
        self.framed
            .send(req)
            .await
            .map_err(|e| StoreError::Transport(format!("send to {} failed: {e}", self.endpoint)))?;
        match self.framed.next().await {
            Some(Ok(resp)) => Ok(resp),
            Some(Err(e)) => Err(StoreError::Transport(format!(
                "bad reply from {}: {e}",
                self.endpoint
            ))),
            None => Err(StoreError::Transport(format!(
                "{} closed the connection",
                self.endpoint
            ))),
        }
    }

    /// Fetches the value for a key. Both the wire sentinel and an empty
    /// reply normalize to `NotFound`.
    pub async fn fetch(&mut self, key: i32) -> Result<Vec<u8>> {
        match self.call(Method::Fetch, key, None).await? {
            Response::Value(v) if v == FETCH_MISSING_SENTINEL || v.is_empty() => {
                Err(StoreError::NotFound(key))
            }
            Response::Value(v) => Ok(v),
            Response::Status(_) => Err(StoreError::Transport(
                "unexpected status reply to fetch".to_string(),
            )),
            Response::Error(msg) => Err(StoreError::Unavailable(msg)),
        }
    }

    pub async fn insert(&mut self, key: i32, value: &[u8]) -> Result<()> {
        self.mutate(Method::Insert, key, value.to_vec()).await
    }

    pub async fn update(&mut self, key: i32, value: &[u8]) -> Result<()> {
        self.mutate(Method::Update, key, value.to_vec()).await
    }

    pub async fn delete(&mut self, key: i32) -> Result<()> {
        self.expect_status(Method::Delete, key, None).await
    }

    async fn mutate(&mut self, method: Method, key: i32, value: Vec<u8>) -> Result<()> {
        self.expect_status(method, key, Some(value)).await
    }

    // `Transport` is reserved for connection-level failures so the
    // caller knows when to invalidate its cache slot; a status-0
    // rejection arrived over a healthy connection.
    async fn expect_status(&mut self, method: Method, key: i32, value: Option<Vec<u8>>) -> Result<()> {
        match self.call(method, key, value).await? {
            Response::Status(1) => Ok(()),
            Response::Status(_) => Err(StoreError::Unavailable(format!(
                "{method} of key {key} rejected by {}",
                self.endpoint
            ))),
            Response::Error(msg) => Err(StoreError::Unavailable(msg)),
            Response::Value(_) => Err(StoreError::Transport(format!(
                "unexpected bulk reply to {method}"
            ))),
        }
    }
}
