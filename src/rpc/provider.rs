//! RPC provider
//!
//! Exports the four store operations on a TCP endpoint under a provider
//! id. Each connection gets its own task; all exclusion between
//! concurrent requests is delegated to the store's named mutex. Store
//! failures never escape as protocol errors: a fetch of a missing key
//! answers the wire sentinel, an internal fetch failure answers an empty
//! bulk, and mutation failures answer status 0.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use modkv_core::KvStore;

use crate::rpc::protocol::{Method, Request, Response, ServerCodec, FETCH_MISSING_SENTINEL};

/// Provider exporting one store on an endpoint.
#[derive(Clone)]
pub struct KvProvider {
    store: Arc<KvStore>,
    provider_id: u16,
}

impl KvProvider {
    pub fn new(store: Arc<KvStore>, provider_id: u16) -> Self {
        Self { store, provider_id }
    }

    pub fn provider_id(&self) -> u16 {
        self.provider_id
    }

    /// Accept loop: one task per connection until the listener fails.
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (socket, peer) = listener.accept().await?;
            tracing::debug!(%peer, "new connection");
            let provider = self.clone();
            tokio::spawn(async move {
                if let Err(e) = provider.handle_connection(socket).await {
                    tracing::debug!(%peer, error = %e, "connection ended");
                }
            });
        }
    }

    async fn handle_connection(&self, socket: TcpStream) -> std::io::Result<()> {
        let mut framed = Framed::new(socket, ServerCodec);
        while let Some(frame) = framed.next().await {
            let request = frame?;
            let response = self.handle_request(request);
            framed.send(response).await?;
        }
        Ok(())
    }

    fn handle_request(&self, req: Request) -> Response {
        if req.provider_id != self.provider_id {
            tracing::warn!(
                got = req.provider_id,
                expected = self.provider_id,
                "request for unknown provider id"
            );
            return Response::Error(format!("unknown provider id {}", req.provider_id));
        }

        match req.method {
            Method::Fetch => match self.store.find(req.key) {
                Ok(value) => {
                    tracing::debug!(key = req.key, len = value.len(), "kv_fetch");
                    Response::Value(value)
                }
                Err(e) if e.is_not_found() => {
                    tracing::debug!(key = req.key, "kv_fetch: key not found");
                    Response::Value(FETCH_MISSING_SENTINEL.to_vec())
                }
                Err(e) => {
                    tracing::error!(key = req.key, error = %e, "kv_fetch failed");
                    Response::Value(Vec::new())
                }
            },
            Method::Insert => {
                let value = req.value.unwrap_or_default();
                self.status_of("kv_insert", req.key, self.store.insert(req.key, &value))
            }
            Method::Update => {
                let value = req.value.unwrap_or_default();
                self.status_of("kv_update", req.key, self.store.update(req.key, &value))
            }
            Method::Delete => self.status_of("kv_delete", req.key, self.store.delete(req.key)),
        }
    }

    fn status_of(&self, op: &str, key: i32, result: modkv_core::Result<()>) -> Response {
        match result {
            Ok(()) => {
                tracing::debug!(key, "{op} ok");
                Response::Status(1)
            }
            Err(e) if e.is_not_found() => {
                tracing::debug!(key, "{op}: key not found");
                Response::Status(0)
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "{op} failed");
                Response::Status(0)
            }
        }
    }
}
