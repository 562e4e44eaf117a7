//! RPC layer: wire protocol, provider and client

pub mod client;
pub mod connection;
pub mod protocol;
pub mod provider;

pub use client::KvClient;
pub use connection::{ConnectionCache, SharedClient, REFRESH_AFTER};
pub use protocol::{ClientCodec, Method, Request, Response, ServerCodec, FETCH_MISSING_SENTINEL};
pub use provider::KvProvider;
