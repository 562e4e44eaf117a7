//! Local-identity oracle
//!
//! Given the membership's endpoint list, decides which node (if any)
//! names the current host. The oracle itself is a trait so the decision
//! can be driven by the configured `local_ip`, by a network probe, or by
//! a fixed answer in tests.

use std::net::{Ipv4Addr, UdpSocket};

use crate::cluster::{endpoint_host, NodeInfo};

/// Answers whether a host string names the current machine.
pub trait IdentityOracle: Send + Sync {
    fn is_local_host(&self, host: &str) -> bool;
}

/// Oracle backed by an explicit host list, used when the configuration
/// names the local endpoint and by tests.
#[derive(Debug, Clone, Default)]
pub struct FixedIdentity {
    hosts: Vec<String>,
}

impl FixedIdentity {
    pub fn new(hosts: Vec<String>) -> Self {
        Self { hosts }
    }

    /// Builds the oracle from a configured endpoint such as
    /// `ofi+tcp://10.0.0.1:8080`; a bare host is accepted too.
    pub fn from_endpoint(endpoint: &str) -> Self {
        let host = endpoint_host(endpoint).unwrap_or(endpoint);
        Self {
            hosts: vec![host.to_string()],
        }
    }
}

impl IdentityOracle for FixedIdentity {
    fn is_local_host(&self, host: &str) -> bool {
        self.hosts.iter().any(|h| h == host)
    }
}

/// Oracle that probes the operating system: an address is local when a
/// socket can be bound to it. Loopback and non-IPv4 hosts never match,
/// mirroring the interface enumeration this replaces.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemIdentity;

impl IdentityOracle for SystemIdentity {
    fn is_local_host(&self, host: &str) -> bool {
        let ip: Ipv4Addr = match host.parse() {
            Ok(ip) => ip,
            Err(_) => return false,
        };
        if ip.is_loopback() {
            return false;
        }
        UdpSocket::bind((ip, 0)).is_ok()
    }
}

/// Scans the membership for the first endpoint whose host the oracle
/// claims. Unparseable endpoints are skipped; `None` means the process
/// runs as a remote-only client.
pub fn detect_local_node(members: &[NodeInfo], oracle: &dyn IdentityOracle) -> Option<usize> {
    for (i, node) in members.iter().enumerate() {
        let host = match endpoint_host(&node.endpoint) {
            Some(host) => host,
            None => {
                tracing::debug!(endpoint = %node.endpoint, "skipping unparseable endpoint");
                continue;
            }
        };
        if oracle.is_local_host(host) {
            tracing::info!(node = i, endpoint = %node.endpoint, "detected local node");
            return Some(i);
        }
    }
    tracing::warn!("no local node detected; operating in remote-only mode");
    None
}
