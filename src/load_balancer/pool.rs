//! Upstream group management.
//!
//! # Responsibilities
//! - Build upstream groups from configuration
//! - Resolve the `upcall` directive into the override wrapper
//! - Hand out per-request peer state

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};

use crate::config::{Balance, ConfigError, UpstreamBlock};
use crate::facade::Facade;
use crate::load_balancer::{
    backend::{Peer, PeerHealth},
    least_conn::LeastConnections,
    round_robin::{RoundRobin, RrPeerData},
    upcall::UpstreamOverrideContext,
    Balancer, UpstreamPeerData,
};

/// How peers of an upstream are chosen.
#[derive(Debug, Clone)]
pub enum UpstreamMethod {
    /// The configured balancer alone.
    Native,
    /// Round robin, then the host's peer hook.
    Upcall { id: i64, api: Weak<Facade> },
}

/// An upstream group.
#[derive(Debug)]
pub struct Upstream {
    name: String,
    peers: Vec<Peer>,
    health: Mutex<Vec<PeerHealth>>,
    balancer: Box<dyn Balancer>,
    method: UpstreamMethod,
}

impl Upstream {
    pub fn new(name: impl Into<String>, peers: Vec<Peer>, balancer: Box<dyn Balancer>, method: UpstreamMethod) -> Self {
        let now = Instant::now();
        let health = peers.iter().map(|p| PeerHealth::new(p, now)).collect();
        Self {
            name: name.into(),
            peers,
            health: Mutex::new(health),
            balancer,
            method,
        }
    }

    /// Build from an `[[http.upstream]]` block.
    pub fn from_config(block: &UpstreamBlock, api: &Weak<Facade>) -> Result<Self, ConfigError> {
        let method = match (block.upcall, block.balance) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::Directive {
                    directive: "upcall",
                    message: "load balancing method redefined".to_string(),
                })
            }
            (Some(id), None) => UpstreamMethod::Upcall { id, api: api.clone() },
            (None, _) => UpstreamMethod::Native,
        };

        let balancer: Box<dyn Balancer> = match block.balance {
            Some(Balance::LeastConn) => Box::new(LeastConnections::new()),
            Some(Balance::RoundRobin) | None => Box::new(RoundRobin::new()),
        };

        let peers = block
            .server
            .iter()
            .map(|server| {
                Peer::from_config(server).map_err(|e| ConfigError::Directive {
                    directive: "server",
                    message: format!("invalid address \"{}\": {}", server.address, e),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::new(block.name.clone(), peers, balancer, method))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn balancer(&self) -> &dyn Balancer {
        self.balancer.as_ref()
    }

    pub fn method(&self) -> &UpstreamMethod {
        &self.method
    }

    pub(crate) fn lock_health(&self) -> MutexGuard<'_, Vec<PeerHealth>> {
        self.health.lock()
    }

    /// Snapshot of one peer's state.
    pub fn peer_health(&self, index: usize) -> Option<PeerHealth> {
        self.health.lock().get(index).cloned()
    }

    /// Attempts allowed per request.
    pub fn tries(&self) -> usize {
        self.peers.len()
    }

    /// Per-request peer state for a new request.
    pub fn init_peer(self: &Arc<Self>) -> UpstreamPeerData {
        let rr = RrPeerData::new(Arc::clone(self));
        match &self.method {
            UpstreamMethod::Native => UpstreamPeerData::Native(rr),
            UpstreamMethod::Upcall { id, api } => {
                UpstreamPeerData::Override(UpstreamOverrideContext::new(rr, *id, api.clone()))
            }
        }
    }
}

/// All upstream groups of a cycle, by name.
#[derive(Debug, Default)]
pub struct UpstreamManager {
    upstreams: HashMap<String, Arc<Upstream>>,
}

impl UpstreamManager {
    /// Create the manager from configuration.
    pub fn from_config(blocks: &[UpstreamBlock], api: &Weak<Facade>) -> Result<Self, ConfigError> {
        let mut upstreams = HashMap::new();
        for block in blocks {
            let upstream = Upstream::from_config(block, api)?;
            tracing::debug!(
                upstream = %upstream.name(),
                peers = upstream.peers().len(),
                balancer = upstream.balancer().name(),
                "Upstream configured"
            );
            upstreams.insert(block.name.clone(), Arc::new(upstream));
        }
        Ok(Self { upstreams })
    }

    pub fn get(&self, name: &str) -> Option<Arc<Upstream>> {
        self.upstreams.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }
}
