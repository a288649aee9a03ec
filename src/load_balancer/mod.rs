//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Location with proxy_pass → Upstream (pool.rs)
//!     → Upstream::init_peer (per request, lazily)
//!         - RoundRobin/LeastConn: RrPeerData (round_robin.rs)
//!         - upcall <id>: UpstreamOverrideContext (upcall.rs) wrapping RrPeerData
//!     → get(): balancer picks an available peer (backend.rs health)
//!         → override hook may replace the address
//!     → attempt → free(state): failure accounting, tries--
//! ```
//!
//! # Design Decisions
//! - Static peer settings are shared; mutable peer state lives behind one
//!   lock per upstream so a selection round sees a consistent view
//! - Per-request state (tried set, current peer) is owned by the request
//! - The host override never poisons native peer health

use std::fmt;
use std::net::SocketAddr;
use std::ops::BitOr;
use std::time::Instant;

use crate::code::Code;
use crate::http::request::HttpRequest;

pub mod backend;
pub mod least_conn;
pub mod pool;
pub mod round_robin;
pub mod upcall;

pub use backend::{Peer, PeerHealth};
pub use pool::{Upstream, UpstreamManager};
pub use round_robin::RrPeerData;
pub use upcall::{peer_display_name, UpstreamOverrideContext};

/// Peer selection strategy.
pub trait Balancer: Send + Sync + fmt::Debug {
    /// Strategy name for logs.
    fn name(&self) -> &'static str;

    /// Pick an available, untried peer and update selection state.
    fn pick(&self, peers: &[Peer], health: &mut [PeerHealth], tried: &TriedPeers, now: Instant) -> Option<usize>;
}

/// Peers already attempted by one request.
#[derive(Debug, Clone, Default)]
pub struct TriedPeers(Vec<bool>);

impl TriedPeers {
    pub fn new(peers: usize) -> Self {
        Self(vec![false; peers])
    }

    pub fn contains(&self, index: usize) -> bool {
        self.0.get(index).copied().unwrap_or(false)
    }

    pub fn insert(&mut self, index: usize) {
        if let Some(slot) = self.0.get_mut(index) {
            *slot = true;
        }
    }
}

/// Outcome flags passed when releasing a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeerState(u32);

impl PeerState {
    pub const NONE: PeerState = PeerState(0);
    pub const KEEPALIVE: PeerState = PeerState(1);
    pub const NEXT: PeerState = PeerState(2);
    pub const FAILED: PeerState = PeerState(4);

    pub fn contains(self, other: PeerState) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn without(self, other: PeerState) -> PeerState {
        PeerState(self.0 & !other.0)
    }
}

impl BitOr for PeerState {
    type Output = PeerState;

    fn bitor(self, rhs: PeerState) -> PeerState {
        PeerState(self.0 | rhs.0)
    }
}

/// Destination of one upstream attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerConnection {
    /// Address to connect to. Set by the balancer, replaceable by the host.
    pub sockaddr: Option<SocketAddr>,
    /// Display name. Cleared before the host hook runs.
    pub name: Option<String>,
    /// Attempts left for this request.
    pub tries: usize,
}

impl PeerConnection {
    pub fn new(tries: usize) -> Self {
        Self {
            sockaddr: None,
            name: None,
            tries,
        }
    }
}

/// Per-request upstream state.
#[derive(Debug)]
pub enum UpstreamPeerData {
    Native(RrPeerData),
    Override(UpstreamOverrideContext),
}

impl UpstreamPeerData {
    /// Select the peer for the next attempt.
    pub fn get(&mut self, r: &HttpRequest, pc: &mut PeerConnection) -> Code {
        let (source, rc) = match self {
            UpstreamPeerData::Native(rr) => ("native", rr.get(pc)),
            UpstreamPeerData::Override(ctx) => ("override", ctx.get(r, pc)),
        };
        let outcome = if rc.is_ok() { "ok" } else { "failed" };
        crate::observability::metrics::record_peer_selection(source, outcome);
        rc
    }

    /// Release the peer of the last attempt.
    pub fn free(&mut self, pc: &mut PeerConnection, state: PeerState) {
        match self {
            UpstreamPeerData::Native(rr) => rr.free(pc, state),
            UpstreamPeerData::Override(ctx) => ctx.free(pc, state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_state_flags() {
        let state = PeerState::FAILED | PeerState::NEXT;
        assert!(state.contains(PeerState::FAILED));
        assert!(!state.without(PeerState::FAILED).contains(PeerState::FAILED));
        assert!(state.without(PeerState::FAILED).contains(PeerState::NEXT));
        assert!(!PeerState::NONE.contains(PeerState::NONE));
    }

    #[test]
    fn tried_peers() {
        let mut tried = TriedPeers::new(2);
        tried.insert(1);
        tried.insert(5);
        assert!(!tried.contains(0));
        assert!(tried.contains(1));
        assert!(!tried.contains(5));
    }
}
