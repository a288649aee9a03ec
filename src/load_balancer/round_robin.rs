//! Smooth weighted round-robin strategy and per-request peer state.

use std::sync::Arc;
use std::time::Instant;

use crate::code::Code;
use crate::load_balancer::{Balancer, Peer, PeerConnection, PeerHealth, PeerState, TriedPeers, Upstream};

/// Smooth weighted round-robin selector.
///
/// Every round each available peer gains its effective weight; the richest
/// peer wins and pays back the round total.
#[derive(Debug, Default)]
pub struct RoundRobin;

impl RoundRobin {
    pub fn new() -> Self {
        Self
    }
}

impl Balancer for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn pick(&self, peers: &[Peer], health: &mut [PeerHealth], tried: &TriedPeers, now: Instant) -> Option<usize> {
        let mut best: Option<(usize, i64)> = None;
        let mut total = 0;

        for (i, (peer, state)) in peers.iter().zip(health.iter_mut()).enumerate() {
            if tried.contains(i) || !state.is_available(peer, now) {
                continue;
            }

            state.current_weight += state.effective_weight;
            total += state.effective_weight;
            if state.effective_weight < peer.weight {
                state.effective_weight += 1;
            }

            if best.map_or(true, |(_, weight)| state.current_weight > weight) {
                best = Some((i, state.current_weight));
            }
        }

        let (index, _) = best?;
        health[index].current_weight -= total;
        Some(index)
    }
}

/// Per-request round-robin state.
#[derive(Debug)]
pub struct RrPeerData {
    upstream: Arc<Upstream>,
    current: Option<usize>,
    tried: TriedPeers,
}

impl RrPeerData {
    pub fn new(upstream: Arc<Upstream>) -> Self {
        let tried = TriedPeers::new(upstream.peers().len());
        Self {
            upstream,
            current: None,
            tried,
        }
    }

    pub fn upstream(&self) -> &Arc<Upstream> {
        &self.upstream
    }

    /// Peer index of the attempt in flight.
    pub fn current(&self) -> Option<usize> {
        self.current
    }

    /// Select a peer. `BUSY` when every peer is down, failed or tried.
    pub fn get(&mut self, pc: &mut PeerConnection) -> Code {
        let now = Instant::now();
        let upstream = &self.upstream;
        let peers = upstream.peers();
        let mut health = upstream.lock_health();

        let Some(index) = upstream.balancer().pick(peers, &mut health, &self.tried, now) else {
            tracing::warn!(upstream = %upstream.name(), "No live upstream peers");
            pc.name = Some(upstream.name().to_string());
            return Code::BUSY;
        };

        let peer = &peers[index];
        let state = &mut health[index];
        state.mark_selected(peer, now);
        state.conns += 1;

        self.current = Some(index);
        self.tried.insert(index);
        pc.sockaddr = Some(peer.addr);
        pc.name = Some(peer.name.clone());

        tracing::debug!(
            upstream = %upstream.name(),
            peer = %peer.name,
            balancer = upstream.balancer().name(),
            "Peer selected"
        );
        Code::OK
    }

    /// Release the current peer, applying failure accounting.
    pub fn free(&mut self, pc: &mut PeerConnection, state: PeerState) {
        let Some(index) = self.current.take() else {
            return;
        };
        let now = Instant::now();
        let peer = &self.upstream.peers()[index];
        let mut health = self.upstream.lock_health();
        let peer_state = &mut health[index];

        if state.contains(PeerState::FAILED) {
            if peer_state.mark_failure(peer, now) {
                tracing::warn!(
                    upstream = %self.upstream.name(),
                    peer = %peer.name,
                    "Upstream peer temporarily disabled"
                );
            }
        } else {
            peer_state.mark_success();
        }

        peer_state.conns = peer_state.conns.saturating_sub(1);
        pc.tries = pc.tries.saturating_sub(1);
    }
}
