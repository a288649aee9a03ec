//! Least Connections load balancing strategy.

use std::time::Instant;

use crate::load_balancer::{Balancer, Peer, PeerHealth, TriedPeers};

/// Least connections selector.
/// Selects the peer with the fewest in-flight attempts relative to its weight;
/// ties are broken with smooth weighted round robin.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }
}

/// `a.conns / a.weight < b.conns / b.weight` without division.
fn fewer(a: &PeerHealth, a_peer: &Peer, b: &PeerHealth, b_peer: &Peer) -> std::cmp::Ordering {
    let lhs = a.conns as i128 * i128::from(b_peer.weight);
    let rhs = b.conns as i128 * i128::from(a_peer.weight);
    lhs.cmp(&rhs)
}

impl Balancer for LeastConnections {
    fn name(&self) -> &'static str {
        "least_conn"
    }

    fn pick(&self, peers: &[Peer], health: &mut [PeerHealth], tried: &TriedPeers, now: Instant) -> Option<usize> {
        let candidates: Vec<usize> = (0..peers.len())
            .filter(|&i| !tried.contains(i) && health[i].is_available(&peers[i], now))
            .collect();

        let mut best = *candidates.first()?;
        let mut ties = 1;
        for &i in &candidates[1..] {
            match fewer(&health[i], &peers[i], &health[best], &peers[best]) {
                std::cmp::Ordering::Less => {
                    best = i;
                    ties = 1;
                }
                std::cmp::Ordering::Equal => ties += 1,
                std::cmp::Ordering::Greater => {}
            }
        }
        if ties == 1 {
            return Some(best);
        }

        // Weighted round robin among the tied peers.
        let tied: Vec<usize> = candidates
            .into_iter()
            .filter(|&i| fewer(&health[i], &peers[i], &health[best], &peers[best]).is_eq())
            .collect();
        let mut winner: Option<(usize, i64)> = None;
        let mut total = 0;
        for i in tied {
            let state = &mut health[i];
            state.current_weight += state.effective_weight;
            total += state.effective_weight;
            if state.effective_weight < peers[i].weight {
                state.effective_weight += 1;
            }
            if winner.map_or(true, |(_, weight)| state.current_weight > weight) {
                winner = Some((i, state.current_weight));
            }
        }
        let (index, _) = winner?;
        health[index].current_weight -= total;
        Some(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(weights: &[i64]) -> (Vec<Peer>, Vec<PeerHealth>) {
        let now = Instant::now();
        let peers: Vec<Peer> = weights
            .iter()
            .enumerate()
            .map(|(i, w)| Peer::new(format!("127.0.0.1:{}", 9080 + i).parse().unwrap(), *w))
            .collect();
        let health = peers.iter().map(|p| PeerHealth::new(p, now)).collect();
        (peers, health)
    }

    #[test]
    fn test_least_conn() {
        let (peers, mut health) = setup(&[1, 1]);
        let lb = LeastConnections::new();
        let tried = TriedPeers::new(2);
        let now = Instant::now();

        // artificially increase connections on peer 0
        health[0].conns = 1;
        assert_eq!(lb.pick(&peers, &mut health, &tried, now), Some(1));

        // now peer 1 has 2, peer 0 has 1
        health[1].conns = 2;
        assert_eq!(lb.pick(&peers, &mut health, &tried, now), Some(0));
    }

    #[test]
    fn weight_scales_connection_count() {
        let (peers, mut health) = setup(&[1, 3]);
        let lb = LeastConnections::new();
        let tried = TriedPeers::new(2);
        health[0].conns = 1;
        health[1].conns = 2;
        assert_eq!(lb.pick(&peers, &mut health, &tried, Instant::now()), Some(1));
    }

    #[test]
    fn ties_rotate() {
        let (peers, mut health) = setup(&[1, 1]);
        let lb = LeastConnections::new();
        let tried = TriedPeers::new(2);
        let now = Instant::now();
        let first = lb.pick(&peers, &mut health, &tried, now).unwrap();
        let second = lb.pick(&peers, &mut health, &tried, now).unwrap();
        assert_ne!(first, second);
    }
}
