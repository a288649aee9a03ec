//! Upstream peer abstraction.
//!
//! # Responsibilities
//! - Represent a single upstream peer (static settings)
//! - Track its mutable selection and health state
//! - Apply failure accounting (max_fails within fail_timeout)

use std::net::{AddrParseError, SocketAddr};
use std::time::{Duration, Instant};

use crate::config::UpstreamServerBlock;

/// A single upstream peer.
#[derive(Debug, Clone)]
pub struct Peer {
    /// The address of the peer.
    pub addr: SocketAddr,
    /// Display name as configured.
    pub name: String,
    /// Configured weight.
    pub weight: i64,
    /// Failures tolerated within `fail_timeout`. Zero disables accounting.
    pub max_fails: u32,
    /// Failure window and skip duration.
    pub fail_timeout: Duration,
    /// Permanently excluded.
    pub down: bool,
}

impl Peer {
    pub fn new(addr: SocketAddr, weight: i64) -> Self {
        Self {
            addr,
            name: addr.to_string(),
            weight,
            max_fails: 1,
            fail_timeout: Duration::from_secs(10),
            down: false,
        }
    }

    pub fn from_config(block: &UpstreamServerBlock) -> Result<Self, AddrParseError> {
        let addr: SocketAddr = block.address.parse()?;
        Ok(Self {
            addr,
            name: block.address.clone(),
            weight: i64::from(block.weight.max(1)),
            max_fails: block.max_fails,
            fail_timeout: Duration::from_secs(block.fail_timeout_secs),
            down: block.down,
        })
    }
}

/// Mutable per-peer state, guarded by the upstream's lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHealth {
    /// Smooth weighted round-robin accumulator.
    pub current_weight: i64,
    /// Weight after failure penalties; recovers by one per selection round.
    pub effective_weight: i64,
    /// Failures in the current window.
    pub fails: u32,
    /// Time of the last failure.
    pub accessed: Option<Instant>,
    /// Start of the current failure window.
    pub checked: Instant,
    /// Attempts currently using this peer.
    pub conns: usize,
}

impl PeerHealth {
    pub fn new(peer: &Peer, now: Instant) -> Self {
        Self {
            current_weight: 0,
            effective_weight: peer.weight,
            fails: 0,
            accessed: None,
            checked: now,
            conns: 0,
        }
    }

    /// Return true if the peer may be selected at `now`.
    pub fn is_available(&self, peer: &Peer, now: Instant) -> bool {
        if peer.down {
            return false;
        }
        if peer.max_fails > 0
            && self.fails >= peer.max_fails
            && now.saturating_duration_since(self.checked) <= peer.fail_timeout
        {
            return false;
        }
        true
    }

    /// Open a new failure window once the previous one has expired.
    pub fn mark_selected(&mut self, peer: &Peer, now: Instant) {
        if now.saturating_duration_since(self.checked) > peer.fail_timeout {
            self.checked = now;
        }
    }

    /// Report a failed attempt. Returns true when the peer became unavailable.
    pub fn mark_failure(&mut self, peer: &Peer, now: Instant) -> bool {
        self.fails += 1;
        self.accessed = Some(now);
        self.checked = now;

        let mut disabled = false;
        if peer.max_fails > 0 {
            self.effective_weight -= peer.weight / i64::from(peer.max_fails);
            disabled = self.fails >= peer.max_fails;
        }
        if self.effective_weight < 0 {
            self.effective_weight = 0;
        }
        disabled
    }

    /// Report a successful attempt.
    pub fn mark_success(&mut self) {
        // Failures older than the current window are forgotten.
        if self.accessed.map_or(true, |accessed| accessed < self.checked) {
            self.fails = 0;
        }
    }
}
