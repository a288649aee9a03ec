//! Host override of upstream peer selection.
//!
//! # Responsibilities
//! - Run native round robin, then let the host hook replace the address
//! - Synthesize a numeric display name when the hook sets none
//! - Keep host-reported failures out of native peer health
//!
//! # Design Decisions
//! - The owning request is passed to `get` rather than stored, so the
//!   context can live inside the request it refers to
//! - A missing upcall table or hook fails the attempt before round robin
//!   state is touched

use std::net::SocketAddr;
use std::sync::Weak;

use crate::code::Code;
use crate::facade::Facade;
use crate::http::request::HttpRequest;
use crate::load_balancer::{PeerConnection, PeerState, RrPeerData};

/// Per-request override state: native state, upstream id, facade.
#[derive(Debug)]
pub struct UpstreamOverrideContext {
    rr: RrPeerData,
    id: i64,
    api: Weak<Facade>,
}

impl UpstreamOverrideContext {
    pub fn new(rr: RrPeerData, id: i64, api: Weak<Facade>) -> Self {
        Self { rr, id, api }
    }

    /// Upstream id configured by the `upcall` directive.
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn native(&self) -> &RrPeerData {
        &self.rr
    }

    /// Select the peer for `r`'s next attempt.
    pub fn get(&mut self, r: &HttpRequest, pc: &mut PeerConnection) -> Code {
        let Some(api) = self.api.upgrade() else {
            return Code::ERROR;
        };
        let Some(table) = api.get_upcall() else {
            return Code::ERROR;
        };
        if !table.has_get_upstream_peer() {
            return Code::ERROR;
        }

        let rc = self.rr.get(pc);
        if rc != Code::OK {
            return rc;
        }

        pc.name = None;
        let rc = table
            .call_get_upstream_peer(&api, r, self.id, pc)
            .unwrap_or(Code::ERROR);

        if rc == Code::OK && pc.name.is_none() {
            pc.name = pc.sockaddr.as_ref().map(peer_display_name);
        }
        if rc != Code::OK {
            tracing::debug!(upstream_id = self.id, rc = %rc, "Peer hook rejected attempt");
        }
        rc
    }

    /// Release the peer without reporting failure to native health.
    pub fn free(&mut self, pc: &mut PeerConnection, state: PeerState) {
        self.rr.free(pc, state.without(PeerState::FAILED));
    }
}

/// Numeric `host:port`, or `[host]:port` for IPv6.
pub fn peer_display_name(addr: &SocketAddr) -> String {
    match addr {
        SocketAddr::V4(v4) => format!("{}:{}", v4.ip(), v4.port()),
        SocketAddr::V6(v6) => format!("[{}]:{}", v6.ip(), v6.port()),
    }
}
