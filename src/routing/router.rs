//! Virtual-server and location lookup.
//!
//! # Responsibilities
//! - Store compiled servers and their locations
//! - Pick the server for a (listen address, Host) pair
//! - Pick the location for a path, falling back to the server-level one
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - First server on a listen address is its default
//! - Longest prefix wins; locations are sorted once at construction

use std::net::SocketAddr;
use std::sync::Arc;

use crate::facade::binding::LocationBinding;
use crate::load_balancer::Upstream;
use crate::routing::matcher::{HostMatcher, Matcher, PathPrefixMatcher};

/// A compiled location.
#[derive(Debug)]
pub struct LocationConf {
    pub path: String,
    pub binding: LocationBinding,
    pub proxy_pass: Option<Arc<Upstream>>,
}

/// A compiled virtual server.
#[derive(Debug)]
pub struct ServerConf {
    index: usize,
    listen: SocketAddr,
    names: Vec<HostMatcher>,
    server_id: Option<i64>,
    default_location: Arc<LocationConf>,
    locations: Vec<(PathPrefixMatcher, Arc<LocationConf>)>,
}

impl ServerConf {
    pub fn new(
        index: usize,
        listen: SocketAddr,
        server_names: &[String],
        server_id: Option<i64>,
        default_location: LocationConf,
        locations: Vec<LocationConf>,
    ) -> Self {
        let mut locations: Vec<_> = locations
            .into_iter()
            .map(|loc| (PathPrefixMatcher::new(loc.path.clone()), Arc::new(loc)))
            .collect();
        // Stable sort keeps declaration order among equal prefixes.
        locations.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        Self {
            index,
            listen,
            names: server_names.iter().map(HostMatcher::new).collect(),
            server_id,
            default_location: Arc::new(default_location),
            locations,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn listen(&self) -> SocketAddr {
        self.listen
    }

    pub fn server_id(&self) -> Option<i64> {
        self.server_id
    }

    pub fn server_names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(HostMatcher::host)
    }

    pub fn matches_host(&self, host: &str) -> bool {
        self.names.iter().any(|m| m.matches(host))
    }

    /// Server-level location used by synthetic requests and unmatched paths.
    pub fn default_location(&self) -> &Arc<LocationConf> {
        &self.default_location
    }

    /// Longest-prefix location for `path`.
    pub fn find_location(&self, path: &str) -> Arc<LocationConf> {
        self.locations
            .iter()
            .find(|(matcher, _)| matcher.matches(path))
            .map(|(_, loc)| Arc::clone(loc))
            .unwrap_or_else(|| Arc::clone(&self.default_location))
    }
}

/// All virtual servers of a cycle.
#[derive(Debug, Default)]
pub struct VirtualServers {
    servers: Vec<Arc<ServerConf>>,
}

impl VirtualServers {
    pub fn new(servers: Vec<Arc<ServerConf>>) -> Self {
        Self { servers }
    }

    /// Server for a request that arrived on `listen` with the given Host.
    pub fn resolve(&self, listen: SocketAddr, host: Option<&str>) -> Option<Arc<ServerConf>> {
        let mut candidates = self.servers.iter().filter(|s| s.listen == listen).peekable();
        let default = candidates.peek().cloned().cloned();

        if let Some(host) = host {
            if let Some(server) = candidates.find(|s| s.matches_host(host)) {
                return Some(Arc::clone(server));
            }
        }
        default
    }

    /// Distinct listen addresses in declaration order.
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        let mut addrs = Vec::new();
        for server in &self.servers {
            if !addrs.contains(&server.listen) {
                addrs.push(server.listen);
            }
        }
        addrs
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ServerConf>> {
        self.servers.iter()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}
