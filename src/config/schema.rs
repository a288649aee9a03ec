//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the engine.
//! All types derive Serde traits for deserialization from TOML files.

use serde::{Deserialize, Serialize};

use crate::code::LogLevel;

/// Root engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Core runtime settings.
    pub engine: CoreConfig,

    /// Engine log settings.
    pub log: LogConfig,

    /// HTTP virtual servers and upstreams.
    pub http: HttpConfig,
}

/// Core runtime settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Connection slots available to the cycle (network and synthetic).
    pub worker_connections: usize,

    /// Hard limit on bytes accounted to pools. `None` means unlimited.
    pub memory_limit: Option<usize>,

    /// Default loop tick interval when the host hook gives no hint.
    pub loop_tick_ms: u64,

    /// Stop the engine on SIGINT/SIGTERM.
    pub handle_signals: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            worker_connections: 1024,
            memory_limit: None,
            loop_tick_ms: 1000,
            handle_signals: true,
        }
    }
}

/// Engine log settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct LogConfig {
    /// Most verbose level written by `log`.
    pub level: LogLevel,
}

/// HTTP block.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Largest request body accepted from the network, in bytes.
    pub client_max_body_size: usize,

    /// Virtual servers, in declaration order.
    pub server: Vec<ServerBlock>,

    /// Upstream groups.
    pub upstream: Vec<UpstreamBlock>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            client_max_body_size: 1024 * 1024,
            server: Vec::new(),
            upstream: Vec::new(),
        }
    }
}

/// A virtual server.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerBlock {
    /// Listen address (e.g., "127.0.0.1:8080").
    pub listen: String,

    /// Host names served. Empty matches nothing but the listener default.
    pub server_name: Vec<String>,

    /// Identity used by synthetic requests. Must be in [0, 1024) and unique.
    pub server_id: Option<i64>,

    /// Binding id of the server-level location.
    pub upcall: Option<i64>,

    /// Prefix locations.
    pub location: Vec<LocationBlock>,
}

impl Default for ServerBlock {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            server_name: Vec::new(),
            server_id: None,
            upcall: None,
            location: Vec::new(),
        }
    }
}

/// A prefix location inside a server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct LocationBlock {
    /// Path prefix (must start with '/').
    pub path: String,

    /// Binding id returned by `get_loc_id_from_req`.
    pub upcall: Option<i64>,

    /// Upstream group to proxy to.
    pub proxy_pass: Option<String>,
}

/// Peer selection method of an upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Balance {
    RoundRobin,
    LeastConn,
}

/// An upstream group.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct UpstreamBlock {
    /// Name referenced by `proxy_pass`.
    pub name: String,

    /// Host override id. Enables the override wrapper around round robin.
    pub upcall: Option<i64>,

    /// Explicit balancing method. Conflicts with `upcall`.
    pub balance: Option<Balance>,

    /// Peers.
    pub server: Vec<UpstreamServerBlock>,
}

/// A peer of an upstream group.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamServerBlock {
    /// Peer address (e.g., "127.0.0.1:3000").
    pub address: String,

    /// Weight for weighted selection (default: 1).
    pub weight: u32,

    /// Failures within `fail_timeout_secs` before the peer is skipped.
    /// Zero disables failure accounting.
    pub max_fails: u32,

    /// Failure window and skip duration.
    pub fail_timeout_secs: u64,

    /// Permanently excluded from selection.
    pub down: bool,
}

impl Default for UpstreamServerBlock {
    fn default() -> Self {
        Self {
            address: String::new(),
            weight: 1,
            max_fails: 1,
            fail_timeout_secs: 10,
            down: false,
        }
    }
}
