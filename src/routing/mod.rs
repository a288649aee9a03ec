//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming Request (listen address, Host, path)
//!     → router.rs VirtualServers::resolve (server for listen + Host)
//!     → router.rs ServerConf::find_location (longest prefix)
//!     → LocationConf { binding, proxy_pass }
//!
//! Synthetic Request (server_id)
//!     → facade/server_id.rs registry
//!     → ServerConf::default_location
//!
//! Compilation (at cycle build):
//!     ServerBlock[]
//!     → cycle.rs ConfContext (bindings, upstream references)
//!     → Freeze as immutable VirtualServers
//! ```
//!
//! # Design Decisions
//! - Servers compiled at startup, immutable at runtime
//! - No regex in hot path (prefix matching only)
//! - Deterministic: same input always matches same location

pub mod matcher;
pub mod router;

pub use router::{LocationConf, ServerConf, VirtualServers};
