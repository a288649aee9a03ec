//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Facade log(level, msg) / engine internals
//!     → logging.rs (EngineLog: level filter + span)
//!     → tracing subscriber installed by the host
//!
//! Request finalization / fabrication / peer selection
//!     → metrics.rs (counters)
//!     → optional Prometheus exporter
//! ```
//!
//! # Design Decisions
//! - The library never installs a subscriber or recorder on its own;
//!   `init_logging` and `init_metrics` are for hosts
//! - Every connection gets a child span so host log lines carry its id

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, EngineLog};
