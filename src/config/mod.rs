//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! engine.toml (path from -c/--conf, possibly a memfd path)
//!     → loader.rs (read & deserialize)
//!     → validation.rs (semantic checks)
//!     → EngineConfig (validated, immutable)
//!     → cycle.rs ConfContext (directives: server_id, upcall, proxy_pass)
//!     → shared via Arc by the running cycle
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; a new cycle is the only way to change it
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    Balance, CoreConfig, EngineConfig, HttpConfig, LocationBlock, LogConfig, ServerBlock,
    UpstreamBlock, UpstreamServerBlock,
};
