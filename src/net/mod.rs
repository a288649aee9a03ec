//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Configured listen addresses
//!     → listener.rs (bind all before serving)
//!     → axum accept loop (http/server.rs)
//!     → connection.rs (slot + pool + Network I/O per admitted request)
//!     → Hand off to the phase pipeline
//!
//! Synthetic requests:
//!     facade/dummy.rs → connection.rs (slot + pool + Synthetic I/O)
//! ```
//!
//! # Design Decisions
//! - One connection per admitted request; the slot table bounds both
//!   network and synthetic connections
//! - Responses are buffered on the connection and delivered in one piece
//!   when the request is finalized

pub mod connection;
pub mod listener;

pub use connection::{Connection, ConnectionId, ConnectionIo, ConnectionSlots};
