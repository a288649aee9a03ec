//! Synthetic request fabrication.
//!
//! # Responsibilities
//! - Build a fully initialized request with no client behind it
//! - Bind it to the server registered under a server id
//!
//! # Design Decisions
//! - Every step owns what it allocated, so a failure at any step releases
//!   the pool and the connection slot by drop; nothing leaks on retry
//! - The connection's I/O is the synthetic variant: reads and writes fail
//!   instead of touching a socket

use std::mem::size_of;
use std::sync::Arc;

use crate::cycle::Cycle;
use crate::http::request::{HttpRequest, RequestKind};
use crate::net::connection::{Connection, ConnectionIo};
use crate::observability::EngineLog;
use crate::pool::{Pool, DUMMY_POOL_SIZE};

/// Why a synthetic request could not be built.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DummyRequestError {
    #[error("engine is not running")]
    NotRunning,
    #[error("server id {0} is not registered")]
    UnknownServerId(isize),
    #[error("no memory for {0}")]
    NoMemory(&'static str),
    #[error("no free connection slot")]
    NoConnectionSlot,
}

/// Fabricate a synthetic main request for the server registered as `server_id`.
pub fn new_dummy_request(cycle: &Arc<Cycle>, server_id: isize) -> Result<HttpRequest, DummyRequestError> {
    let server = i64::try_from(server_id)
        .ok()
        .and_then(|id| cycle.server_ids().lookup(id))
        .cloned()
        .ok_or(DummyRequestError::UnknownServerId(server_id))?;

    let pool = Pool::create(DUMMY_POOL_SIZE, cycle.budget(), cycle.pool_stats())
        .map_err(|_| DummyRequestError::NoMemory("pool"))?;

    // Log context inherits the cycle's sink.
    pool.reserve(size_of::<EngineLog>())
        .map_err(|_| DummyRequestError::NoMemory("log"))?;

    let slot = cycle
        .slots()
        .acquire()
        .ok_or(DummyRequestError::NoConnectionSlot)?;
    let mut connection = Connection::new(slot, pool, ConnectionIo::Synthetic, cycle.log());

    connection
        .attach_http(Arc::clone(&server))
        .map_err(|_| DummyRequestError::NoMemory("http connection"))?;
    connection
        .attach_log_ctx()
        .map_err(|_| DummyRequestError::NoMemory("log context"))?;
    connection
        .attach_buffer()
        .map_err(|_| DummyRequestError::NoMemory("connection buffer"))?;

    let location = Arc::clone(server.default_location());
    let r = HttpRequest::alloc(cycle, Arc::new(connection), server, location, RequestKind::Main)
        .map_err(|_| DummyRequestError::NoMemory("request"))?;

    tracing::debug!(request = %r.id(), server_id, "Synthetic request created");
    Ok(r)
}
