//! Connection objects and slot accounting.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Bound the number of live connections with RAII slots
//! - Own a connection's pool, log context and I/O variant
//! - Deliver buffered responses back to the network front end
//!
//! # Design Decisions
//! - I/O is a tagged variant: `Network` carries the peer and the response
//!   channel, `Synthetic` has no peer and every operation fails
//! - Field order is teardown order: the slot is returned before the pool
//!   is released

use std::io;
use std::mem::size_of;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::cycle::Cycle;
use crate::observability::EngineLog;
use crate::pool::{Pool, PoolExhausted, REQUEST_POOL_SIZE};
use crate::routing::ServerConf;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Fixed-capacity connection slot table.
#[derive(Debug)]
pub struct ConnectionSlots {
    capacity: usize,
    in_use: AtomicUsize,
}

impl ConnectionSlots {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            in_use: AtomicUsize::new(0),
        }
    }

    /// Take a free slot. Returns `None` when the table is full.
    pub fn acquire(self: &Arc<Self>) -> Option<ConnectionSlot> {
        let mut prev = self.in_use.load(Ordering::Relaxed);
        loop {
            if prev >= self.capacity {
                return None;
            }
            match self.in_use.compare_exchange_weak(prev, prev + 1, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break,
                Err(x) => prev = x,
            }
        }
        Some(ConnectionSlot {
            slots: Arc::clone(self),
            id: ConnectionId::new(),
        })
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// An occupied slot. Returned to the table on drop.
#[derive(Debug)]
pub struct ConnectionSlot {
    slots: Arc<ConnectionSlots>,
    id: ConnectionId,
}

impl ConnectionSlot {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.slots.in_use.fetch_sub(1, Ordering::Relaxed);
        tracing::trace!(connection_id = %self.id, "Connection slot released");
    }
}

/// Response head as handed to the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub content_length: Option<u64>,
}

/// A complete buffered response.
#[derive(Debug)]
pub struct ResponseParts {
    pub head: ResponseHead,
    pub body: Bytes,
}

/// I/O state of a connection accepted from the network.
#[derive(Debug)]
pub struct NetworkIo {
    peer: SocketAddr,
    inbound: Mutex<Option<Bytes>>,
    head: Mutex<Option<ResponseHead>>,
    body: Mutex<BytesMut>,
    responder: Mutex<Option<oneshot::Sender<ResponseParts>>>,
}

impl NetworkIo {
    pub fn new(peer: SocketAddr, inbound: Bytes, responder: oneshot::Sender<ResponseParts>) -> Self {
        Self {
            peer,
            inbound: Mutex::new(Some(inbound)),
            head: Mutex::new(None),
            body: Mutex::new(BytesMut::new()),
            responder: Mutex::new(Some(responder)),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

/// Connection I/O variant.
#[derive(Debug)]
pub enum ConnectionIo {
    Network(NetworkIo),
    /// No peer. Every operation reports `NotConnected`.
    Synthetic,
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "synthetic connection has no peer")
}

impl ConnectionIo {
    pub fn is_synthetic(&self) -> bool {
        matches!(self, ConnectionIo::Synthetic)
    }

    /// Take the buffered request body. Empty once consumed.
    pub fn recv(&self) -> io::Result<Bytes> {
        match self {
            ConnectionIo::Network(net) => Ok(net.inbound.lock().take().unwrap_or_default()),
            ConnectionIo::Synthetic => Err(not_connected()),
        }
    }

    pub fn send_head(&self, head: ResponseHead) -> io::Result<()> {
        match self {
            ConnectionIo::Network(net) => {
                let mut slot = net.head.lock();
                if slot.is_some() {
                    return Err(io::Error::new(io::ErrorKind::AlreadyExists, "response head already sent"));
                }
                *slot = Some(head);
                Ok(())
            }
            ConnectionIo::Synthetic => Err(not_connected()),
        }
    }

    pub fn send_chain(&self, data: &[u8]) -> io::Result<usize> {
        match self {
            ConnectionIo::Network(net) => {
                net.body.lock().extend_from_slice(data);
                Ok(data.len())
            }
            ConnectionIo::Synthetic => Err(not_connected()),
        }
    }

    /// Hand the buffered response to the front end.
    pub fn complete(&self) -> io::Result<()> {
        match self {
            ConnectionIo::Network(net) => {
                let responder = net
                    .responder
                    .lock()
                    .take()
                    .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "response already completed"))?;
                let head = net.head.lock().take().unwrap_or(ResponseHead {
                    status: 500,
                    headers: Vec::new(),
                    content_length: Some(0),
                });
                let body = std::mem::take(&mut *net.body.lock()).freeze();
                responder
                    .send(ResponseParts { head, body })
                    .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client went away"))
            }
            ConnectionIo::Synthetic => Err(not_connected()),
        }
    }
}

/// HTTP state attached to a connection.
#[derive(Debug)]
pub struct HttpConnection {
    pub server: Arc<ServerConf>,
}

/// Per-connection log record.
#[derive(Debug, Clone, Copy)]
pub struct LogContext {
    pub connection: ConnectionId,
    pub synthetic: bool,
}

/// Failure to open a connection.
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("no free connection slot")]
    NoSlot,
    #[error(transparent)]
    NoMemory(#[from] PoolExhausted),
}

/// An engine connection.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    io: ConnectionIo,
    log: EngineLog,
    http: Option<HttpConnection>,
    log_ctx: Option<LogContext>,
    buffer: Option<BytesMut>,
    slot: ConnectionSlot,
    pool: Pool,
}

impl Connection {
    /// Bind an acquired slot, a pool and an I/O variant.
    pub fn new(slot: ConnectionSlot, pool: Pool, io: ConnectionIo, log: &EngineLog) -> Self {
        let id = slot.id();
        let log = log.connection(id, io.is_synthetic());
        Self {
            id,
            io,
            log,
            http: None,
            log_ctx: None,
            buffer: None,
            slot,
            pool,
        }
    }

    /// Open a network connection for `server` on the cycle.
    pub fn open(cycle: &Cycle, io: NetworkIo, server: Arc<ServerConf>) -> Result<Connection, OpenError> {
        let pool = Pool::create(REQUEST_POOL_SIZE, cycle.budget(), cycle.pool_stats())?;
        let slot = cycle.slots().acquire().ok_or(OpenError::NoSlot)?;
        let mut conn = Connection::new(slot, pool, ConnectionIo::Network(io), cycle.log());
        conn.attach_http(server)?;
        conn.attach_log_ctx()?;
        conn.attach_buffer()?;
        Ok(conn)
    }

    pub fn attach_http(&mut self, server: Arc<ServerConf>) -> Result<(), PoolExhausted> {
        self.pool.reserve(size_of::<HttpConnection>())?;
        self.http = Some(HttpConnection { server });
        Ok(())
    }

    pub fn attach_log_ctx(&mut self) -> Result<(), PoolExhausted> {
        self.pool.reserve(size_of::<LogContext>())?;
        self.log_ctx = Some(LogContext {
            connection: self.id,
            synthetic: self.io.is_synthetic(),
        });
        Ok(())
    }

    pub fn attach_buffer(&mut self) -> Result<(), PoolExhausted> {
        self.pool.reserve(size_of::<BytesMut>())?;
        self.buffer = Some(BytesMut::new());
        Ok(())
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn io(&self) -> &ConnectionIo {
        &self.io
    }

    pub fn is_synthetic(&self) -> bool {
        self.io.is_synthetic()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        match &self.io {
            ConnectionIo::Network(net) => Some(net.peer()),
            ConnectionIo::Synthetic => None,
        }
    }

    pub fn log(&self) -> &EngineLog {
        &self.log
    }

    pub fn http(&self) -> Option<&HttpConnection> {
        self.http.as_ref()
    }

    pub fn log_ctx(&self) -> Option<&LogContext> {
        self.log_ctx.as_ref()
    }

    pub fn has_buffer(&self) -> bool {
        self.buffer.is_some()
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}
