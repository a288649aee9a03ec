//! The engine request object.
//!
//! # Responsibilities
//! - Generate unique request IDs for tracing and resumption
//! - Hold request line, headers, body and response state
//! - Tie every request to its connection (and so its pool and log)
//! - Read the client body on behalf of content handlers
//!
//! # Design Decisions
//! - `HttpRequest` is `Send` but never shared; the thread driving it owns it
//! - Subrequests share their parent's connection and pool
//! - A network main request dropped before finalization is answered with
//!   500 so the client never hangs

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::http::{request::Parts, Method};
use bytes::{Bytes, BytesMut};

use crate::code::Code;
use crate::cycle::Cycle;
use crate::http::subrequest::PostedSubrequest;
use crate::load_balancer::UpstreamPeerData;
use crate::net::connection::Connection;
use crate::observability::EngineLog;
use crate::pool::{Pool, PoolExhausted};
use crate::routing::{LocationConf, ServerConf};

static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        Self(REQUEST_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// One header line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub key: String,
    pub value: String,
    pub lowcase_key: String,
}

impl Header {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let lowcase_key = key.to_ascii_lowercase();
        Self {
            key,
            value: value.into(),
            lowcase_key,
        }
    }
}

/// Ordered header list; duplicates allowed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList(Vec<Header>);

impl HeaderList {
    pub fn push(&mut self, header: Header) {
        self.0.push(header);
    }

    /// First value for `name`, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.0
            .iter()
            .find(|h| h.lowcase_key == name)
            .map(|h| h.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Which header list `add_http_header` appends to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderTarget {
    In,
    Out,
}

/// Response status and headers.
#[derive(Debug, Clone, Default)]
pub struct HeadersOut {
    /// Zero until a handler or the engine sets it.
    pub status: u16,
    pub content_length: Option<u64>,
    pub headers: HeaderList,
}

/// An output buffer.
#[derive(Debug, Clone, Default)]
pub struct Buf {
    pub data: Bytes,
    /// No more output follows.
    pub last_buf: bool,
    /// Push pending output now.
    pub flush: bool,
}

impl Buf {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            last_buf: false,
            flush: false,
        }
    }

    /// Final buffer of the response.
    pub fn last(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            last_buf: true,
            flush: false,
        }
    }
}

/// Request body as read from the client (or given to a subrequest).
#[derive(Debug, Clone, Default)]
pub struct RequestBody {
    pub bufs: Vec<Bytes>,
}

impl RequestBody {
    pub fn from_bytes(data: Bytes) -> Self {
        let bufs = if data.is_empty() { Vec::new() } else { vec![data] };
        Self { bufs }
    }

    pub fn len(&self) -> usize {
        self.bufs.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Body as one contiguous buffer.
    pub fn to_bytes(&self) -> Bytes {
        match self.bufs.as_slice() {
            [] => Bytes::new(),
            [single] => single.clone(),
            many => {
                let mut joined = BytesMut::with_capacity(self.len());
                for buf in many {
                    joined.extend_from_slice(buf);
                }
                joined.freeze()
            }
        }
    }
}

/// Main request or subrequest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// The request is its own main request.
    Main,
    /// In-memory subrequest at the given nesting depth (1 = child of main).
    Subrequest { depth: usize },
}

/// An engine request.
pub struct HttpRequest {
    pub(crate) id: RequestId,
    pub(crate) kind: RequestKind,
    pub(crate) cycle: Arc<Cycle>,
    pub(crate) connection: Arc<Connection>,
    pub(crate) server: Arc<ServerConf>,
    pub(crate) location: Arc<LocationConf>,

    pub method: Method,
    pub uri: String,
    pub args: Option<String>,
    pub headers_in: HeadersIn,
    pub headers_out: HeadersOut,
    /// Send the head only.
    pub header_only: bool,
    pub request_body: Option<RequestBody>,
    /// Host data attached to this request.
    pub data: Option<Box<dyn Any + Send>>,

    pub(crate) header_sent: bool,
    pub(crate) head_flushed: bool,
    pub(crate) last_buf_seen: bool,
    pub(crate) out: BytesMut,
    pub(crate) posted: VecDeque<PostedSubrequest>,
    pub(crate) finalized: Option<(Code, u16)>,
    pub(crate) upstream: Option<UpstreamPeerData>,
}

/// Incoming headers.
pub type HeadersIn = HeaderList;

impl HttpRequest {
    /// Allocate a request bound to `connection`.
    pub(crate) fn alloc(
        cycle: &Arc<Cycle>,
        connection: Arc<Connection>,
        server: Arc<ServerConf>,
        location: Arc<LocationConf>,
        kind: RequestKind,
    ) -> Result<HttpRequest, PoolExhausted> {
        connection.pool().reserve(size_of::<HttpRequest>())?;
        Ok(HttpRequest {
            id: RequestId::new(),
            kind,
            cycle: Arc::clone(cycle),
            connection,
            server,
            location,
            method: Method::GET,
            uri: "/".to_string(),
            args: None,
            headers_in: HeaderList::default(),
            headers_out: HeadersOut::default(),
            header_only: false,
            request_body: None,
            data: None,
            header_sent: false,
            head_flushed: false,
            last_buf_seen: false,
            out: BytesMut::new(),
            posted: VecDeque::new(),
            finalized: None,
            upstream: None,
        })
    }

    /// Build a main request from an accepted HTTP request head.
    pub(crate) fn from_network(
        cycle: &Arc<Cycle>,
        connection: Connection,
        server: Arc<ServerConf>,
        parts: &Parts,
    ) -> Result<HttpRequest, PoolExhausted> {
        let location = server.find_location(parts.uri.path());
        let mut r = HttpRequest::alloc(cycle, Arc::new(connection), server, location, RequestKind::Main)?;
        r.method = parts.method.clone();
        r.uri = parts.uri.path().to_string();
        r.args = parts.uri.query().map(str::to_string);
        r.header_only = parts.method == Method::HEAD;
        for (name, value) in &parts.headers {
            r.headers_in.push(Header::new(
                name.as_str(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            ));
        }
        Ok(r)
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn is_main(&self) -> bool {
        self.kind == RequestKind::Main
    }

    /// True when the request has no real peer.
    pub fn is_synthetic(&self) -> bool {
        self.connection.is_synthetic()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn pool(&self) -> &Pool {
        self.connection.pool()
    }

    pub fn log(&self) -> &EngineLog {
        self.connection.log()
    }

    pub fn cycle(&self) -> &Arc<Cycle> {
        &self.cycle
    }

    pub fn server(&self) -> &Arc<ServerConf> {
        &self.server
    }

    pub fn location(&self) -> &Arc<LocationConf> {
        &self.location
    }

    pub fn header_sent(&self) -> bool {
        self.header_sent
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.is_some()
    }

    /// Status the request was finalized with.
    pub fn final_status(&self) -> Option<u16> {
        self.finalized.map(|(_, status)| status)
    }

    /// Code the request was finalized with.
    pub fn final_code(&self) -> Option<Code> {
        self.finalized.map(|(code, _)| code)
    }

    /// Output kept in memory (subrequests, or not yet flushed).
    pub fn response_body(&self) -> &[u8] {
        &self.out
    }

    /// Read the client body, then call `post_handler`.
    ///
    /// Returns an HTTP status (>= 300) when the body cannot be provided.
    pub fn read_client_request_body<F>(&mut self, post_handler: F) -> Code
    where
        F: FnOnce(&mut HttpRequest),
    {
        if self.request_body.is_none() {
            let data = if self.is_main() && !self.is_synthetic() {
                match self.connection.io().recv() {
                    Ok(data) => data,
                    Err(e) => {
                        tracing::warn!(request = %self.id, error = %e, "Failed to read client body");
                        return Code::status(400);
                    }
                }
            } else {
                Bytes::new()
            };

            if self.pool().reserve(size_of::<RequestBody>()).is_err() {
                return Code::status(500);
            }
            self.request_body = Some(RequestBody::from_bytes(data));
        }

        post_handler(self);
        Code::OK
    }

    /// Copy a header into the request's pool and append it.
    pub fn add_header(&mut self, target: HeaderTarget, key: &str, value: &str) -> Code {
        if self.pool().reserve(key.len() * 2 + value.len()).is_err() {
            return Code::ERROR;
        }
        let header = Header::new(key, value);
        match target {
            HeaderTarget::In => self.headers_in.push(header),
            HeaderTarget::Out => self.headers_out.headers.push(header),
        }
        Code::OK
    }
}

impl fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRequest")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("connection", &self.connection.id())
            .field("synthetic", &self.is_synthetic())
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("status", &self.headers_out.status)
            .field("finalized", &self.finalized)
            .finish_non_exhaustive()
    }
}

impl Drop for HttpRequest {
    fn drop(&mut self) {
        if self.finalized.is_none() && self.is_main() && !self.is_synthetic() {
            tracing::warn!(request = %self.id, "Request dropped before finalization");
            self.finalize(Code::status(500));
        }
    }
}
