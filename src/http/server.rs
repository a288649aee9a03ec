//! HTTP server setup and request entry.
//!
//! # Responsibilities
//! - Create the Axum router feeding every request into the engine
//! - Open an engine connection and request per accepted request
//! - Park requests a handler left pending
//! - Forward proxied locations to upstream peers
//! - Turn the engine's buffered response back into an Axum response

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, Request, Response as HttpResponse, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use bytes::Bytes;
use hyper::body::Incoming;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;

use crate::code::Code;
use crate::cycle::Cycle;
use crate::http::phases::Dispatch;
use crate::http::request::{Buf, Header, HttpRequest};
use crate::lifecycle::shutdown::ShutdownSignal;
use crate::load_balancer::{PeerConnection, PeerState, Upstream};
use crate::net::connection::{Connection, NetworkIo, OpenError, ResponseParts};

/// Headers that describe one hop and are not forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "host",
    "content-length",
];

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub cycle: Arc<Cycle>,
    pub listen: SocketAddr,
    pub client: Client<HttpConnector, Body>,
}

/// HTTP front end for one listen address.
pub struct HttpServer {
    router: Router,
    listen: SocketAddr,
}

impl HttpServer {
    pub fn new(cycle: Arc<Cycle>, listen: SocketAddr) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        let state = AppState { cycle, listen, client };
        Self {
            router: Self::build_router(state),
            listen,
        }
    }

    fn build_router(state: AppState) -> Router {
        Router::new()
            .route("/{*path}", any(engine_handler))
            .route("/", any(engine_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    /// Serve until `shutdown` fires, then drain in-flight requests.
    pub async fn run(self, listener: TcpListener, mut shutdown: ShutdownSignal) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, configured = %self.listen, "HTTP server starting");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await?;

        tracing::info!(address = %addr, "HTTP server stopped");
        Ok(())
    }
}

/// Entry point for every accepted request.
async fn engine_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let cycle = &state.cycle;
    let (parts, body) = request.into_parts();

    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| parts.uri.host());
    let Some(server) = cycle.servers().resolve(state.listen, host) else {
        tracing::warn!(listen = %state.listen, host = ?host, "No server for request");
        return (StatusCode::NOT_FOUND, "no server\n").into_response();
    };

    let limit = cycle.config().http.client_max_body_size;
    let body = match axum::body::to_bytes(body, limit).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(peer = %peer, error = %e, "Client body rejected");
            return (StatusCode::PAYLOAD_TOO_LARGE, "request entity too large\n").into_response();
        }
    };

    let (tx, rx) = oneshot::channel();
    let connection = match Connection::open(cycle, NetworkIo::new(peer, body, tx), Arc::clone(&server)) {
        Ok(conn) => conn,
        Err(OpenError::NoSlot) => {
            tracing::warn!(peer = %peer, "Worker connections exhausted");
            return (StatusCode::SERVICE_UNAVAILABLE, "worker connections exhausted\n").into_response();
        }
        Err(OpenError::NoMemory(e)) => {
            tracing::error!(peer = %peer, error = %e, "Connection allocation failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let mut r = match HttpRequest::from_network(cycle, connection, server, &parts) {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(peer = %peer, error = %e, "Request allocation failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    tracing::debug!(request = %r.id(), method = %r.method, uri = %r.uri, "Request accepted");

    match r.run_phases() {
        Dispatch::Done(rc) => {
            r.finalize(rc);
            if !r.is_finalized() {
                cycle.park(r);
            }
        }
        Dispatch::Proxy(upstream) => proxy(r, upstream, &state.client).await,
    }

    match rx.await {
        Ok(parts) => into_response(parts),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Forward `r` to a peer of `upstream`, trying further peers on failure.
async fn proxy(mut r: HttpRequest, upstream: Arc<Upstream>, client: &Client<HttpConnector, Body>) {
    // A phase handler may have read the body already.
    let body = match r.request_body.as_ref() {
        Some(body) => body.to_bytes(),
        None => r.connection().io().recv().unwrap_or_default(),
    };
    let mut pc = PeerConnection::new(upstream.tries());
    let mut attempts = 0;

    loop {
        attempts += 1;
        let mut data = r.upstream.take().unwrap_or_else(|| upstream.init_peer());
        let rc = data.get(&r, &mut pc);
        r.upstream = Some(data);

        let addr = match (rc, pc.sockaddr) {
            (Code::OK, Some(addr)) => addr,
            (Code::OK, None) => {
                tracing::error!(request = %r.id(), upstream = %upstream.name(), "Peer selected without address");
                release_peer(&mut r, &mut pc, PeerState::FAILED);
                r.finalize(Code::status(500));
                return;
            }
            (Code::DECLINED, _) => {
                release_peer(&mut r, &mut pc, PeerState::FAILED);
                if pc.tries == 0 || attempts >= upstream.tries() {
                    r.finalize(Code::status(502));
                    return;
                }
                continue;
            }
            (Code::BUSY, _) => {
                release_peer(&mut r, &mut pc, PeerState::FAILED);
                r.finalize(Code::status(502));
                return;
            }
            (rc, _) => {
                tracing::warn!(request = %r.id(), upstream = %upstream.name(), rc = ?rc, "Peer selection failed");
                release_peer(&mut r, &mut pc, PeerState::FAILED);
                r.finalize(Code::status(500));
                return;
            }
        };

        let outbound = match upstream_request(&r, addr, body.clone()) {
            Ok(req) => req,
            Err(e) => {
                tracing::error!(request = %r.id(), error = %e, "Failed to build upstream request");
                release_peer(&mut r, &mut pc, PeerState::NONE);
                r.finalize(Code::status(500));
                return;
            }
        };

        let peer_name = pc.name.clone().unwrap_or_default();
        let failure = match client.request(outbound).await {
            Ok(response) => {
                let (head, incoming) = response.into_parts();
                match read_upstream_body(incoming).await {
                    Ok(bytes) => {
                        release_peer(&mut r, &mut pc, PeerState::NONE);
                        relay_response(&mut r, head, bytes);
                        return;
                    }
                    Err(e) => e.to_string(),
                }
            }
            Err(e) => e.to_string(),
        };

        tracing::warn!(
            request = %r.id(),
            upstream = %upstream.name(),
            peer = %peer_name,
            attempt = attempts,
            error = %failure,
            "Upstream attempt failed"
        );
        release_peer(&mut r, &mut pc, PeerState::FAILED);
        if pc.tries == 0 || attempts >= upstream.tries() {
            r.finalize(Code::status(502));
            return;
        }
    }
}

async fn read_upstream_body(incoming: Incoming) -> Result<Bytes, axum::Error> {
    axum::body::to_bytes(Body::new(incoming), usize::MAX).await
}

fn release_peer(r: &mut HttpRequest, pc: &mut PeerConnection, state: PeerState) {
    if let Some(data) = r.upstream.as_mut() {
        data.free(pc, state);
    }
}

fn upstream_request(r: &HttpRequest, addr: SocketAddr, body: Bytes) -> Result<Request<Body>, axum::http::Error> {
    let uri = match &r.args {
        Some(args) => format!("http://{}{}?{}", addr, r.uri, args),
        None => format!("http://{}{}", addr, r.uri),
    };
    let mut builder = Request::builder().method(r.method.clone()).uri(uri);
    for h in r.headers_in.iter() {
        if !HOP_BY_HOP.contains(&h.lowcase_key.as_str()) {
            builder = builder.header(h.key.as_str(), h.value.as_str());
        }
    }
    builder.body(Body::from(body))
}

fn relay_response(r: &mut HttpRequest, head: axum::http::response::Parts, body: Bytes) {
    r.headers_out.status = head.status.as_u16();
    r.headers_out.content_length = Some(body.len() as u64);
    for (name, value) in &head.headers {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        r.headers_out.headers.push(Header::new(
            name.as_str(),
            String::from_utf8_lossy(value.as_bytes()).into_owned(),
        ));
    }

    let rc = r.send_header();
    if rc != Code::OK {
        r.finalize(rc);
        return;
    }
    let rc = r.output_filter(Some(Buf::last(body)));
    r.finalize(rc);
}

fn into_response(parts: ResponseParts) -> Response {
    let mut builder = HttpResponse::builder().status(parts.head.status);
    for (name, value) in &parts.head.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    match builder.body(Body::from(parts.body)) {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(error = %e, "Invalid response from handler");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
