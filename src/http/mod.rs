//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, body buffering, engine connection)
//!     → request.rs (engine request bound to the connection)
//!     → phases.rs (host handlers per phase; proxy_pass → upstream)
//!     → response.rs (header, output filter, finalize)
//!     → buffered response back through Axum
//!
//! Host code (synthetic requests, subrequests):
//!     → subrequest.rs (in-memory children run by run_posted_requests)
//! ```

pub mod phases;
pub mod request;
pub mod response;
pub mod server;
pub mod subrequest;

pub use axum::http::Method;
pub use phases::{Dispatch, HttpHandler, PhaseHandlers};
pub use request::{Buf, Header, HeaderList, HeaderTarget, HeadersOut, HttpRequest, RequestBody, RequestId, RequestKind};
pub use server::HttpServer;
pub use subrequest::{InitSubrequest, PostSubrequest, MAX_SUBREQUEST_DEPTH};
