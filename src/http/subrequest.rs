//! In-memory subrequests.
//!
//! # Responsibilities
//! - Create a child request sharing the parent's connection and pool
//! - Queue it on the parent until the host runs posted requests
//! - Report each child's result to its post handler
//!
//! # Design Decisions
//! - Output of a subrequest is kept in memory; it never reaches the client
//! - Nesting is capped so a subrequest loop fails instead of recursing forever
//! - A child still pending after its phases is finalized with 500; there is
//!   no later event that could resume it

use std::mem::size_of;
use std::sync::Arc;

use axum::http::Method;

use crate::code::Code;
use crate::http::phases::Dispatch;
use crate::http::request::{Buf, HttpRequest, RequestBody, RequestKind};

/// Deepest allowed subrequest nesting.
pub const MAX_SUBREQUEST_DEPTH: usize = 50;

/// Called on the new subrequest before it is queued.
pub type InitSubrequest = Box<dyn FnOnce(&mut HttpRequest) + Send>;

/// Called with the parent and the finished subrequest, and the code it was
/// finalized with.
pub type PostSubrequest = Box<dyn FnOnce(&mut HttpRequest, &mut HttpRequest, Code) + Send>;

/// A queued subrequest.
pub(crate) struct PostedSubrequest {
    request: HttpRequest,
    post: Option<PostSubrequest>,
}

impl HttpRequest {
    /// Queue an in-memory subrequest for `uri`.
    pub fn subrequest(
        &mut self,
        method: Method,
        uri: &str,
        args: Option<&str>,
        body: Option<Buf>,
        init: Option<InitSubrequest>,
        post: Option<PostSubrequest>,
    ) -> Code {
        let depth = match self.kind {
            RequestKind::Main => 1,
            RequestKind::Subrequest { depth } => depth + 1,
        };
        if depth > MAX_SUBREQUEST_DEPTH {
            tracing::error!(request = %self.id, uri, "Subrequests cycle while processing");
            return Code::ERROR;
        }

        let copy_len = uri.len() + args.map_or(0, str::len);
        if self.pool().reserve(copy_len).is_err() {
            return Code::ERROR;
        }

        let location = self.server.find_location(uri);
        let mut sr = match HttpRequest::alloc(
            &self.cycle,
            Arc::clone(&self.connection),
            Arc::clone(&self.server),
            location,
            RequestKind::Subrequest { depth },
        ) {
            Ok(sr) => sr,
            Err(_) => return Code::ERROR,
        };

        sr.method = method;
        sr.uri = uri.to_string();
        sr.args = args.map(str::to_string);
        sr.headers_in = self.headers_in.clone();
        if let Some(body) = body {
            if sr.pool().reserve(size_of::<RequestBody>()).is_err() {
                return Code::ERROR;
            }
            sr.request_body = Some(RequestBody::from_bytes(body.data));
        }

        if let Some(init) = init {
            init(&mut sr);
        }

        tracing::debug!(parent = %self.id, request = %sr.id, uri, depth, "Subrequest posted");
        self.posted.push_back(PostedSubrequest { request: sr, post });
        Code::OK
    }

    /// Run queued subrequests to completion, in order.
    pub fn run_posted_requests(&mut self) {
        while let Some(PostedSubrequest { mut request, post }) = self.posted.pop_front() {
            let rc = match request.run_phases() {
                Dispatch::Done(rc) => rc,
                Dispatch::Proxy(upstream) => {
                    tracing::warn!(
                        request = %request.id,
                        upstream = %upstream.name(),
                        "Subrequest cannot be proxied"
                    );
                    Code::status(502)
                }
            };
            request.finalize(rc);
            if !request.is_finalized() {
                tracing::warn!(request = %request.id, "Subrequest left pending");
                request.finalize(Code::status(500));
            }

            request.run_posted_requests();

            if let Some(post) = post {
                let code = request.final_code().unwrap_or(Code::ERROR);
                post(self, &mut request, code);
            }
        }
    }

    /// Number of queued subrequests.
    pub fn posted_len(&self) -> usize {
        self.posted.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use parking_lot::Mutex;

    use super::*;
    use crate::code::Phase;
    use crate::cycle::tests::{synthetic_request, test_cycle_with};

    const CONF: &str = r#"
        [[http.server]]
        listen = "127.0.0.1:18082"
        server_id = 1

        [[http.server.location]]
        path = "/echo"
    "#;

    #[test]
    fn subrequest_runs_in_memory() {
        let (_facade, cycle) = test_cycle_with(CONF, |cf| {
            cf.add_http_handler(Phase::Content, |r| {
                let body = r.request_body.as_ref().map(RequestBody::to_bytes).unwrap_or_default();
                r.headers_out.status = 200;
                r.send_header();
                r.output_filter(Some(Buf::last(body)));
                Code::OK
            });
        });
        let mut parent = synthetic_request(&cycle, 1);

        let seen = Arc::new(Mutex::new(None));
        let seen_in_post = Arc::clone(&seen);
        let rc = parent.subrequest(
            Method::POST,
            "/echo",
            Some("a=1"),
            Some(Buf::last(Bytes::from_static(b"ping"))),
            Some(Box::new(|sr: &mut HttpRequest| sr.headers_out.status = 0)),
            Some(Box::new(move |_parent: &mut HttpRequest, sr: &mut HttpRequest, rc: Code| {
                *seen_in_post.lock() = Some((rc, sr.final_status(), sr.response_body().to_vec(), sr.args.clone()));
            })),
        );
        assert_eq!(rc, Code::OK);
        assert_eq!(parent.posted_len(), 1);

        parent.run_posted_requests();
        assert_eq!(parent.posted_len(), 0);

        let (rc, status, body, args) = seen.lock().take().unwrap();
        assert_eq!(rc, Code::OK);
        assert_eq!(status, Some(200));
        assert_eq!(body, b"ping");
        assert_eq!(args.as_deref(), Some("a=1"));
        // The parent is untouched.
        assert!(!parent.is_finalized());
    }

    #[test]
    fn nesting_is_capped() {
        let (_facade, cycle) = test_cycle_with(CONF, |_| {});
        let mut r = synthetic_request(&cycle, 1);
        r.kind = RequestKind::Subrequest { depth: MAX_SUBREQUEST_DEPTH };
        assert_eq!(r.subrequest(Method::GET, "/echo", None, None, None, None), Code::ERROR);
    }

    #[test]
    fn posted_requests_run_in_order() {
        let order = Arc::new(AtomicUsize::new(0));
        let (_facade, cycle) = test_cycle_with(CONF, |_| {});
        let mut parent = synthetic_request(&cycle, 1);

        for expected in 0..3 {
            let order = Arc::clone(&order);
            parent.subrequest(
                Method::GET,
                "/echo",
                None,
                None,
                None,
                Some(Box::new(move |_p: &mut HttpRequest, sr: &mut HttpRequest, _rc: Code| {
                    assert_eq!(order.fetch_add(1, Ordering::SeqCst), expected);
                    // No content handler.
                    assert_eq!(sr.final_status(), Some(404));
                })),
            );
        }
        parent.run_posted_requests();
        assert_eq!(order.load(Ordering::SeqCst), 3);
    }
}
