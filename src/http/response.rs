//! Response emission and request finalization.
//!
//! # Responsibilities
//! - Mark the response head as sent
//! - Run output buffers through the filter: in memory for subrequests,
//!   to the connection for main requests
//! - Finalize a request exactly once, choosing the final status
//!
//! # Design Decisions
//! - The head is staged until the first flush so a handler can still set
//!   headers between `send_header` and its first body buffer
//! - Finalization rules:
//!   - `DONE` and `AGAIN` leave the request pending
//!   - `OK`/`DECLINED` complete what was sent, or answer 500 when nothing was
//!   - `ERROR`/`BUSY`/`ABORT` answer 500 unless the head already went out
//!   - a status >= 200 with no head sent becomes a special response
//! - Synthetic main requests run the same rules; their flushes fail on the
//!   stub I/O and are only logged

use axum::http::{Method, StatusCode};

use crate::code::{Code, Phase};
use crate::http::request::{Buf, Header, HttpRequest, RequestKind};
use crate::net::connection::ResponseHead;
use crate::observability::metrics;

impl HttpRequest {
    /// Mark the response head as sent. Fails on a second call.
    pub fn send_header(&mut self) -> Code {
        if self.header_sent {
            tracing::warn!(request = %self.id, "Header already sent");
            return Code::ERROR;
        }
        if self.finalized.is_some() {
            return Code::ERROR;
        }

        self.header_sent = true;
        if self.headers_out.status == 0 {
            self.headers_out.status = 200;
        }

        if self.is_main() && self.header_only {
            self.last_buf_seen = true;
            return self.flush_output();
        }
        Code::OK
    }

    /// Pass one buffer (or a bare flush when `None`) through the output filter.
    pub fn output_filter(&mut self, buf: Option<Buf>) -> Code {
        if !self.header_sent {
            tracing::warn!(request = %self.id, "Output before header");
            return Code::ERROR;
        }

        let flush = match buf {
            Some(buf) => {
                if !self.header_only {
                    self.out.extend_from_slice(&buf.data);
                }
                if buf.last_buf {
                    self.last_buf_seen = true;
                }
                buf.flush || buf.last_buf
            }
            None => true,
        };

        if self.is_main() && flush {
            return self.flush_output();
        }
        Code::OK
    }

    /// Write the staged head and buffered body to the connection.
    fn flush_output(&mut self) -> Code {
        let io = self.connection.io();

        if !self.head_flushed {
            let head = ResponseHead {
                status: self.headers_out.status,
                headers: self
                    .headers_out
                    .headers
                    .iter()
                    .map(|h| (h.key.clone(), h.value.clone()))
                    .collect(),
                content_length: self.headers_out.content_length,
            };
            if let Err(e) = io.send_head(head) {
                tracing::debug!(request = %self.id, error = %e, "Header write failed");
                return Code::ERROR;
            }
            self.head_flushed = true;
        }

        if !self.out.is_empty() {
            let data = self.out.split().freeze();
            if let Err(e) = io.send_chain(&data) {
                tracing::debug!(request = %self.id, error = %e, "Body write failed");
                return Code::ERROR;
            }
        }
        Code::OK
    }

    /// Finalize with `rc`. Later calls are ignored.
    pub fn finalize(&mut self, rc: Code) {
        if self.finalized.is_some() {
            tracing::debug!(request = %self.id, rc = %rc, "Request already finalized");
            return;
        }
        if rc == Code::DONE || rc == Code::AGAIN {
            return;
        }

        let status = if self.header_sent {
            self.headers_out.status
        } else {
            match rc {
                Code::OK | Code::DECLINED if self.headers_out.status != 0 => {
                    let status = self.headers_out.status;
                    if self.headers_out.content_length.is_none() {
                        self.headers_out.content_length = Some(0);
                    }
                    self.send_header();
                    status
                }
                other => {
                    let status = other.as_status().filter(|s| *s >= 200).unwrap_or(500);
                    self.special_response(status);
                    status
                }
            }
        };

        if self.is_main() && (!self.head_flushed || !self.out.is_empty()) {
            self.last_buf_seen = true;
            if self.flush_output() != Code::OK && !self.is_synthetic() {
                tracing::warn!(request = %self.id, "Failed to flush response");
            }
        }

        // Set before the log phase so a log handler cannot re-enter.
        self.finalized = Some((rc, status));

        let phases = std::sync::Arc::clone(self.cycle.phases());
        for handler in phases.handlers(Phase::Log) {
            handler(self);
        }

        let kind = match (self.kind, self.is_synthetic()) {
            (RequestKind::Subrequest { .. }, _) => "subrequest",
            (RequestKind::Main, true) => "synthetic",
            (RequestKind::Main, false) => "network",
        };
        metrics::record_request(kind, status);
        tracing::debug!(request = %self.id, kind, status, rc = %rc, "Request finalized");

        if self.is_main() && !self.is_synthetic() {
            if let Err(e) = self.connection.io().complete() {
                tracing::debug!(request = %self.id, error = %e, "Response not delivered");
            }
        }
    }

    /// Engine-generated response for `status` with a short text body.
    fn special_response(&mut self, status: u16) {
        self.headers_out.status = status;
        let body = if status >= 300 && !self.header_only && self.method != Method::HEAD {
            let reason = StatusCode::from_u16(status)
                .ok()
                .and_then(|s| s.canonical_reason())
                .unwrap_or("");
            format!("{} {}\n", status, reason)
        } else {
            String::new()
        };

        self.headers_out.content_length = Some(body.len() as u64);
        if !body.is_empty() {
            self.headers_out
                .headers
                .push(Header::new("Content-Type", "text/plain"));
        }

        self.send_header();
        if !body.is_empty() {
            self.output_filter(Some(Buf::last(body)));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use bytes::Bytes;
    use tokio::sync::oneshot;

    use super::*;
    use crate::cycle::tests::test_cycle;
    use crate::net::connection::{Connection, NetworkIo, ResponseParts};

    const CONF: &str = r#"
        [[http.server]]
        listen = "127.0.0.1:18080"
        server_id = 0
    "#;

    fn network_request() -> (HttpRequest, oneshot::Receiver<ResponseParts>) {
        let (_facade, cycle) = test_cycle(CONF);
        let server = Arc::clone(cycle.servers().iter().next().unwrap());
        let peer: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let (tx, rx) = oneshot::channel();
        let conn = Connection::open(&cycle, NetworkIo::new(peer, Bytes::from_static(b"body"), tx), Arc::clone(&server))
            .unwrap();
        let location = Arc::clone(server.default_location());
        let r = HttpRequest::alloc(&cycle, Arc::new(conn), server, location, RequestKind::Main).unwrap();
        (r, rx)
    }

    #[test]
    fn ok_with_body_delivers_response() {
        let (mut r, mut rx) = network_request();
        r.headers_out.status = 201;
        assert_eq!(r.send_header(), Code::OK);
        assert_eq!(r.output_filter(Some(Buf::last("created"))), Code::OK);
        r.finalize(Code::OK);

        let parts = rx.try_recv().unwrap();
        assert_eq!(parts.head.status, 201);
        assert_eq!(parts.body, Bytes::from_static(b"created"));
        assert_eq!(r.final_status(), Some(201));
    }

    #[test]
    fn ok_without_anything_is_500() {
        let (mut r, mut rx) = network_request();
        r.finalize(Code::OK);
        assert_eq!(rx.try_recv().unwrap().head.status, 500);
    }

    #[test]
    fn status_code_becomes_special_response() {
        let (mut r, mut rx) = network_request();
        r.finalize(Code::status(404));
        let parts = rx.try_recv().unwrap();
        assert_eq!(parts.head.status, 404);
        assert_eq!(parts.body, Bytes::from_static(b"404 Not Found\n"));
    }

    #[test]
    fn pending_codes_do_not_finalize() {
        let (mut r, mut rx) = network_request();
        r.finalize(Code::DONE);
        r.finalize(Code::AGAIN);
        assert!(!r.is_finalized());
        assert!(rx.try_recv().is_err());

        r.finalize(Code::BUSY);
        assert_eq!(r.final_status(), Some(500));
        // One-shot.
        r.finalize(Code::status(204));
        assert_eq!(r.final_status(), Some(500));
    }

    #[test]
    fn second_header_fails() {
        let (mut r, _rx) = network_request();
        assert_eq!(r.send_header(), Code::OK);
        assert_eq!(r.send_header(), Code::ERROR);
    }

    #[test]
    fn dropped_request_answers_500() {
        let (r, mut rx) = network_request();
        drop(r);
        assert_eq!(rx.try_recv().unwrap().head.status, 500);
    }
}
