//! Request phase pipeline.
//!
//! # Responsibilities
//! - Store handlers registered per phase during configuration
//! - Drive a request through the phases in order
//!
//! # Design Decisions
//! - Handlers are shared closures; the table is frozen into the cycle
//! - In every phase `DECLINED` moves to the next handler and `OK` ends the
//!   phase; anything else is the request's result
//! - A location with `proxy_pass` hands the content phase to the proxy

use std::fmt;
use std::sync::Arc;

use crate::code::{Code, Phase};
use crate::http::request::HttpRequest;
use crate::load_balancer::Upstream;

/// A phase handler.
pub type HttpHandler = Arc<dyn Fn(&mut HttpRequest) -> Code + Send + Sync>;

/// Where the pipeline left the request.
#[derive(Debug)]
pub enum Dispatch {
    /// Finalize the request with this code.
    Done(Code),
    /// Forward the request to this upstream.
    Proxy(Arc<Upstream>),
}

/// Handlers per phase, in registration order.
#[derive(Clone, Default)]
pub struct PhaseHandlers {
    phases: [Vec<HttpHandler>; Phase::COUNT],
}

impl PhaseHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, phase: Phase, handler: HttpHandler) {
        self.phases[phase.index()].push(handler);
    }

    pub fn handlers(&self, phase: Phase) -> &[HttpHandler] {
        &self.phases[phase.index()]
    }

    /// Run every phase up to and including content.
    pub fn run(&self, r: &mut HttpRequest) -> Dispatch {
        for phase in Phase::ALL {
            match phase {
                Phase::Content => return self.run_content(r),
                Phase::Log => break,
                _ => {}
            }

            for handler in self.handlers(phase) {
                match handler(r) {
                    Code::DECLINED => continue,
                    Code::OK => break,
                    rc => {
                        tracing::debug!(request = %r.id(), ?phase, rc = %rc, "Phase ended request");
                        return Dispatch::Done(rc);
                    }
                }
            }
        }
        Dispatch::Done(Code::status(404))
    }

    fn run_content(&self, r: &mut HttpRequest) -> Dispatch {
        if let Some(upstream) = &r.location().proxy_pass {
            return Dispatch::Proxy(Arc::clone(upstream));
        }
        for handler in self.handlers(Phase::Content) {
            match handler(r) {
                Code::DECLINED => continue,
                rc => return Dispatch::Done(rc),
            }
        }
        Dispatch::Done(Code::status(404))
    }
}

impl fmt::Debug for PhaseHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for phase in Phase::ALL {
            map.entry(&phase, &self.handlers(phase).len());
        }
        map.finish()
    }
}

impl HttpRequest {
    /// Run this request through its cycle's phase handlers.
    pub fn run_phases(&mut self) -> Dispatch {
        let phases = Arc::clone(self.cycle.phases());
        phases.run(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle::tests::{synthetic_request, test_cycle_with};

    const CONF: &str = r#"
        [[http.server]]
        listen = "127.0.0.1:18081"
        server_id = 3
    "#;

    #[test]
    fn declined_falls_through_and_ok_ends_phase() {
        let (_facade, cycle) = test_cycle_with(CONF, |cf| {
            cf.add_http_handler(Phase::Access, |_r| Code::DECLINED);
            cf.add_http_handler(Phase::Access, |r| {
                r.uri = "/checked".to_string();
                Code::OK
            });
            cf.add_http_handler(Phase::Access, |_r| Code::status(403));
            cf.add_http_handler(Phase::Content, |r| {
                if r.uri == "/checked" {
                    Code::status(204)
                } else {
                    Code::ERROR
                }
            });
        });
        let mut r = synthetic_request(&cycle, 3);
        match r.run_phases() {
            Dispatch::Done(rc) => assert_eq!(rc, Code::status(204)),
            other => panic!("unexpected dispatch: {:?}", other),
        }
    }

    #[test]
    fn no_content_handler_is_404() {
        let (_facade, cycle) = test_cycle_with(CONF, |_| {});
        let mut r = synthetic_request(&cycle, 3);
        assert!(matches!(r.run_phases(), Dispatch::Done(rc) if rc == Code::status(404)));
    }

    #[test]
    fn early_phase_status_ends_request() {
        let (_facade, cycle) = test_cycle_with(CONF, |cf| {
            cf.add_http_handler(Phase::Rewrite, |_r| Code::status(301));
            cf.add_http_handler(Phase::Content, |_r| Code::OK);
        });
        let mut r = synthetic_request(&cycle, 3);
        assert!(matches!(r.run_phases(), Dispatch::Done(rc) if rc == Code::status(301)));
    }
}
