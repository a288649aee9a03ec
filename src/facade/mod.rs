//! Host-facing engine facade.
//!
//! # Data Flow
//! ```text
//! Host
//!     → Facade::set_upcall (upcall.rs)        install hooks once
//!     → Facade::main / main_new_thread          lifecycle + event loop
//!         → hooks: init_master … exit_master    (lifecycle/dispatch.rs)
//!         → postconfiguration: add_http_handler
//!         → requests: read body, send header, output, finalize
//!         → proxy_pass + upcall: get_upstream_peer (load_balancer/upcall.rs)
//!     → new_http_dummy_request (dummy.rs)       requests without a client
//!     → resume_request / notify / shutdown      from any thread
//! ```
//!
//! # Design Decisions
//! - One facade runs at most one cycle at a time; several facades can run
//!   side by side on different threads
//! - Locations hold a weak handle back to the facade that parsed them, so a
//!   request always finds its own facade
//! - The upcall table is write-once

pub mod binding;
pub mod dummy;
pub mod server_id;
pub mod upcall;

use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use arc_swap::ArcSwapOption;
use bytes::BytesMut;
use parking_lot::Mutex;

use crate::code::{Code, LogLevel, Phase};
use crate::cycle::{ConfContext, Cycle};
use crate::http::request::{Buf, HeaderTarget, HttpRequest, RequestId};
use crate::http::subrequest::{InitSubrequest, PostSubrequest};
use crate::http::Method;
use crate::lifecycle::launch::{self, ExecutionUnit, LaunchArgs, LaunchError, LaunchHandle, Role, WorkerJob, WorkerJobScheduler};
use crate::observability::{metrics, EngineLog};
use crate::pool::Pool;

pub use binding::{LocationBinding, UNSET_ID};
pub use dummy::DummyRequestError;
pub use server_id::{ServerIdError, ServerIdRegistry, MAX_SERVER_ID};
pub use upcall::{HostContext, UpcallTable};

static API: OnceLock<Arc<Facade>> = OnceLock::new();

/// The process-wide default facade.
pub fn api() -> &'static Arc<Facade> {
    API.get_or_init(Facade::new)
}

/// Engine facade: the host's handle on one engine instance.
pub struct Facade {
    upcall: OnceLock<Arc<UpcallTable>>,
    scheduler: OnceLock<Arc<dyn WorkerJobScheduler>>,
    cycle: ArcSwapOption<Cycle>,
    attach: Mutex<()>,
    this: Weak<Facade>,
}

impl Facade {
    pub fn new() -> Arc<Facade> {
        Arc::new_cyclic(|this| Facade {
            upcall: OnceLock::new(),
            scheduler: OnceLock::new(),
            cycle: ArcSwapOption::empty(),
            attach: Mutex::new(()),
            this: this.clone(),
        })
    }

    // Identity

    /// The facade owning `r`'s configuration.
    pub fn get_api_from_req(r: &HttpRequest) -> Option<Arc<Facade>> {
        binding::get_api_from_req(r)
    }

    /// The upcall id of `r`'s location, or `UNSET_ID`.
    pub fn get_loc_id_from_req(r: &HttpRequest) -> i64 {
        binding::get_loc_id_from_req(r)
    }

    // Upcall table

    /// Install the host's hooks. Only the first table is kept; later calls
    /// return `ERROR`.
    pub fn set_upcall(&self, table: UpcallTable) -> Code {
        match self.upcall.set(Arc::new(table)) {
            Ok(()) => Code::OK,
            Err(_) => {
                tracing::warn!("Upcall table already installed");
                Code::ERROR
            }
        }
    }

    pub fn get_upcall(&self) -> Option<Arc<UpcallTable>> {
        self.upcall.get().cloned()
    }

    /// Install the scheduler used for secondary-role launches.
    pub fn set_worker_scheduler(&self, scheduler: Arc<dyn WorkerJobScheduler>) -> Code {
        match self.scheduler.set(scheduler) {
            Ok(()) => Code::OK,
            Err(_) => Code::ERROR,
        }
    }

    pub(crate) fn worker_scheduler(&self) -> Option<Arc<dyn WorkerJobScheduler>> {
        self.scheduler.get().cloned()
    }

    // Logging and wake-up

    /// Write to the running cycle's log, or the process log before startup.
    pub fn log(&self, level: LogLevel, message: &str) {
        match self.cycle() {
            Some(cycle) => cycle.log().write(level, message),
            None => EngineLog::process().write(level, message),
        }
    }

    /// Wake the event loop. No-op when nothing is running.
    pub fn notify(&self) {
        if let Some(cycle) = self.cycle() {
            cycle.notify();
        }
    }

    // Configuration

    /// Register a phase handler. Valid inside the postconfiguration hook.
    pub fn add_http_handler<F>(&self, cf: &mut ConfContext, phase: Phase, handler: F) -> Code
    where
        F: Fn(&mut HttpRequest) -> Code + Send + Sync + 'static,
    {
        cf.add_http_handler(phase, handler)
    }

    // Request operations

    /// Zeroed buffer of `size` bytes charged to `pool`.
    pub fn pcalloc(&self, pool: &Pool, size: usize) -> Option<BytesMut> {
        pool.pcalloc(size)
    }

    pub fn http_read_client_request_body<F>(&self, r: &mut HttpRequest, post_handler: F) -> Code
    where
        F: FnOnce(&mut HttpRequest),
    {
        r.read_client_request_body(post_handler)
    }

    pub fn http_send_header(&self, r: &mut HttpRequest) -> Code {
        r.send_header()
    }

    pub fn http_buf_output_filter(&self, r: &mut HttpRequest, buf: Option<Buf>) -> Code {
        r.output_filter(buf)
    }

    pub fn http_finalize_request(&self, r: &mut HttpRequest, rc: Code) {
        r.finalize(rc)
    }

    /// Append a copy of `key: value` to `r`'s input or output headers.
    pub fn add_http_header(&self, r: &mut HttpRequest, target: HeaderTarget, key: &str, value: &str) -> Code {
        r.add_header(target, key, value)
    }

    // Internal calls

    /// Fabricate a request for the server registered as `server_id`.
    pub fn new_http_dummy_request(&self, server_id: isize) -> Result<HttpRequest, DummyRequestError> {
        let result = match self.cycle() {
            Some(cycle) => dummy::new_dummy_request(&cycle, server_id),
            None => Err(DummyRequestError::NotRunning),
        };
        match &result {
            Ok(_) => metrics::record_synthetic_request("created"),
            Err(e) => {
                tracing::warn!(server_id, error = %e, "Synthetic request failed");
                metrics::record_synthetic_request("failed");
            }
        }
        result
    }

    pub fn http_run_posted_requests(&self, r: &mut HttpRequest) {
        r.run_posted_requests()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn http_subrequest(
        &self,
        r: &mut HttpRequest,
        method: Method,
        uri: &str,
        args: Option<&str>,
        body: Option<Buf>,
        init: Option<InitSubrequest>,
        post: Option<PostSubrequest>,
    ) -> Code {
        r.subrequest(method, uri, args, body, init, post)
    }

    // Runtime

    /// Continue a request a handler left pending.
    ///
    /// `f` returns the code to finalize with; `AGAIN` keeps it parked.
    /// `DECLINED` when no such request is parked.
    pub fn resume_request<F>(&self, id: RequestId, f: F) -> Code
    where
        F: FnOnce(&mut HttpRequest) -> Code,
    {
        let Some(cycle) = self.cycle() else {
            return Code::DECLINED;
        };
        let Some(mut r) = cycle.take_parked(id) else {
            return Code::DECLINED;
        };

        let rc = f(&mut r);
        r.finalize(rc);
        if !r.is_finalized() {
            cycle.park(r);
        }
        Code::OK
    }

    /// Ask the running engine to stop. `DECLINED` when nothing is running.
    pub fn shutdown(&self) -> Code {
        match self.cycle() {
            Some(cycle) => {
                cycle.shutdown().trigger();
                Code::OK
            }
            None => Code::DECLINED,
        }
    }

    pub fn is_running(&self) -> bool {
        self.cycle.load().is_some()
    }

    /// The running cycle, if any.
    pub fn cycle(&self) -> Option<Arc<Cycle>> {
        self.cycle.load_full()
    }

    // Bootstrap

    /// Run an engine on the calling thread. Returns its exit code.
    pub fn main<S: AsRef<str>>(&self, args: &[S]) -> i32 {
        let Some(facade) = self.this.upgrade() else {
            return 1;
        };
        match LaunchArgs::copy_from(args) {
            Ok(args) => launch::run_unit(&facade, ExecutionUnit::new(Role::Primary, 0), &args),
            Err(e) => {
                tracing::error!(error = %e, "Failed to copy engine arguments");
                1
            }
        }
    }

    /// Start an engine on a new thread (primary) or as a scheduler job
    /// (secondary). The arguments are copied before returning.
    pub fn main_new_thread<S: AsRef<str>>(
        &self,
        role: Role,
        cluster_id: u32,
        worker_id: u32,
        args: &[S],
    ) -> Result<LaunchHandle, LaunchError> {
        let facade = self.this.upgrade().ok_or(LaunchError::FacadeGone)?;
        let args = LaunchArgs::copy_from(args)?;
        launch::spawn(&facade, role, cluster_id, worker_id, args)
    }

    /// Queue a job on the host scheduler.
    pub fn reg_worker_job(&self, cluster_id: u32, job: WorkerJob) -> Code {
        match self.worker_scheduler() {
            Some(scheduler) => scheduler.register_job(cluster_id, job),
            None => Code::ERROR,
        }
    }

    pub(crate) fn attach_cycle(&self, cycle: Arc<Cycle>) -> Result<(), LaunchError> {
        let _guard = self.attach.lock();
        if self.cycle.load().is_some() {
            return Err(LaunchError::AlreadyRunning);
        }
        self.cycle.store(Some(cycle));
        Ok(())
    }

    pub(crate) fn detach_cycle(&self, cycle: &Arc<Cycle>) {
        let _guard = self.attach.lock();
        let current = self.cycle.load_full();
        if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, cycle)) {
            self.cycle.store(None);
        }
    }
}

impl fmt::Debug for Facade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Facade")
            .field("upcall", &self.upcall.get())
            .field("scheduler", &self.scheduler.get().is_some())
            .field("running", &self.is_running())
            .finish()
    }
}
