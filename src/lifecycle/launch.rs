//! Threaded launch of engine instances.
//!
//! # Responsibilities
//! - Identify the execution unit (role and worker id) the engine runs on
//! - Deep-copy launch arguments so the caller may free its own
//! - Start an engine on a new OS thread (primary) or as a job on a host
//!   scheduler (secondary)
//!
//! # Design Decisions
//! - Argument copies use fallible reservation; a partial copy is released by
//!   drop before the error is returned
//! - A launch reports its exit code through a one-shot channel; the thread
//!   itself is detached
//! - Secondary roles never create threads; the scheduler decides where the
//!   job runs

use std::cell::Cell;
use std::ffi::{CStr, CString};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread;

use tokio::sync::oneshot;

use crate::code::Code;
use crate::facade::Facade;
use crate::lifecycle::startup;

/// Which side of the host's threading model an engine runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Engine on an OS thread it owns.
    Primary,
    /// Engine run as a job by the host's worker scheduler.
    Secondary,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Primary => write!(f, "primary"),
            Role::Secondary => write!(f, "secondary"),
        }
    }
}

/// Role and worker id of the running engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecutionUnit {
    pub role: Role,
    pub worker_id: u32,
}

thread_local! {
    static CURRENT_UNIT: Cell<Option<ExecutionUnit>> = const { Cell::new(None) };
}

impl ExecutionUnit {
    pub fn new(role: Role, worker_id: u32) -> Self {
        Self { role, worker_id }
    }

    /// The unit entered on this thread, if any.
    pub fn current() -> Option<ExecutionUnit> {
        CURRENT_UNIT.with(Cell::get)
    }

    /// Mark this thread as running `self` until the guard drops.
    pub fn enter(self) -> UnitGuard {
        let prev = CURRENT_UNIT.with(|current| current.replace(Some(self)));
        UnitGuard {
            prev,
            _not_send: PhantomData,
        }
    }
}

/// Restores the previous execution unit on drop.
#[derive(Debug)]
pub struct UnitGuard {
    prev: Option<ExecutionUnit>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for UnitGuard {
    fn drop(&mut self) {
        CURRENT_UNIT.with(|current| current.set(self.prev));
    }
}

/// Launch failure.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("out of memory copying launch arguments")]
    OutOfMemory,
    #[error("launch argument {index} contains a NUL byte")]
    InteriorNul { index: usize },
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("no worker job scheduler installed")]
    NoScheduler,
    #[error("worker job scheduler rejected the job ({0})")]
    Rejected(Code),
    #[error("facade is no longer alive")]
    FacadeGone,
    #[error("an engine is already running on this facade")]
    AlreadyRunning,
}

/// Owned copy of an engine command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchArgs {
    argv: Vec<CString>,
}

impl LaunchArgs {
    /// Deep-copy `args`.
    pub fn copy_from<S: AsRef<str>>(args: &[S]) -> Result<Self, LaunchError> {
        let mut argv = Vec::new();
        argv.try_reserve_exact(args.len())
            .map_err(|_| LaunchError::OutOfMemory)?;

        for (index, arg) in args.iter().enumerate() {
            let bytes = arg.as_ref().as_bytes();
            let mut owned = Vec::new();
            owned
                .try_reserve_exact(bytes.len() + 1)
                .map_err(|_| LaunchError::OutOfMemory)?;
            owned.extend_from_slice(bytes);
            argv.push(CString::new(owned).map_err(|_| LaunchError::InteriorNul { index })?);
        }
        Ok(Self { argv })
    }

    pub fn len(&self) -> usize {
        self.argv.len()
    }

    pub fn is_empty(&self) -> bool {
        self.argv.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CStr> {
        self.argv.iter().map(CString::as_c_str)
    }

    /// Arguments as strings for the command-line parser.
    pub fn to_strings(&self) -> Vec<String> {
        self.iter().map(|arg| arg.to_string_lossy().into_owned()).collect()
    }
}

/// A job handed to the host scheduler. Returns the engine exit code.
pub type WorkerJob = Box<dyn FnOnce() -> i32 + Send + 'static>;

/// Host-provided scheduler for secondary-role engines.
pub trait WorkerJobScheduler: Send + Sync {
    /// Queue `job` on cluster `cluster_id`. Anything but `OK` rejects it.
    fn register_job(&self, cluster_id: u32, job: WorkerJob) -> Code;
}

/// Handle to a launched engine.
#[derive(Debug)]
pub struct LaunchHandle {
    unit: ExecutionUnit,
    exit: oneshot::Receiver<i32>,
}

impl LaunchHandle {
    pub fn unit(&self) -> ExecutionUnit {
        self.unit
    }

    /// Block until the engine exits. `None` if its job was dropped unrun.
    ///
    /// Must not be called from inside an async runtime.
    pub fn wait(self) -> Option<i32> {
        self.exit.blocking_recv().ok()
    }

    /// Exit code if the engine has already exited.
    pub fn try_exit_code(&mut self) -> Option<i32> {
        self.exit.try_recv().ok()
    }

    /// Wait for the exit code from async code.
    pub async fn exit_code(self) -> Option<i32> {
        self.exit.await.ok()
    }
}

/// Run the engine for `unit` on the current thread.
pub(crate) fn run_unit(facade: &Arc<Facade>, unit: ExecutionUnit, args: &LaunchArgs) -> i32 {
    let _unit = unit.enter();
    startup::run(facade, unit, args)
}

/// Start an engine on a new thread or as a scheduler job.
pub(crate) fn spawn(
    facade: &Arc<Facade>,
    role: Role,
    cluster_id: u32,
    worker_id: u32,
    args: LaunchArgs,
) -> Result<LaunchHandle, LaunchError> {
    let unit = ExecutionUnit::new(role, worker_id);
    let (tx, rx) = oneshot::channel();
    let engine = Arc::clone(facade);
    let job = move || {
        let code = run_unit(&engine, unit, &args);
        let _ = tx.send(code);
        code
    };

    match role {
        Role::Primary => {
            thread::Builder::new()
                .name(format!("engine-worker-{}", worker_id))
                .spawn(job)
                .map_err(LaunchError::Spawn)?;
        }
        Role::Secondary => {
            let scheduler = facade.worker_scheduler().ok_or(LaunchError::NoScheduler)?;
            let rc = scheduler.register_job(cluster_id, Box::new(job));
            if rc != Code::OK {
                return Err(LaunchError::Rejected(rc));
            }
        }
    }

    tracing::info!(role = %role, worker_id, cluster_id, "Engine launched");
    Ok(LaunchHandle { unit, exit: rx })
}
