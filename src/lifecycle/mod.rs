//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Launch (launch.rs):
//!     main / main_new_thread → copy args → thread or scheduler job
//!
//! Startup (startup.rs):
//!     Parse args → init_master → load config → postconfiguration
//!     → cycle → init_module → init_process → init_thread → event loop
//!
//! Event loop (event_loop.rs):
//!     Bind listeners → loop_tick / notify / signals → shutdown → drain
//!
//! Exit (dispatch.rs):
//!     exit_thread → exit_process → exit_master (only for stages reached)
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then hooks, then listeners
//! - Ordered shutdown: stop accept, drop pending requests, exit hooks
//! - Every stage transition goes through the dispatcher

pub mod dispatch;
pub mod event_loop;
pub mod launch;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use dispatch::{HookError, LifecycleDispatcher, Stage};
pub use launch::{ExecutionUnit, LaunchArgs, LaunchError, LaunchHandle, Role, WorkerJob, WorkerJobScheduler};
pub use shutdown::{Shutdown, ShutdownSignal};
pub use startup::EngineArgs;
