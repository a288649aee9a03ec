//! Startup orchestration.
//!
//! # Responsibilities
//! - Parse the engine command line
//! - Load and validate configuration
//! - Run the lifecycle hooks in order around the event loop
//! - Map the outcome to an exit code
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal and yields exit code 1
//! - Exit hooks run for every init stage that was reached, even on failure
//! - `-t` stops after configuration and module init

use std::path::PathBuf;
use std::sync::Arc;

use clap::error::ErrorKind;
use clap::Parser;

use crate::code::LogLevel;
use crate::config::load_config;
use crate::cycle::{ConfContext, Cycle};
use crate::error::EngineError;
use crate::facade::Facade;
use crate::lifecycle::dispatch::LifecycleDispatcher;
use crate::lifecycle::event_loop;
use crate::lifecycle::launch::{ExecutionUnit, LaunchArgs};
use crate::observability::EngineLog;

/// Engine command line.
#[derive(Debug, Parser)]
#[command(name = "engine", about = "Embeddable HTTP engine")]
pub struct EngineArgs {
    /// Configuration file
    #[arg(short = 'c', long = "conf", default_value = "conf/engine.toml")]
    pub conf: PathBuf,

    /// Test the configuration and exit
    #[arg(short = 't', long = "test")]
    pub test: bool,
}

/// Run one engine to completion on the current thread. Returns the exit code.
pub fn run(facade: &Arc<Facade>, unit: ExecutionUnit, args: &LaunchArgs) -> i32 {
    let args = match EngineArgs::try_parse_from(args.to_strings()) {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return 0;
        }
        Err(e) => {
            tracing::error!(error = %e, "Invalid engine arguments");
            return 1;
        }
    };

    match run_engine(facade, unit, &args) {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, role = %unit.role, worker_id = unit.worker_id, "Engine failed");
            1
        }
    }
}

fn run_engine(facade: &Arc<Facade>, unit: ExecutionUnit, args: &EngineArgs) -> Result<(), EngineError> {
    let mut dispatcher = LifecycleDispatcher::new(Arc::clone(facade));
    dispatcher.init_master(&EngineLog::new(LogLevel::default(), unit))?;

    let mut built = None;
    let result = run_cycle(facade, &mut dispatcher, unit, args, &mut built);
    dispatcher.exit_master(built.as_deref());
    result
}

fn run_cycle(
    facade: &Arc<Facade>,
    dispatcher: &mut LifecycleDispatcher,
    unit: ExecutionUnit,
    args: &EngineArgs,
    built: &mut Option<Arc<Cycle>>,
) -> Result<(), EngineError> {
    let config = load_config(&args.conf)?;
    tracing::info!(conf = %args.conf.display(), servers = config.http.server.len(), "Configuration loaded");

    let log = EngineLog::new(config.log.level, unit);
    let mut cf = ConfContext::parse(facade, config, log)?;
    dispatcher.postconfiguration(&mut cf)?;

    let cycle = Arc::new(cf.into_cycle(unit));
    *built = Some(Arc::clone(&cycle));
    dispatcher.init_module(&cycle)?;

    if args.test {
        tracing::info!(conf = %args.conf.display(), "Configuration test is successful");
        return Ok(());
    }

    facade.attach_cycle(Arc::clone(&cycle))?;
    let result = serve(dispatcher, &cycle);
    facade.detach_cycle(&cycle);
    cycle.drain_parked();
    result
}

fn serve(dispatcher: &mut LifecycleDispatcher, cycle: &Arc<Cycle>) -> Result<(), EngineError> {
    let result = dispatcher
        .init_process(cycle)
        .and_then(|()| dispatcher.init_thread(cycle))
        .map_err(EngineError::from)
        .and_then(|()| event_loop::run(cycle, dispatcher));

    dispatcher.exit_thread(cycle);
    dispatcher.exit_process(cycle);
    result
}
