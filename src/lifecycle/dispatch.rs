//! Lifecycle dispatcher.
//!
//! # Responsibilities
//! - Forward each engine lifecycle event to the host's upcall table
//! - Enforce the event order for one execution unit
//! - Turn a failing init hook into an error that aborts startup
//!
//! # Design Decisions
//! - Init events need an installed table; a missing table is a failure
//! - Exit events are best effort: they fire only when the matching init
//!   stage was reached and never fail
//! - Each stage fires at most once

use std::sync::Arc;

use crate::code::Code;
use crate::cycle::{ConfContext, Cycle};
use crate::facade::upcall::UpcallTable;
use crate::facade::Facade;
use crate::observability::EngineLog;

/// Lifecycle position of one execution unit, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Created,
    MasterInit,
    Configured,
    ModuleInit,
    ProcessInit,
    ThreadInit,
    ThreadExit,
    ProcessExit,
    MasterExit,
}

/// A lifecycle hook refused to continue.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("no upcall table installed")]
    NoUpcallTable,
    #[error("{hook} hook failed with {code}")]
    Failed { hook: &'static str, code: Code },
    #[error("{hook} called out of order (stage {stage:?})")]
    OutOfOrder { hook: &'static str, stage: Stage },
}

/// Drives the host's lifecycle hooks for one execution unit.
#[derive(Debug)]
pub struct LifecycleDispatcher {
    facade: Arc<Facade>,
    stage: Stage,
}

impl LifecycleDispatcher {
    pub fn new(facade: Arc<Facade>) -> Self {
        Self {
            facade,
            stage: Stage::Created,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn init_master(&mut self, log: &EngineLog) -> Result<(), HookError> {
        self.init(Stage::Created, Stage::MasterInit, "init_master", |table, api| {
            table.call_init_master(api, log)
        })
    }

    pub fn postconfiguration(&mut self, cf: &mut ConfContext) -> Result<(), HookError> {
        self.init(Stage::MasterInit, Stage::Configured, "http_postconfiguration", |table, api| {
            table.call_http_postconfiguration(api, cf)
        })
    }

    pub fn init_module(&mut self, cycle: &Cycle) -> Result<(), HookError> {
        self.init(Stage::Configured, Stage::ModuleInit, "init_module", |table, api| {
            table.call_init_module(api, cycle)
        })
    }

    pub fn init_process(&mut self, cycle: &Cycle) -> Result<(), HookError> {
        self.init(Stage::ModuleInit, Stage::ProcessInit, "init_process", |table, api| {
            table.call_init_process(api, cycle)
        })
    }

    pub fn init_thread(&mut self, cycle: &Cycle) -> Result<(), HookError> {
        self.init(Stage::ProcessInit, Stage::ThreadInit, "init_thread", |table, api| {
            table.call_init_thread(api, cycle)
        })
    }

    pub fn exit_thread(&mut self, cycle: &Cycle) {
        if self.stage == Stage::ThreadInit {
            self.stage = Stage::ThreadExit;
            if let Some(table) = self.exit_table("exit_thread") {
                table.call_exit_thread(&self.facade, cycle);
            }
        }
    }

    pub fn exit_process(&mut self, cycle: &Cycle) {
        if self.stage >= Stage::ProcessInit && self.stage < Stage::ProcessExit {
            self.stage = Stage::ProcessExit;
            if let Some(table) = self.exit_table("exit_process") {
                table.call_exit_process(&self.facade, cycle);
            }
        }
    }

    pub fn exit_master(&mut self, cycle: Option<&Cycle>) {
        if self.stage >= Stage::MasterInit && self.stage < Stage::MasterExit {
            self.stage = Stage::MasterExit;
            if let Some(table) = self.exit_table("exit_master") {
                table.call_exit_master(&self.facade, cycle);
            }
        }
    }

    /// Host loop-tick hint in milliseconds; negative means no preference.
    pub fn loop_tick(&self) -> i64 {
        self.facade
            .get_upcall()
            .and_then(|table| table.call_loop_tick(&self.facade))
            .unwrap_or(-1)
    }

    fn exit_table(&self, hook: &'static str) -> Option<Arc<UpcallTable>> {
        let table = self.facade.get_upcall();
        if table.is_none() {
            tracing::warn!(hook, "No upcall table installed, skipping exit hook");
        }
        table
    }

    fn init<F>(&mut self, from: Stage, to: Stage, hook: &'static str, call: F) -> Result<(), HookError>
    where
        F: FnOnce(&UpcallTable, &Facade) -> Option<Code>,
    {
        if self.stage != from {
            return Err(HookError::OutOfOrder { hook, stage: self.stage });
        }
        let table = self.facade.get_upcall().ok_or(HookError::NoUpcallTable)?;
        // A hook that fails still moves the stage, so its exits run.
        self.stage = to;

        match call(&*table, &*self.facade) {
            None | Some(Code::OK) => Ok(()),
            Some(code) => {
                tracing::error!(hook, code = %code, "Lifecycle hook failed");
                Err(HookError::Failed { hook, code })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::cycle::tests::test_cycle;
    use crate::facade::upcall::UpcallTable;

    #[derive(Default)]
    struct Trace(Mutex<Vec<&'static str>>);

    fn record(table: UpcallTable) -> UpcallTable {
        fn push(ctx: &crate::facade::upcall::HostContext, event: &'static str) {
            if let Some(trace) = ctx.downcast_ref::<Trace>() {
                trace.0.lock().push(event);
            }
        }
        table
            .with_init_master(|_, ctx, _| {
                push(ctx, "init_master");
                Code::OK
            })
            .with_http_postconfiguration(|_, ctx, _| {
                push(ctx, "postconfiguration");
                Code::OK
            })
            .with_init_module(|_, ctx, _| {
                push(ctx, "init_module");
                Code::OK
            })
            .with_init_process(|_, ctx, _| {
                push(ctx, "init_process");
                Code::OK
            })
            .with_exit_process(|_, ctx, _| push(ctx, "exit_process"))
            .with_exit_master(|_, ctx, cycle| {
                push(ctx, if cycle.is_some() { "exit_master+cycle" } else { "exit_master" })
            })
    }

    fn trace(facade: &Facade) -> Vec<&'static str> {
        let table = facade.get_upcall().unwrap();
        let trace = table.context_as::<Trace>().unwrap();
        let events = trace.0.lock().clone();
        events
    }

    const CONF: &str = r#"
        [[http.server]]
        listen = "127.0.0.1:18089"
    "#;

    #[test]
    fn full_sequence_in_order() {
        let (facade, cycle) = test_cycle(CONF);
        assert_eq!(facade.set_upcall(record(UpcallTable::new(Trace::default()))), Code::OK);

        let mut dispatcher = LifecycleDispatcher::new(Arc::clone(&facade));
        dispatcher.init_master(&EngineLog::process()).unwrap();
        let config = crate::config::parse_config(CONF).unwrap();
        let mut cf = ConfContext::parse(&facade, config, EngineLog::process()).unwrap();
        dispatcher.postconfiguration(&mut cf).unwrap();
        dispatcher.init_module(&cycle).unwrap();
        dispatcher.init_process(&cycle).unwrap();
        // No init_thread hook: absent hooks succeed.
        dispatcher.init_thread(&cycle).unwrap();
        dispatcher.exit_thread(&cycle);
        dispatcher.exit_process(&cycle);
        dispatcher.exit_master(Some(&cycle));
        // One-shot.
        dispatcher.exit_master(Some(&cycle));

        assert_eq!(
            trace(&facade),
            vec![
                "init_master",
                "postconfiguration",
                "init_module",
                "init_process",
                "exit_process",
                "exit_master+cycle"
            ]
        );
        assert_eq!(dispatcher.stage(), Stage::MasterExit);
    }

    #[test]
    fn failing_hook_aborts_and_exits_still_fire() {
        let (facade, cycle) = test_cycle(CONF);
        facade.set_upcall(record(UpcallTable::new(Trace::default())).with_init_process(|_, _, _| Code::ERROR));

        let mut dispatcher = LifecycleDispatcher::new(Arc::clone(&facade));
        dispatcher.init_master(&EngineLog::process()).unwrap();
        let config = crate::config::parse_config(CONF).unwrap();
        let mut cf = ConfContext::parse(&facade, config, EngineLog::process()).unwrap();
        dispatcher.postconfiguration(&mut cf).unwrap();
        dispatcher.init_module(&cycle).unwrap();

        let err = dispatcher.init_process(&cycle).unwrap_err();
        assert!(matches!(err, HookError::Failed { hook: "init_process", code: Code::ERROR }));
        assert!(matches!(
            dispatcher.init_thread(&cycle),
            Err(HookError::OutOfOrder { .. })
        ));

        dispatcher.exit_thread(&cycle);
        dispatcher.exit_process(&cycle);
        dispatcher.exit_master(None);
        let events = trace(&facade);
        assert_eq!(&events[events.len() - 2..], &["exit_process", "exit_master"]);
    }

    #[test]
    fn missing_table_fails_init_and_tick_is_negative() {
        let facade = Facade::new();
        let mut dispatcher = LifecycleDispatcher::new(Arc::clone(&facade));
        assert!(matches!(
            dispatcher.init_master(&EngineLog::process()),
            Err(HookError::NoUpcallTable)
        ));
        assert_eq!(dispatcher.loop_tick(), -1);
        // Exit events never fail and do nothing before init.
        dispatcher.exit_master(None);
        assert_eq!(dispatcher.stage(), Stage::Created);
    }

    #[test]
    fn exits_without_table_still_advance() {
        let (facade, cycle) = test_cycle(CONF);
        let mut dispatcher = LifecycleDispatcher::new(Arc::clone(&facade));
        dispatcher.stage = Stage::ThreadInit;

        dispatcher.exit_thread(&cycle);
        assert_eq!(dispatcher.stage(), Stage::ThreadExit);
        dispatcher.exit_process(&cycle);
        assert_eq!(dispatcher.stage(), Stage::ProcessExit);
        dispatcher.exit_master(Some(&cycle));
        assert_eq!(dispatcher.stage(), Stage::MasterExit);
        assert!(facade.get_upcall().is_none());
    }

    #[test]
    fn loop_tick_forwards_host_value() {
        let facade = Facade::new();
        facade.set_upcall(UpcallTable::new(()).with_loop_tick(|_, _| 250));
        let dispatcher = LifecycleDispatcher::new(Arc::clone(&facade));
        assert_eq!(dispatcher.loop_tick(), 250);
    }
}
