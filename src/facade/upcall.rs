//! The host's upcall table.
//!
//! # Responsibilities
//! - Hold one optional hook per lifecycle event, plus the peer and
//!   loop-tick hooks
//! - Carry the host context handed back to every hook
//!
//! # Design Decisions
//! - Built once with `with_*` methods, then installed and never mutated
//! - Every hook receives the facade it was installed on, so a host can run
//!   several engines with one set of functions
//! - `call_*` helpers return `None` when the hook is absent; callers decide
//!   what absence means

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::code::Code;
use crate::cycle::{ConfContext, Cycle};
use crate::facade::Facade;
use crate::http::request::HttpRequest;
use crate::load_balancer::PeerConnection;
use crate::observability::EngineLog;

/// Opaque host data passed back to every hook.
pub type HostContext = Arc<dyn Any + Send + Sync>;

type InitMasterHook = Box<dyn Fn(&Facade, &HostContext, &EngineLog) -> Code + Send + Sync>;
type CycleInitHook = Box<dyn Fn(&Facade, &HostContext, &Cycle) -> Code + Send + Sync>;
type CycleExitHook = Box<dyn Fn(&Facade, &HostContext, &Cycle) + Send + Sync>;
type ExitMasterHook = Box<dyn Fn(&Facade, &HostContext, Option<&Cycle>) + Send + Sync>;
type PostconfigurationHook = Box<dyn Fn(&Facade, &HostContext, &mut ConfContext) -> Code + Send + Sync>;
type UpstreamPeerHook = Box<dyn Fn(&Facade, &HostContext, &HttpRequest, i64, &mut PeerConnection) -> Code + Send + Sync>;
type LoopTickHook = Box<dyn Fn(&Facade, &HostContext) -> i64 + Send + Sync>;

/// Host hooks and context.
pub struct UpcallTable {
    context: HostContext,
    init_master: Option<InitMasterHook>,
    init_module: Option<CycleInitHook>,
    init_process: Option<CycleInitHook>,
    init_thread: Option<CycleInitHook>,
    exit_thread: Option<CycleExitHook>,
    exit_process: Option<CycleExitHook>,
    exit_master: Option<ExitMasterHook>,
    http_postconfiguration: Option<PostconfigurationHook>,
    get_upstream_peer: Option<UpstreamPeerHook>,
    loop_tick: Option<LoopTickHook>,
}

impl UpcallTable {
    /// Empty table carrying `context`.
    pub fn new<T: Any + Send + Sync>(context: T) -> Self {
        Self::with_context(Arc::new(context))
    }

    pub fn with_context(context: HostContext) -> Self {
        Self {
            context,
            init_master: None,
            init_module: None,
            init_process: None,
            init_thread: None,
            exit_thread: None,
            exit_process: None,
            exit_master: None,
            http_postconfiguration: None,
            get_upstream_peer: None,
            loop_tick: None,
        }
    }

    pub fn context(&self) -> &HostContext {
        &self.context
    }

    /// The context as `T`, if that is its type.
    pub fn context_as<T: Any>(&self) -> Option<&T> {
        (*self.context).downcast_ref::<T>()
    }

    pub fn with_init_master<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Facade, &HostContext, &EngineLog) -> Code + Send + Sync + 'static,
    {
        self.init_master = Some(Box::new(hook));
        self
    }

    pub fn with_init_module<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Facade, &HostContext, &Cycle) -> Code + Send + Sync + 'static,
    {
        self.init_module = Some(Box::new(hook));
        self
    }

    pub fn with_init_process<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Facade, &HostContext, &Cycle) -> Code + Send + Sync + 'static,
    {
        self.init_process = Some(Box::new(hook));
        self
    }

    pub fn with_init_thread<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Facade, &HostContext, &Cycle) -> Code + Send + Sync + 'static,
    {
        self.init_thread = Some(Box::new(hook));
        self
    }

    pub fn with_exit_thread<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Facade, &HostContext, &Cycle) + Send + Sync + 'static,
    {
        self.exit_thread = Some(Box::new(hook));
        self
    }

    pub fn with_exit_process<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Facade, &HostContext, &Cycle) + Send + Sync + 'static,
    {
        self.exit_process = Some(Box::new(hook));
        self
    }

    pub fn with_exit_master<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Facade, &HostContext, Option<&Cycle>) + Send + Sync + 'static,
    {
        self.exit_master = Some(Box::new(hook));
        self
    }

    pub fn with_http_postconfiguration<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Facade, &HostContext, &mut ConfContext) -> Code + Send + Sync + 'static,
    {
        self.http_postconfiguration = Some(Box::new(hook));
        self
    }

    pub fn with_get_upstream_peer<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Facade, &HostContext, &HttpRequest, i64, &mut PeerConnection) -> Code + Send + Sync + 'static,
    {
        self.get_upstream_peer = Some(Box::new(hook));
        self
    }

    pub fn with_loop_tick<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Facade, &HostContext) -> i64 + Send + Sync + 'static,
    {
        self.loop_tick = Some(Box::new(hook));
        self
    }

    pub fn has_get_upstream_peer(&self) -> bool {
        self.get_upstream_peer.is_some()
    }

    pub(crate) fn call_init_master(&self, api: &Facade, log: &EngineLog) -> Option<Code> {
        self.init_master.as_ref().map(|hook| hook(api, &self.context, log))
    }

    pub(crate) fn call_init_module(&self, api: &Facade, cycle: &Cycle) -> Option<Code> {
        self.init_module.as_ref().map(|hook| hook(api, &self.context, cycle))
    }

    pub(crate) fn call_init_process(&self, api: &Facade, cycle: &Cycle) -> Option<Code> {
        self.init_process.as_ref().map(|hook| hook(api, &self.context, cycle))
    }

    pub(crate) fn call_init_thread(&self, api: &Facade, cycle: &Cycle) -> Option<Code> {
        self.init_thread.as_ref().map(|hook| hook(api, &self.context, cycle))
    }

    pub(crate) fn call_exit_thread(&self, api: &Facade, cycle: &Cycle) {
        if let Some(hook) = &self.exit_thread {
            hook(api, &self.context, cycle);
        }
    }

    pub(crate) fn call_exit_process(&self, api: &Facade, cycle: &Cycle) {
        if let Some(hook) = &self.exit_process {
            hook(api, &self.context, cycle);
        }
    }

    pub(crate) fn call_exit_master(&self, api: &Facade, cycle: Option<&Cycle>) {
        if let Some(hook) = &self.exit_master {
            hook(api, &self.context, cycle);
        }
    }

    pub(crate) fn call_http_postconfiguration(&self, api: &Facade, cf: &mut ConfContext) -> Option<Code> {
        self.http_postconfiguration
            .as_ref()
            .map(|hook| hook(api, &self.context, cf))
    }

    pub(crate) fn call_get_upstream_peer(
        &self,
        api: &Facade,
        r: &HttpRequest,
        id: i64,
        pc: &mut PeerConnection,
    ) -> Option<Code> {
        self.get_upstream_peer
            .as_ref()
            .map(|hook| hook(api, &self.context, r, id, pc))
    }

    pub(crate) fn call_loop_tick(&self, api: &Facade) -> Option<i64> {
        self.loop_tick.as_ref().map(|hook| hook(api, &self.context))
    }
}

impl fmt::Debug for UpcallTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpcallTable")
            .field("init_master", &self.init_master.is_some())
            .field("init_module", &self.init_module.is_some())
            .field("init_process", &self.init_process.is_some())
            .field("init_thread", &self.init_thread.is_some())
            .field("exit_thread", &self.exit_thread.is_some())
            .field("exit_process", &self.exit_process.is_some())
            .field("exit_master", &self.exit_master.is_some())
            .field("http_postconfiguration", &self.http_postconfiguration.is_some())
            .field("get_upstream_peer", &self.get_upstream_peer.is_some())
            .field("loop_tick", &self.loop_tick.is_some())
            .finish()
    }
}
