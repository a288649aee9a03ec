//! Configuration context and the running cycle.
//!
//! # Responsibilities
//! - Compile validated configuration into servers, locations and upstreams
//! - Collect phase handlers while the host's postconfiguration hook runs
//! - Freeze everything into a `Cycle` shared by one execution unit
//! - Keep requests parked by handlers until the host resumes them
//!
//! # Data Flow
//! ```text
//! EngineConfig → ConfContext::parse (servers, server ids, upstreams)
//!     → postconfiguration hook: add_http_handler(...)
//!     → ConfContext::into_cycle → Arc<Cycle>
//!         → event loop, connections, synthetic requests
//! ```
//!
//! # Design Decisions
//! - The cycle is immutable after construction except for the parked-request
//!   map, connection slots and memory budget
//! - Parked requests are dropped (answered with 500) once shutdown starts

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::code::{Code, Phase};
use crate::config::{ConfigError, EngineConfig, LocationBlock};
use crate::facade::binding::{LocationBinding, UNSET_ID};
use crate::facade::server_id::ServerIdRegistry;
use crate::facade::Facade;
use crate::http::phases::PhaseHandlers;
use crate::http::request::{HttpRequest, RequestId};
use crate::lifecycle::launch::ExecutionUnit;
use crate::lifecycle::shutdown::Shutdown;
use crate::load_balancer::UpstreamManager;
use crate::net::connection::ConnectionSlots;
use crate::observability::EngineLog;
use crate::pool::{MemoryBudget, PoolStats};
use crate::routing::{LocationConf, ServerConf, VirtualServers};

/// Configuration being assembled; handed to the postconfiguration hook.
pub struct ConfContext {
    config: Arc<EngineConfig>,
    log: EngineLog,
    servers: Vec<Arc<ServerConf>>,
    server_ids: ServerIdRegistry<Arc<ServerConf>>,
    upstreams: UpstreamManager,
    phases: PhaseHandlers,
}

impl ConfContext {
    /// Compile `config` for `facade`.
    pub fn parse(facade: &Arc<Facade>, config: EngineConfig, log: EngineLog) -> Result<Self, ConfigError> {
        let api = Arc::downgrade(facade);
        let upstreams = UpstreamManager::from_config(&config.http.upstream, &api)?;

        let mut servers = Vec::with_capacity(config.http.server.len());
        let mut server_ids = ServerIdRegistry::new();

        for (index, block) in config.http.server.iter().enumerate() {
            let listen: SocketAddr = block.listen.parse().map_err(|_| ConfigError::Directive {
                directive: "listen",
                message: format!("invalid address \"{}\"", block.listen),
            })?;

            let default_location = LocationConf {
                path: String::new(),
                binding: LocationBinding::new(block.upcall.unwrap_or(UNSET_ID), api.clone()),
                proxy_pass: None,
            };
            let locations = block
                .location
                .iter()
                .map(|loc| compile_location(loc, &upstreams, &api))
                .collect::<Result<Vec<_>, _>>()?;

            let server = Arc::new(ServerConf::new(
                index,
                listen,
                &block.server_name,
                block.server_id,
                default_location,
                locations,
            ));

            if let Some(id) = block.server_id {
                server_ids
                    .register(id, Arc::clone(&server))
                    .map_err(|e| ConfigError::Directive {
                        directive: "server_id",
                        message: e.to_string(),
                    })?;
            }
            servers.push(server);
        }

        tracing::debug!(
            servers = servers.len(),
            server_ids = server_ids.len(),
            upstreams = upstreams.len(),
            "Configuration compiled"
        );

        Ok(Self {
            config: Arc::new(config),
            log,
            servers,
            server_ids,
            upstreams,
            phases: PhaseHandlers::new(),
        })
    }

    /// Register a handler for `phase`.
    pub fn add_http_handler<F>(&mut self, phase: Phase, handler: F) -> Code
    where
        F: Fn(&mut HttpRequest) -> Code + Send + Sync + 'static,
    {
        self.phases.push(phase, Arc::new(handler));
        Code::OK
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn log(&self) -> &EngineLog {
        &self.log
    }

    pub fn servers(&self) -> &[Arc<ServerConf>] {
        &self.servers
    }

    pub fn server_ids(&self) -> &ServerIdRegistry<Arc<ServerConf>> {
        &self.server_ids
    }

    pub fn upstreams(&self) -> &UpstreamManager {
        &self.upstreams
    }

    pub fn phases(&self) -> &PhaseHandlers {
        &self.phases
    }

    /// Freeze into the cycle run by `unit`.
    pub fn into_cycle(self, unit: ExecutionUnit) -> Cycle {
        let engine = &self.config.engine;
        let budget = match engine.memory_limit {
            Some(limit) => MemoryBudget::with_limit(limit),
            None => MemoryBudget::unlimited(),
        };

        Cycle {
            slots: Arc::new(ConnectionSlots::new(engine.worker_connections)),
            budget: Arc::new(budget),
            pool_stats: Arc::new(PoolStats::default()),
            servers: VirtualServers::new(self.servers),
            server_ids: self.server_ids,
            upstreams: self.upstreams,
            phases: Arc::new(self.phases),
            log: self.log,
            config: self.config,
            unit,
            shutdown: Shutdown::new(),
            wake: Notify::new(),
            parked: Mutex::new(HashMap::new()),
        }
    }
}

fn compile_location(
    loc: &LocationBlock,
    upstreams: &UpstreamManager,
    api: &Weak<Facade>,
) -> Result<LocationConf, ConfigError> {
    let proxy_pass = match &loc.proxy_pass {
        Some(name) => Some(upstreams.get(name).ok_or_else(|| ConfigError::Directive {
            directive: "proxy_pass",
            message: format!("host not found in upstream \"{}\"", name),
        })?),
        None => None,
    };
    Ok(LocationConf {
        path: loc.path.clone(),
        binding: LocationBinding::new(loc.upcall.unwrap_or(UNSET_ID), api.clone()),
        proxy_pass,
    })
}

impl fmt::Debug for ConfContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfContext")
            .field("servers", &self.servers.len())
            .field("server_ids", &self.server_ids.len())
            .field("upstreams", &self.upstreams.len())
            .field("phases", &self.phases)
            .finish()
    }
}

/// Runtime state of one execution unit.
pub struct Cycle {
    config: Arc<EngineConfig>,
    servers: VirtualServers,
    server_ids: ServerIdRegistry<Arc<ServerConf>>,
    upstreams: UpstreamManager,
    phases: Arc<PhaseHandlers>,
    slots: Arc<ConnectionSlots>,
    budget: Arc<MemoryBudget>,
    pool_stats: Arc<PoolStats>,
    log: EngineLog,
    unit: ExecutionUnit,
    shutdown: Shutdown,
    wake: Notify,
    parked: Mutex<HashMap<RequestId, HttpRequest>>,
}

impl Cycle {
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn servers(&self) -> &VirtualServers {
        &self.servers
    }

    pub fn server_ids(&self) -> &ServerIdRegistry<Arc<ServerConf>> {
        &self.server_ids
    }

    pub fn upstreams(&self) -> &UpstreamManager {
        &self.upstreams
    }

    pub fn phases(&self) -> &Arc<PhaseHandlers> {
        &self.phases
    }

    pub fn slots(&self) -> &Arc<ConnectionSlots> {
        &self.slots
    }

    pub fn budget(&self) -> &Arc<MemoryBudget> {
        &self.budget
    }

    pub fn pool_stats(&self) -> &Arc<PoolStats> {
        &self.pool_stats
    }

    pub fn log(&self) -> &EngineLog {
        &self.log
    }

    pub fn unit(&self) -> ExecutionUnit {
        self.unit
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Wake the event loop.
    pub fn notify(&self) {
        self.wake.notify_one();
    }

    /// Completes after the next `notify`.
    pub fn notified(&self) -> Notified<'_> {
        self.wake.notified()
    }

    /// Keep a pending request until it is resumed.
    pub fn park(&self, r: HttpRequest) {
        let rejected = {
            let mut parked = self.parked.lock();
            if self.shutdown.is_triggered() {
                Some(r)
            } else {
                tracing::debug!(request = %r.id(), "Request parked");
                parked.insert(r.id(), r);
                None
            }
        };
        if let Some(r) = rejected {
            tracing::debug!(request = %r.id(), "Shutting down, pending request dropped");
        }
    }

    /// Remove a parked request.
    pub fn take_parked(&self, id: RequestId) -> Option<HttpRequest> {
        self.parked.lock().remove(&id)
    }

    pub fn parked_count(&self) -> usize {
        self.parked.lock().len()
    }

    /// Drop every parked request; network ones are answered with 500.
    pub fn drain_parked(&self) -> usize {
        let drained: Vec<HttpRequest> = self.parked.lock().drain().map(|(_, r)| r).collect();
        let count = drained.len();
        if count > 0 {
            tracing::info!(requests = count, "Dropping pending requests");
        }
        drop(drained);
        count
    }
}

impl fmt::Debug for Cycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cycle")
            .field("unit", &self.unit)
            .field("servers", &self.servers.len())
            .field("upstreams", &self.upstreams.len())
            .field("phases", &self.phases)
            .field("slots_in_use", &self.slots.in_use())
            .field("memory_used", &self.budget.used())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::facade::dummy::new_dummy_request;
    use crate::lifecycle::launch::Role;

    /// Facade and cycle built from a TOML snippet.
    pub(crate) fn test_cycle(toml_str: &str) -> (Arc<Facade>, Arc<Cycle>) {
        test_cycle_with(toml_str, |_| {})
    }

    /// Like `test_cycle`, letting `configure` register handlers first.
    pub(crate) fn test_cycle_with<F>(toml_str: &str, configure: F) -> (Arc<Facade>, Arc<Cycle>)
    where
        F: FnOnce(&mut ConfContext),
    {
        let facade = Facade::new();
        let config = parse_config(toml_str).unwrap();
        let mut cf = ConfContext::parse(&facade, config, EngineLog::process()).unwrap();
        configure(&mut cf);
        let cycle = Arc::new(cf.into_cycle(ExecutionUnit::new(Role::Primary, 0)));
        (facade, cycle)
    }

    /// Synthetic request on the server registered as `server_id`.
    pub(crate) fn synthetic_request(cycle: &Arc<Cycle>, server_id: isize) -> HttpRequest {
        new_dummy_request(cycle, server_id).unwrap()
    }

    #[test]
    fn locations_do_not_inherit_server_upcall() {
        let (facade, cycle) = test_cycle(
            r#"
            [[http.server]]
            listen = "127.0.0.1:18085"
            upcall = 9

            [[http.server.location]]
            path = "/api"
            "#,
        );
        let server = cycle.servers().iter().next().unwrap();
        assert_eq!(server.default_location().binding.id(), 9);
        let api = server.find_location("/api/x");
        assert_eq!(api.binding.id(), UNSET_ID);
        assert!(Arc::ptr_eq(&api.binding.api().unwrap(), &facade));
    }

    #[test]
    fn duplicate_server_id_is_rejected() {
        let facade = Facade::new();
        let config = parse_config(
            r#"
            [[http.server]]
            listen = "127.0.0.1:18086"
            server_id = 1

            [[http.server]]
            listen = "127.0.0.1:18087"
            server_id = 1
            "#,
        )
        .unwrap();
        let err = ConfContext::parse(&facade, config, EngineLog::process()).unwrap_err();
        assert!(err.to_string().contains("duplicated server id"));
    }

    #[test]
    fn parked_requests_resume_or_drain() {
        let (_facade, cycle) = test_cycle(
            r#"
            [[http.server]]
            listen = "127.0.0.1:18088"
            server_id = 0
            "#,
        );
        let r = synthetic_request(&cycle, 0);
        let id = r.id();
        cycle.park(r);
        assert_eq!(cycle.parked_count(), 1);
        assert!(cycle.take_parked(id).is_some());

        cycle.park(synthetic_request(&cycle, 0));
        assert_eq!(cycle.drain_parked(), 1);

        cycle.shutdown().trigger();
        cycle.park(synthetic_request(&cycle, 0));
        assert_eq!(cycle.parked_count(), 0);
        assert_eq!(cycle.slots().in_use(), 0);
    }
}
