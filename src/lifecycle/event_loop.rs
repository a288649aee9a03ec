//! The per-unit event loop.
//!
//! # Responsibilities
//! - Run a single-threaded runtime for one execution unit
//! - Bind the cycle's listeners and serve them
//! - Call the host loop-tick hook every iteration and honor its hint
//! - Stop on facade shutdown or a termination signal, then drain
//!
//! # Design Decisions
//! - One current-thread runtime per unit: the engine never shares a worker
//!   thread with another unit
//! - The loop wakes early on `notify` so host work queued from other
//!   threads is picked up without waiting for the tick

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;

use crate::cycle::Cycle;
use crate::error::EngineError;
use crate::http::HttpServer;
use crate::lifecycle::dispatch::LifecycleDispatcher;
use crate::lifecycle::signals;
use crate::net::listener::Listener;

/// Run the cycle until shutdown.
pub fn run(cycle: &Arc<Cycle>, dispatcher: &LifecycleDispatcher) -> Result<(), EngineError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(EngineError::Runtime)?;
    runtime.block_on(serve(cycle, dispatcher))
}

async fn serve(cycle: &Arc<Cycle>, dispatcher: &LifecycleDispatcher) -> Result<(), EngineError> {
    let listeners = Listener::bind_all(cycle.servers().listen_addrs()).await?;

    let mut servers = JoinSet::new();
    for listener in listeners {
        let server = HttpServer::new(Arc::clone(cycle), listener.configured_addr());
        let shutdown = cycle.shutdown().subscribe();
        servers.spawn(server.run(listener.into_inner(), shutdown));
    }
    tracing::info!(listeners = servers.len(), unit = ?cycle.unit(), "Engine running");

    let engine = &cycle.config().engine;
    let default_tick = Duration::from_millis(engine.loop_tick_ms);
    let handle_signals = engine.handle_signals;
    let mut stop = cycle.shutdown().subscribe();
    let signal = signals::wait_for_signal();
    tokio::pin!(signal);
    let mut signal_fired = false;

    loop {
        let hint = dispatcher.loop_tick();
        let delay = u64::try_from(hint).map_or(default_tick, Duration::from_millis);

        tokio::select! {
            _ = stop.wait() => break,
            _ = cycle.notified() => {}
            _ = tokio::time::sleep(delay) => {}
            name = &mut signal, if handle_signals && !signal_fired => {
                signal_fired = true;
                tracing::info!(signal = name, "Shutdown signal received");
                cycle.shutdown().trigger();
            }
        }
    }

    tracing::info!("Engine stopping");
    cycle.drain_parked();

    while let Some(joined) = servers.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "HTTP server failed"),
            Err(e) => tracing::warn!(error = %e, "HTTP server task failed"),
        }
    }
    Ok(())
}
