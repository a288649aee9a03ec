//! Sample host for the embeddable engine.
//!
//! # Architecture Overview
//!
//! ```text
//!     engine-sample
//!         │
//!         ├─ generate config ──▶ memfd (or temp file) ──▶ -c <path>
//!         ├─ UpcallTable (hooks + SampleStore)
//!         │
//!         ├─ worker 0: api().main(..)              (this thread)
//!         └─ worker N: Facade::main_new_thread(..)  (one facade each)
//!
//!     Client ──▶ /        content handler: GET/POST key-value store
//!     Client ──▶ /proxy   proxy_pass "sample" ──▶ get_upstream_peer ──▶ --upstream
//! ```
//!
//! Every worker gets its own facade and listen port but shares the store.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use bytes::Bytes;
use clap::Parser;
use parking_lot::Mutex;

use embed_engine::facade::HostContext;
use embed_engine::http::{HeaderTarget, Method};
use embed_engine::memfd;
use embed_engine::observability::{logging, metrics};
use embed_engine::{Buf, Code, Facade, HttpRequest, LogLevel, Phase, Role, UpcallTable};

/// Sample host command line.
#[derive(Debug, Parser)]
#[command(name = "engine-sample", about = "Sample host embedding the engine")]
struct SampleArgs {
    /// Listen address of the first worker; extra workers use the following ports
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Number of engine workers
    #[arg(short, long, default_value_t = 1)]
    workers: u32,

    /// Prometheus exporter address
    #[arg(long)]
    metrics: Option<SocketAddr>,

    /// Address every /proxy request is routed to
    #[arg(long, default_value = "127.0.0.1:8899")]
    upstream: SocketAddr,
}

/// Key-value data shared by all workers.
#[derive(Debug, Default)]
struct SampleStore {
    data: Mutex<Option<Bytes>>,
}

/// Configuration file handed to one worker.
enum ConfigImage {
    Memory(memfd::MemfdImage),
    Temp(PathBuf),
}

impl ConfigImage {
    fn create(text: &str, worker_id: u32) -> std::io::Result<Self> {
        let name = format!("engine-sample-{worker_id}.toml");
        match memfd::create_memfd_for_so(text.as_bytes(), &name) {
            Ok(image) => Ok(ConfigImage::Memory(image)),
            Err(e) => {
                tracing::debug!(error = %e, "Memory file unavailable, using a temporary file");
                let path = std::env::temp_dir().join(format!("{}-{name}", std::process::id()));
                std::fs::write(&path, text)?;
                Ok(ConfigImage::Temp(path))
            }
        }
    }

    fn path(&self) -> String {
        match self {
            ConfigImage::Memory(image) => image.path().display().to_string(),
            ConfigImage::Temp(path) => path.display().to_string(),
        }
    }
}

impl Drop for ConfigImage {
    fn drop(&mut self) {
        if let ConfigImage::Temp(path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn main() -> ExitCode {
    let args = SampleArgs::parse();
    logging::init_logging("embed_engine=info,engine_sample=info,tower_http=info");

    tracing::info!("engine-sample v0.1.0 starting");

    if let Some(addr) = args.metrics {
        if let Err(e) = metrics::init_metrics(addr) {
            tracing::error!(address = %addr, error = %e, "Failed to start metrics exporter");
        }
    }

    let store = Arc::new(SampleStore::default());
    let mut images = Vec::new();
    let mut handles = Vec::new();

    for worker_id in 1..args.workers.max(1) {
        let Some(listen) = worker_listen(args.listen, worker_id) else {
            tracing::error!(worker_id, base = %args.listen, "No listen port left for worker");
            return ExitCode::FAILURE;
        };
        let image = match ConfigImage::create(&sample_config(listen, args.upstream), worker_id) {
            Ok(image) => image,
            Err(e) => {
                tracing::error!(worker_id, error = %e, "Failed to write configuration");
                return ExitCode::FAILURE;
            }
        };

        let conf = image.path();
        let facade = Facade::new();
        facade.set_upcall(sample_upcalls(Arc::clone(&store), args.upstream));
        match facade.main_new_thread(Role::Primary, 0, worker_id, &["engine-sample", "-c", conf.as_str()]) {
            Ok(handle) => handles.push((facade, handle)),
            Err(e) => {
                tracing::error!(worker_id, error = %e, "Failed to launch worker");
                return ExitCode::FAILURE;
            }
        }
        images.push(image);
    }

    let image = match ConfigImage::create(&sample_config(args.listen, args.upstream), 0) {
        Ok(image) => image,
        Err(e) => {
            tracing::error!(error = %e, "Failed to write configuration");
            return ExitCode::FAILURE;
        }
    };

    let conf = image.path();
    let api = embed_engine::api();
    api.set_upcall(sample_upcalls(Arc::clone(&store), args.upstream));
    let code = api.main(&["engine-sample", "-c", conf.as_str()]);

    // The first worker owns the process: when it stops, so do the others.
    for (facade, handle) in handles {
        facade.shutdown();
        let worker_id = handle.unit().worker_id;
        let exit = handle.wait();
        tracing::info!(worker_id, exit = ?exit, "Worker stopped");
    }

    tracing::info!(code, "Shutdown complete");
    if code == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Listen address of `worker_id`: the base port plus the worker id.
fn worker_listen(base: SocketAddr, worker_id: u32) -> Option<SocketAddr> {
    let port = u16::try_from(worker_id).ok().and_then(|id| base.port().checked_add(id))?;
    Some(SocketAddr::new(base.ip(), port))
}

fn sample_config(listen: SocketAddr, upstream: SocketAddr) -> String {
    format!(
        r#"[engine]
loop_tick_ms = 1000

[log]
level = "info"

[[http.server]]
listen = "{listen}"
server_id = 0

[[http.server.location]]
path = "/"
upcall = 1

[[http.server.location]]
path = "/proxy"
proxy_pass = "sample"

[[http.upstream]]
name = "sample"
upcall = 1

[[http.upstream.server]]
address = "{upstream}"
"#
    )
}

fn sample_upcalls(store: Arc<SampleStore>, upstream: SocketAddr) -> UpcallTable {
    let context: HostContext = store;
    UpcallTable::with_context(context)
        .with_init_master(|api, _, _| {
            api.log(LogLevel::Info, "init master");
            Code::OK
        })
        .with_init_module(|api, _, _| {
            api.log(LogLevel::Info, "init module");
            Code::OK
        })
        .with_init_process(|api, _, _| {
            api.log(LogLevel::Info, "init process");
            Code::OK
        })
        .with_init_thread(|api, _, _| {
            api.log(LogLevel::Info, "init thread");
            Code::OK
        })
        .with_exit_thread(|api, _, _| api.log(LogLevel::Info, "exit thread"))
        .with_exit_process(|api, _, _| api.log(LogLevel::Info, "exit process"))
        .with_exit_master(|api, _, _| api.log(LogLevel::Info, "exit master"))
        .with_http_postconfiguration(|api, ctx, cf| {
            let Ok(store) = Arc::clone(ctx).downcast::<SampleStore>() else {
                return Code::ERROR;
            };
            api.add_http_handler(cf, Phase::Content, move |r| content_handler(&store, r))
        })
        .with_get_upstream_peer(move |api, _, _, id, pc| {
            pc.sockaddr = Some(upstream);
            api.log(LogLevel::Info, &format!("upstream {id} routed to {upstream}"));
            Code::OK
        })
        .with_loop_tick(|api, ctx| {
            let size = ctx
                .downcast_ref::<SampleStore>()
                .and_then(|store| store.data.lock().as_ref().map(Bytes::len));
            api.log(LogLevel::Info, &format!("loop tick triggered, data={size:?}"));
            -1
        })
}

fn content_handler(store: &Arc<SampleStore>, r: &mut HttpRequest) -> Code {
    if Facade::get_loc_id_from_req(r) != 1 {
        return Code::DECLINED;
    }

    let store = Arc::clone(store);
    let rc = r.read_client_request_body(move |r| {
        let rc = handle_body(&store, r);
        r.finalize(rc);
    });
    if rc.is_special_response() {
        return rc;
    }
    Code::DONE
}

fn handle_body(store: &SampleStore, r: &mut HttpRequest) -> Code {
    if r.method == Method::GET {
        let Some(data) = store.data.lock().clone() else {
            return respond(r, 404, Bytes::from_static(b"no data\n"));
        };
        respond(r, 200, data)
    } else if r.method == Method::POST {
        let body = r.request_body.as_ref().map(|b| b.to_bytes()).unwrap_or_default();
        tracing::debug!(bytes = body.len(), "Storing data");
        *store.data.lock() = Some(body);

        r.headers_out.status = 200;
        r.headers_out.content_length = Some(0);
        r.header_only = true;
        r.send_header()
    } else {
        Code::status(405)
    }
}

fn respond(r: &mut HttpRequest, status: u16, body: Bytes) -> Code {
    r.headers_out.status = status;
    r.headers_out.content_length = Some(body.len() as u64);
    r.add_header(HeaderTarget::Out, "Content-Type", "text/plain");

    let rc = r.send_header();
    if rc != Code::OK || r.header_only {
        return rc;
    }
    r.output_filter(Some(Buf::last(body)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workers_use_following_ports() {
        let base: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        assert_eq!(worker_listen(base, 0), Some(base));
        assert_eq!(worker_listen(base, 3), Some("127.0.0.1:8083".parse().unwrap()));
    }

    #[test]
    fn worker_port_overflow_is_rejected() {
        let base: SocketAddr = "127.0.0.1:65530".parse().unwrap();
        assert_eq!(worker_listen(base, 5), Some("127.0.0.1:65535".parse().unwrap()));
        assert_eq!(worker_listen(base, 6), None);
        assert_eq!(worker_listen("127.0.0.1:80".parse().unwrap(), 70_000), None);
    }
}
