//! End-to-end tests: a host embeds the engine on its own thread and talks to
//! it over HTTP.

mod common;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use common::{free_port, start_echo_backend, start_mock_backend, ConfigFile, TestEngine};
use embed_engine::facade::DummyRequestError;
use embed_engine::http::{HeaderTarget, RequestId};
use embed_engine::{Buf, Code, Facade, HttpRequest, Phase, UpcallTable};

fn server_config(listen: SocketAddr, upstream: SocketAddr) -> String {
    format!(
        r#"[engine]
loop_tick_ms = 20
handle_signals = false

[[http.server]]
listen = "{listen}"
server_id = 0

[[http.server.location]]
path = "/hello"
upcall = 1

[[http.server.location]]
path = "/slow"
upcall = 2

[[http.server.location]]
path = "/routed"
proxy_pass = "routed"

[[http.server.location]]
path = "/native"
proxy_pass = "native"

[[http.upstream]]
name = "routed"
upcall = 7

[[http.upstream.server]]
address = "127.0.0.1:1"

[[http.upstream]]
name = "native"

[[http.upstream.server]]
address = "{upstream}"
"#
    )
}

/// Answers location 1 with the method, path and body length it saw.
fn hello_handler(r: &mut HttpRequest) -> Code {
    if Facade::get_loc_id_from_req(r) != 1 {
        return Code::DECLINED;
    }
    let rc = r.read_client_request_body(|r| {
        let len = r.request_body.as_ref().map_or(0, |b| b.len());
        let body = format!("{} {} {}\n", r.method, r.uri, len);
        r.headers_out.status = 200;
        r.headers_out.content_length = Some(body.len() as u64);
        r.add_header(HeaderTarget::Out, "X-Engine", "embed");

        let mut rc = r.send_header();
        if rc == Code::OK {
            rc = r.output_filter(Some(Buf::last(body)));
        }
        r.finalize(rc);
    });
    if rc.is_special_response() {
        return rc;
    }
    Code::DONE
}

#[derive(Default)]
struct Host {
    parked: Mutex<Vec<RequestId>>,
    peer_calls: AtomicUsize,
    exit_thread: AtomicUsize,
    exit_process: AtomicUsize,
    exit_master: AtomicUsize,
}

fn host_table(host: Arc<Host>, backend: SocketAddr) -> UpcallTable {
    let parked = Arc::clone(&host);
    let ticks = Arc::clone(&host);
    let peers = Arc::clone(&host);
    let exits = Arc::clone(&host);
    let process_exits = Arc::clone(&host);
    let master_exits = host;

    UpcallTable::new(())
        .with_http_postconfiguration(move |api, _, cf| {
            let parked = Arc::clone(&parked);
            let rc = api.add_http_handler(cf, Phase::Content, hello_handler);
            if rc != Code::OK {
                return rc;
            }
            // Location 2 is answered later, from the loop tick.
            api.add_http_handler(cf, Phase::Content, move |r| {
                if Facade::get_loc_id_from_req(r) != 2 {
                    return Code::DECLINED;
                }
                parked.parked.lock().push(r.id());
                if let Some(api) = Facade::get_api_from_req(r) {
                    api.notify();
                }
                Code::DONE
            })
        })
        .with_loop_tick(move |api, _| {
            let ids: Vec<RequestId> = ticks.parked.lock().drain(..).collect();
            for id in ids {
                api.resume_request(id, |r| Code::status(if r.uri == "/slow" { 202 } else { 500 }));
            }
            -1
        })
        .with_get_upstream_peer(move |_, _, _, id, pc| {
            assert_eq!(id, 7);
            peers.peer_calls.fetch_add(1, Ordering::SeqCst);
            pc.sockaddr = Some(backend);
            Code::OK
        })
        .with_exit_thread(move |_, _, _| {
            exits.exit_thread.fetch_add(1, Ordering::SeqCst);
        })
        .with_exit_process(move |_, _, _| {
            process_exits.exit_process.fetch_add(1, Ordering::SeqCst);
        })
        .with_exit_master(move |_, _, cycle| {
            assert!(cycle.is_some());
            master_exits.exit_master.fetch_add(1, Ordering::SeqCst);
        })
}

async fn start(host: &Arc<Host>) -> TestEngine {
    let backend = start_mock_backend("backend ok").await;
    let listen = free_port();
    TestEngine::start(host_table(Arc::clone(host), backend), listen, &server_config(listen, backend)).await
}

#[tokio::test]
async fn content_handler_answers_requests() {
    let host = Arc::new(Host::default());
    let engine = start(&host).await;
    let client = reqwest::Client::new();

    let res = client.get(engine.url("/hello")).send().await.unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.headers().get("x-engine").unwrap(), "embed");
    assert_eq!(res.text().await.unwrap(), "GET /hello 0\n");

    let res = client.post(engine.url("/hello/there")).body("12345").send().await.unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "POST /hello/there 5\n");

    assert_eq!(engine.stop().await, Some(0));
}

#[tokio::test]
async fn unhandled_location_is_404() {
    let host = Arc::new(Host::default());
    let engine = start(&host).await;

    let res = reqwest::get(engine.url("/nothing")).await.unwrap();
    assert_eq!(res.status(), 404);
    assert_eq!(res.text().await.unwrap(), "404 Not Found\n");

    assert_eq!(engine.stop().await, Some(0));
}

#[tokio::test]
async fn host_routes_upstream_peer() {
    let host = Arc::new(Host::default());
    let engine = start(&host).await;

    // The configured peer is unreachable; the hook sends the request to the backend.
    let res = reqwest::get(engine.url("/routed/item")).await.unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "backend ok");
    assert_eq!(host.peer_calls.load(Ordering::SeqCst), 1);

    assert_eq!(engine.stop().await, Some(0));
}

#[tokio::test]
async fn native_round_robin_proxies() {
    let host = Arc::new(Host::default());
    let engine = start(&host).await;

    let res = reqwest::get(engine.url("/native")).await.unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "backend ok");
    assert_eq!(host.peer_calls.load(Ordering::SeqCst), 0);

    assert_eq!(engine.stop().await, Some(0));
}

#[tokio::test]
async fn unreachable_upstream_is_502() {
    let listen = free_port();
    let dead = free_port();
    let engine = TestEngine::start(UpcallTable::new(()), listen, &server_config(listen, dead)).await;

    let res = reqwest::get(engine.url("/native")).await.unwrap();
    assert_eq!(res.status(), 502);

    assert_eq!(engine.stop().await, Some(0));
}

#[tokio::test]
async fn failed_peer_hook_releases_native_peer() {
    let listen = free_port();
    let table = UpcallTable::new(()).with_get_upstream_peer(|_, _, _, _, _| Code::ERROR);
    let engine = TestEngine::start(table, listen, &server_config(listen, free_port())).await;

    let res = reqwest::get(engine.url("/routed/x")).await.unwrap();
    assert_eq!(res.status(), 500);

    let cycle = engine.facade.cycle().unwrap();
    let health = cycle.upstreams().get("routed").unwrap().peer_health(0).unwrap();
    assert_eq!(health.conns, 0);
    assert_eq!(health.fails, 0);

    assert_eq!(engine.stop().await, Some(0));
}

#[tokio::test]
async fn body_read_in_access_phase_reaches_upstream() {
    let listen = free_port();
    let echo = start_echo_backend().await;
    let table = UpcallTable::new(()).with_http_postconfiguration(|api, _, cf| {
        api.add_http_handler(cf, Phase::Access, |r| {
            let rc = r.read_client_request_body(|_| {});
            if rc.is_special_response() {
                return rc;
            }
            Code::DECLINED
        })
    });
    let engine = TestEngine::start(table, listen, &server_config(listen, echo)).await;

    let res = reqwest::Client::new()
        .post(engine.url("/native/echo"))
        .body("hello")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "hello");

    assert_eq!(engine.stop().await, Some(0));
}

#[tokio::test]
async fn pending_request_resumed_from_loop_tick() {
    let host = Arc::new(Host::default());
    let engine = start(&host).await;

    let res = reqwest::get(engine.url("/slow")).await.unwrap();
    assert_eq!(res.status(), 202);
    assert_eq!(res.text().await.unwrap(), "202 Accepted\n");

    assert_eq!(engine.stop().await, Some(0));
}

#[tokio::test]
async fn synthetic_requests_need_a_running_engine() {
    let host = Arc::new(Host::default());
    let engine = start(&host).await;

    let r = engine.facade.new_http_dummy_request(0).unwrap();
    assert!(r.is_synthetic());
    assert_eq!(Facade::get_loc_id_from_req(&r), embed_engine::facade::UNSET_ID);
    drop(r);

    assert_eq!(
        engine.facade.new_http_dummy_request(7).unwrap_err(),
        DummyRequestError::UnknownServerId(7)
    );

    let facade = Arc::clone(&engine.facade);
    assert_eq!(engine.stop().await, Some(0));
    assert_eq!(facade.new_http_dummy_request(0).unwrap_err(), DummyRequestError::NotRunning);
}

#[tokio::test]
async fn shutdown_runs_exit_hooks_once() {
    let host = Arc::new(Host::default());
    let engine = start(&host).await;
    let facade = Arc::clone(&engine.facade);
    assert!(facade.is_running());

    assert_eq!(engine.stop().await, Some(0));
    assert!(!facade.is_running());
    assert_eq!(facade.shutdown(), Code::DECLINED);
    assert_eq!(host.exit_thread.load(Ordering::SeqCst), 1);
    assert_eq!(host.exit_process.load(Ordering::SeqCst), 1);
    assert_eq!(host.exit_master.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn second_main_on_running_facade_fails() {
    let host = Arc::new(Host::default());
    let engine = start(&host).await;

    let config = ConfigFile::new(&server_config(free_port(), free_port()));
    let conf = config.arg();
    assert_eq!(engine.facade.main(&["engine", "-c", conf.as_str()]), 1);
    assert!(engine.facade.is_running());

    assert_eq!(engine.stop().await, Some(0));
}

#[derive(Default)]
struct Stages {
    init_master: AtomicUsize,
    init_module: AtomicUsize,
    init_process: AtomicUsize,
    exit_master: AtomicUsize,
    exit_saw_cycle: AtomicBool,
}

fn counting_table(stages: Arc<Stages>) -> UpcallTable {
    let master = Arc::clone(&stages);
    let module = Arc::clone(&stages);
    let process = Arc::clone(&stages);
    UpcallTable::new(())
        .with_init_master(move |_, _, _| {
            master.init_master.fetch_add(1, Ordering::SeqCst);
            Code::OK
        })
        .with_init_module(move |_, _, _| {
            module.init_module.fetch_add(1, Ordering::SeqCst);
            Code::OK
        })
        .with_init_process(move |_, _, _| {
            process.init_process.fetch_add(1, Ordering::SeqCst);
            Code::OK
        })
        .with_exit_master(move |_, _, cycle| {
            stages.exit_master.fetch_add(1, Ordering::SeqCst);
            stages.exit_saw_cycle.store(cycle.is_some(), Ordering::SeqCst);
        })
}

#[test]
fn test_mode_stops_after_module_init() {
    let stages = Arc::new(Stages::default());
    let facade = Facade::new();
    assert_eq!(facade.set_upcall(counting_table(Arc::clone(&stages))), Code::OK);

    let config = ConfigFile::new(&server_config(free_port(), free_port()));
    let conf = config.arg();
    assert_eq!(facade.main(&["engine", "-t", "-c", conf.as_str()]), 0);

    assert_eq!(stages.init_master.load(Ordering::SeqCst), 1);
    assert_eq!(stages.init_module.load(Ordering::SeqCst), 1);
    assert_eq!(stages.init_process.load(Ordering::SeqCst), 0);
    assert_eq!(stages.exit_master.load(Ordering::SeqCst), 1);
    assert!(stages.exit_saw_cycle.load(Ordering::SeqCst));
    assert!(!facade.is_running());
}

#[test]
fn duplicated_server_id_fails_startup() {
    let stages = Arc::new(Stages::default());
    let facade = Facade::new();
    facade.set_upcall(counting_table(Arc::clone(&stages)));

    let config = ConfigFile::new(&format!(
        r#"[[http.server]]
listen = "{}"
server_id = 3

[[http.server]]
listen = "{}"
server_id = 3
"#,
        free_port(),
        free_port()
    ));
    let conf = config.arg();
    assert_eq!(facade.main(&["engine", "-c", conf.as_str()]), 1);

    assert_eq!(stages.init_master.load(Ordering::SeqCst), 1);
    assert_eq!(stages.init_module.load(Ordering::SeqCst), 0);
    assert_eq!(stages.exit_master.load(Ordering::SeqCst), 1);
    assert!(!stages.exit_saw_cycle.load(Ordering::SeqCst));
}

#[test]
fn missing_config_file_fails_startup() {
    let facade = Facade::new();
    assert_eq!(facade.main(&["engine", "-c", "/nonexistent/engine.toml"]), 1);
}

#[test]
fn help_exits_zero() {
    let facade = Facade::new();
    assert_eq!(facade.main(&["engine", "--help"]), 0);
}
