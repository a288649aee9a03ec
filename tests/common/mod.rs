//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::routing::any;
use bytes::Bytes;
use axum::Router;
use tokio::net::{TcpListener, TcpStream};

use embed_engine::lifecycle::LaunchHandle;
use embed_engine::{Facade, Role, UpcallTable};

/// Reserve a loopback port that is free right now.
pub fn free_port() -> SocketAddr {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// Start a mock backend that answers every request with `response`.
pub async fn start_mock_backend(response: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new()
        .route("/", any(move || async move { response }))
        .route("/{*path}", any(move || async move { response }));

    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// Start a backend that answers every request with the body it received.
pub async fn start_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new()
        .route("/", any(|body: Bytes| async move { body }))
        .route("/{*path}", any(|body: Bytes| async move { body }));

    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// Wait until something accepts connections on `addr`.
pub async fn wait_for_listener(addr: SocketAddr) {
    for _ in 0..100 {
        if TcpStream::connect(addr).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("nothing listening on {addr}");
}

/// A configuration file removed on drop.
pub struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    pub fn new(text: &str) -> Self {
        let path = std::env::temp_dir().join(format!(
            "embed-engine-{}-{}.toml",
            std::process::id(),
            free_port().port()
        ));
        std::fs::write(&path, text).unwrap();
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn arg(&self) -> String {
        self.path.display().to_string()
    }
}

impl Drop for ConfigFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// A running engine on its own thread.
pub struct TestEngine {
    pub facade: Arc<Facade>,
    pub handle: LaunchHandle,
    pub listen: SocketAddr,
    _config: ConfigFile,
}

impl TestEngine {
    /// Start an engine serving `config` (which must listen on `listen`).
    pub async fn start(table: UpcallTable, listen: SocketAddr, config: &str) -> Self {
        let config = ConfigFile::new(config);
        let facade = Facade::new();
        facade.set_upcall(table);
        let conf = config.arg();
        let handle = facade
            .main_new_thread(Role::Primary, 0, 0, &["engine", "-c", conf.as_str()])
            .unwrap();
        wait_for_listener(listen).await;

        Self {
            facade,
            handle,
            listen,
            _config: config,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.listen, path)
    }

    /// Stop the engine and return its exit code.
    pub async fn stop(self) -> Option<i32> {
        self.facade.shutdown();
        self.handle.exit_code().await
    }
}
