//! TCP listener binding.
//!
//! # Responsibilities
//! - Bind every distinct `listen` address of the configured servers
//! - Report the bound address for logging
//!
//! # Design Decisions
//! - Accepting is left to axum; the engine bounds concurrency with its own
//!   connection slots when a request is admitted
//! - All listeners are bound before any is served so a bad address fails
//!   the whole startup

use std::net::SocketAddr;

use tokio::net::TcpListener;

/// Error type for listener operations.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// Failed to bind to address.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// A bound listener plus the configured address it serves.
#[derive(Debug)]
pub struct Listener {
    configured: SocketAddr,
    inner: TcpListener,
}

impl Listener {
    /// Bind to one configured address.
    pub async fn bind(addr: SocketAddr) -> Result<Self, ListenerError> {
        let inner = TcpListener::bind(addr)
            .await
            .map_err(|source| ListenerError::Bind { addr, source })?;

        let local_addr = inner.local_addr().map_err(|source| ListenerError::Bind { addr, source })?;
        tracing::info!(address = %local_addr, "Listener bound");

        Ok(Self {
            configured: addr,
            inner,
        })
    }

    /// Bind all addresses, failing on the first error.
    pub async fn bind_all(addrs: impl IntoIterator<Item = SocketAddr>) -> Result<Vec<Self>, ListenerError> {
        let mut listeners = Vec::new();
        for addr in addrs {
            listeners.push(Self::bind(addr).await?);
        }
        Ok(listeners)
    }

    /// Address as written in the configuration (used for server lookup).
    pub fn configured_addr(&self) -> SocketAddr {
        self.configured
    }

    pub fn into_inner(self) -> TcpListener {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binding_the_same_address_twice_fails() {
        let first = Listener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let taken = first.inner.local_addr().unwrap();
        let err = Listener::bind(taken).await.unwrap_err();
        assert!(err.to_string().contains(&taken.to_string()));
        assert_eq!(first.configured_addr().port(), 0);
    }
}
