//! Engine startup errors.

use crate::config::ConfigError;
use crate::lifecycle::{HookError, LaunchError};
use crate::net::listener::ListenerError;

/// Anything that stops an engine from starting or running.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Hook(#[from] HookError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("failed to build runtime: {0}")]
    Runtime(#[source] std::io::Error),
}
