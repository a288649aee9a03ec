//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber for hosts that want the default setup
//! - Carry the engine log context (span + configured level) to connections
//! - Map engine log levels onto tracing levels
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - Engine levels are filtered twice: by the configured engine level here,
//!   then by the subscriber's `EnvFilter`
//! - Log contexts are cheap clones of a span handle

use tracing::Span;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::code::LogLevel;
use crate::lifecycle::launch::ExecutionUnit;
use crate::net::connection::ConnectionId;

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to `default_filter`.
///
/// Returns false when a global subscriber was already installed.
pub fn init_logging(default_filter: &str) -> bool {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

/// Engine log context.
#[derive(Debug, Clone)]
pub struct EngineLog {
    span: Span,
    level: LogLevel,
}

impl EngineLog {
    /// Root context of an execution unit.
    pub fn new(level: LogLevel, unit: ExecutionUnit) -> Self {
        Self {
            span: tracing::info_span!("engine", worker = unit.worker_id, role = %unit.role),
            level,
        }
    }

    /// Context used before any cycle exists.
    pub fn process() -> Self {
        Self {
            span: tracing::info_span!("engine"),
            level: LogLevel::default(),
        }
    }

    /// Child context for a connection.
    pub fn connection(&self, id: ConnectionId, synthetic: bool) -> Self {
        Self {
            span: tracing::debug_span!(parent: &self.span, "connection", id = %id, synthetic),
            level: self.level,
        }
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level <= self.level
    }

    /// Write one message at an engine level.
    pub fn write(&self, level: LogLevel, message: &str) {
        if !self.enabled(level) {
            return;
        }
        let _entered = self.span.enter();
        match level {
            LogLevel::Stderr | LogLevel::Emerg | LogLevel::Alert | LogLevel::Crit => {
                tracing::error!(severity = ?level, "{}", message)
            }
            LogLevel::Err => tracing::error!("{}", message),
            LogLevel::Warn => tracing::warn!("{}", message),
            LogLevel::Notice | LogLevel::Info => tracing::info!("{}", message),
            LogLevel::Debug => tracing::debug!("{}", message),
        }
    }
}
