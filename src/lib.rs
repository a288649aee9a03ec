//! Embeddable HTTP engine library.
//!
//! A host installs an upcall table on a [`Facade`], starts the engine with
//! [`Facade::main`] or [`Facade::main_new_thread`], and takes part in
//! request processing through phase handlers, upstream peer selection and
//! synthetic requests.

// Core vocabulary
pub mod code;
pub mod error;
pub mod pool;

// Host surface
pub mod cycle;
pub mod facade;

// Protocol and traffic
pub mod config;
pub mod http;
pub mod load_balancer;
pub mod net;
pub mod routing;

// Cross-cutting concerns
pub mod lifecycle;
pub mod memfd;
pub mod observability;

pub use code::{Code, LogLevel, Phase};
pub use config::EngineConfig;
pub use cycle::{ConfContext, Cycle};
pub use error::EngineError;
pub use facade::{api, Facade, UpcallTable};
pub use http::{Buf, HttpRequest};
pub use lifecycle::{LaunchHandle, Role};
