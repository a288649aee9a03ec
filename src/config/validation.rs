//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (locations reference existing upstreams)
//! - Validate value ranges and address syntax
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is a pure function: EngineConfig → Result<(), Vec<ValidationError>>
//! - Directive errors (server ids, balancing conflicts) are reported while
//!   building the cycle, not here

use std::collections::HashSet;
use std::net::SocketAddr;

use crate::config::schema::EngineConfig;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("engine.worker_connections must be greater than 0")]
    NoConnections,

    #[error("engine.loop_tick_ms must be greater than 0")]
    ZeroLoopTick,

    #[error("server #{server}: invalid listen address \"{listen}\"")]
    InvalidListen { server: usize, listen: String },

    #[error("server #{server}: location path \"{path}\" must start with '/'")]
    InvalidLocationPath { server: usize, path: String },

    #[error("server #{server}: location \"{path}\" references unknown upstream \"{upstream}\"")]
    UnknownUpstream { server: usize, path: String, upstream: String },

    #[error("upstream #{index}: name must not be empty")]
    EmptyUpstreamName { index: usize },

    #[error("upstream \"{name}\" is defined more than once")]
    DuplicateUpstream { name: String },

    #[error("upstream \"{name}\" has no servers")]
    NoUpstreamServers { name: String },

    #[error("upstream \"{name}\": invalid server address \"{address}\"")]
    InvalidPeerAddress { name: String, address: String },

    #[error("upstream \"{name}\": server \"{address}\" weight must be at least 1")]
    ZeroWeight { name: String, address: String },
}

/// Validate a parsed configuration, collecting every problem.
pub fn validate_config(config: &EngineConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.engine.worker_connections == 0 {
        errors.push(ValidationError::NoConnections);
    }
    if config.engine.loop_tick_ms == 0 {
        errors.push(ValidationError::ZeroLoopTick);
    }

    let mut upstream_names = HashSet::new();
    for (index, upstream) in config.http.upstream.iter().enumerate() {
        if upstream.name.is_empty() {
            errors.push(ValidationError::EmptyUpstreamName { index });
        } else if !upstream_names.insert(upstream.name.as_str()) {
            errors.push(ValidationError::DuplicateUpstream {
                name: upstream.name.clone(),
            });
        }

        if upstream.server.is_empty() {
            errors.push(ValidationError::NoUpstreamServers {
                name: upstream.name.clone(),
            });
        }
        for peer in &upstream.server {
            if peer.address.parse::<SocketAddr>().is_err() {
                errors.push(ValidationError::InvalidPeerAddress {
                    name: upstream.name.clone(),
                    address: peer.address.clone(),
                });
            }
            if peer.weight == 0 {
                errors.push(ValidationError::ZeroWeight {
                    name: upstream.name.clone(),
                    address: peer.address.clone(),
                });
            }
        }
    }

    for (server_index, server) in config.http.server.iter().enumerate() {
        if server.listen.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::InvalidListen {
                server: server_index,
                listen: server.listen.clone(),
            });
        }

        for location in &server.location {
            if !location.path.starts_with('/') {
                errors.push(ValidationError::InvalidLocationPath {
                    server: server_index,
                    path: location.path.clone(),
                });
            }
            if let Some(upstream) = &location.proxy_pass {
                if !upstream_names.contains(upstream.as_str()) {
                    errors.push(ValidationError::UnknownUpstream {
                        server: server_index,
                        path: location.path.clone(),
                        upstream: upstream.clone(),
                    });
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> EngineConfig {
        toml::from_str(toml_str).unwrap()
    }

    #[test]
    fn valid_config_passes() {
        let config = parse(
            r#"
            [[http.server]]
            listen = "127.0.0.1:8080"
            [[http.server.location]]
            path = "/"
            proxy_pass = "pool"

            [[http.upstream]]
            name = "pool"
            [[http.upstream.server]]
            address = "127.0.0.1:3000"
            "#,
        );
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn reports_every_problem() {
        let config = parse(
            r#"
            [engine]
            worker_connections = 0

            [[http.server]]
            listen = "not-an-address"
            [[http.server.location]]
            path = "api"
            proxy_pass = "missing"

            [[http.upstream]]
            name = "empty"
            "#,
        );
        let errors = validate_config(&config).unwrap_err();
        assert!(errors.contains(&ValidationError::NoConnections));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::InvalidListen { .. })));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::InvalidLocationPath { .. })));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::UnknownUpstream { .. })));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::NoUpstreamServers { .. })));
        assert_eq!(errors.len(), 5);
    }

    #[test]
    fn duplicate_upstream_detected() {
        let config = parse(
            r#"
            [[http.upstream]]
            name = "pool"
            [[http.upstream.server]]
            address = "127.0.0.1:3000"

            [[http.upstream]]
            name = "pool"
            [[http.upstream.server]]
            address = "127.0.0.1:3001"
            weight = 0
            "#,
        );
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![
                ValidationError::DuplicateUpstream { name: "pool".into() },
                ValidationError::ZeroWeight {
                    name: "pool".into(),
                    address: "127.0.0.1:3001".into()
                },
            ]
        );
    }
}
