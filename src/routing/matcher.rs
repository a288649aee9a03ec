//! Virtual-server and location matching logic.
//!
//! # Responsibilities
//! - Match the Host header against a server name (exact, case-insensitive)
//! - Match a request path against a location prefix (case-sensitive)
//!
//! # Design Decisions
//! - Host matching ignores the port part of the header
//! - Path matching is case-sensitive
//! - No regex to guarantee O(n) matching

/// Trait for matching one request attribute.
pub trait Matcher: Send + Sync + std::fmt::Debug {
    /// Returns true if the input matches this condition.
    fn matches(&self, input: &str) -> bool;
}

/// Matches the Host header.
#[derive(Debug, Clone)]
pub struct HostMatcher {
    expected_host: String,
}

impl HostMatcher {
    /// Create a new host matcher.
    /// The host is normalized to lowercase for case-insensitive matching.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            expected_host: host.into().to_lowercase(),
        }
    }

    pub fn host(&self) -> &str {
        &self.expected_host
    }
}

/// Drop a trailing `:port` from a Host header value.
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // [v6]:port
        return match rest.find(']') {
            Some(end) => &host[..end + 2],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

impl Matcher for HostMatcher {
    fn matches(&self, input: &str) -> bool {
        strip_port(input).eq_ignore_ascii_case(&self.expected_host)
    }
}

/// Matches the request path prefix.
#[derive(Debug, Clone)]
pub struct PathPrefixMatcher {
    prefix: String,
}

impl PathPrefixMatcher {
    /// Create a new path prefix matcher.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.prefix.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prefix.is_empty()
    }
}

impl Matcher for PathPrefixMatcher {
    fn matches(&self, input: &str) -> bool {
        input.starts_with(&self.prefix)
    }
}
