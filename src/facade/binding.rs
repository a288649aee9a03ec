//! Location binding: the facade and upcall id attached to a location.

use std::sync::{Arc, Weak};

use crate::facade::Facade;
use crate::http::request::HttpRequest;

/// Id of a location without an `upcall` directive.
pub const UNSET_ID: i64 = -1;

/// Facade handle and upcall id of one location.
///
/// Locations do not inherit the server-level id; each carries its own.
#[derive(Debug, Clone)]
pub struct LocationBinding {
    id: i64,
    api: Weak<Facade>,
}

impl LocationBinding {
    pub fn new(id: i64, api: Weak<Facade>) -> Self {
        Self { id, api }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn is_set(&self) -> bool {
        self.id != UNSET_ID
    }

    /// The facade that parsed this location, while it is alive.
    pub fn api(&self) -> Option<Arc<Facade>> {
        self.api.upgrade()
    }
}

/// The facade that owns the request's configuration.
pub fn get_api_from_req(r: &HttpRequest) -> Option<Arc<Facade>> {
    r.location().binding.api()
}

/// The upcall id of the request's location, or `UNSET_ID`.
pub fn get_loc_id_from_req(r: &HttpRequest) -> i64 {
    r.location().binding.id()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_binding() {
        let binding = LocationBinding::new(UNSET_ID, Weak::new());
        assert!(!binding.is_set());
        assert!(binding.api().is_none());
    }

    #[test]
    fn binding_upgrades_live_facade() {
        let facade = Facade::new();
        let binding = LocationBinding::new(4, Arc::downgrade(&facade));
        assert_eq!(binding.id(), 4);
        assert!(Arc::ptr_eq(&binding.api().unwrap(), &facade));
        drop(facade);
        assert!(binding.api().is_none());
    }
}
