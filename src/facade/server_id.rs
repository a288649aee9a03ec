//! Server-id registry.
//!
//! Maps the small integer ids given by `server_id` to their servers so host
//! code can address a server without a request.

/// Exclusive upper bound for server ids.
pub const MAX_SERVER_ID: i64 = 1024;

/// Why a server id cannot be registered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServerIdError {
    #[error("server id must not be negative")]
    Negative,
    #[error("server id must be less than 1024")]
    TooLarge,
    #[error("duplicated server id")]
    Duplicate,
}

/// Fixed table of `MAX_SERVER_ID` slots.
#[derive(Debug)]
pub struct ServerIdRegistry<T> {
    slots: Vec<Option<T>>,
}

impl<T> ServerIdRegistry<T> {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_SERVER_ID).map(|_| None).collect(),
        }
    }

    pub fn register(&mut self, id: i64, value: T) -> Result<(), ServerIdError> {
        let index = Self::index(id)?;
        let slot = &mut self.slots[index];
        if slot.is_some() {
            return Err(ServerIdError::Duplicate);
        }
        *slot = Some(value);
        Ok(())
    }

    /// The value registered under `id`; `None` for unset or out-of-range ids.
    pub fn lookup(&self, id: i64) -> Option<&T> {
        let index = Self::index(id).ok()?;
        self.slots[index].as_ref()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn index(id: i64) -> Result<usize, ServerIdError> {
        if id < 0 {
            return Err(ServerIdError::Negative);
        }
        if id >= MAX_SERVER_ID {
            return Err(ServerIdError::TooLarge);
        }
        Ok(id as usize)
    }
}

impl<T> Default for ServerIdRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup() {
        let mut registry = ServerIdRegistry::new();
        registry.register(0, "a").unwrap();
        registry.register(1023, "b").unwrap();
        assert_eq!(registry.lookup(0), Some(&"a"));
        assert_eq!(registry.lookup(1023), Some(&"b"));
        assert_eq!(registry.lookup(5), None);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn bounds_and_duplicates() {
        let mut registry = ServerIdRegistry::new();
        assert_eq!(registry.register(-1, ()), Err(ServerIdError::Negative));
        assert_eq!(registry.register(1024, ()), Err(ServerIdError::TooLarge));
        registry.register(7, ()).unwrap();
        assert_eq!(registry.register(7, ()), Err(ServerIdError::Duplicate));
        assert_eq!(registry.lookup(-1), None);
        assert_eq!(registry.lookup(4096), None);
    }

    #[test]
    fn messages() {
        assert_eq!(ServerIdError::TooLarge.to_string(), "server id must be less than 1024");
        assert_eq!(ServerIdError::Duplicate.to_string(), "duplicated server id");
    }
}
