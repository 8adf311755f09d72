//! In-memory registry of active relays.
//!
//! DESIGN
//! ======
//! A `HashMap<Uuid, Instant>` behind a std `Mutex`. Each accepted upgrade
//! takes a `RelaySlot` before any upstream dial; dropping the slot removes
//! the entry, so relays that finish, panic, or never get upgraded all
//! deregister the same way.
//!
//! The registry only observes. It is never consulted on the data path, and
//! with no limit configured it never refuses a relay.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use uuid::Uuid;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("relay capacity reached (max {limit} concurrent relays)")]
pub struct CapacityError {
    pub limit: usize,
}

// =============================================================================
// REGISTRY
// =============================================================================

#[derive(Clone)]
pub struct RelayRegistry {
    inner: Arc<Mutex<HashMap<Uuid, Instant>>>,
    limit: Option<usize>,
}

impl RelayRegistry {
    #[must_use]
    pub fn new(limit: Option<usize>) -> Self {
        Self { inner: Arc::new(Mutex::new(HashMap::new())), limit }
    }

    /// Reserve a slot for relay `id`, or fail if the configured limit is hit.
    pub fn try_register(&self, id: Uuid) -> Result<RelaySlot, CapacityError> {
        self.try_register_at(id, Instant::now())
    }

    fn try_register_at(&self, id: Uuid, now: Instant) -> Result<RelaySlot, CapacityError> {
        let mut relays = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(limit) = self.limit {
            if relays.len() >= limit {
                return Err(CapacityError { limit });
            }
        }
        relays.insert(id, now);
        Ok(RelaySlot { id, registry: self.clone() })
    }

    /// Number of relays currently holding a slot.
    #[must_use]
    pub fn active(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Age of the oldest active relay, if any.
    #[must_use]
    pub fn oldest_age(&self) -> Option<Duration> {
        let relays = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        relays.values().min().map(Instant::elapsed)
    }

    #[must_use]
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    fn remove(&self, id: Uuid) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
    }
}

impl Default for RelayRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

// =============================================================================
// SLOT
// =============================================================================

/// Registration handle for one relay. Deregisters on drop.
pub struct RelaySlot {
    id: Uuid,
    registry: RelayRegistry,
}

impl RelaySlot {
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for RelaySlot {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
