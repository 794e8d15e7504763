//! Registry for managing named circuit breakers.
//!
//! The administrative surface: inspect any breaker's state by name and
//! force-reset it without holding a reference to the breaker itself.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::circuit_breaker::{CircuitBreakerState, CircuitState};
use tracing::warn;

/// Handle to inspect or reset one breaker.
#[derive(Clone, Debug)]
pub struct CircuitBreakerHandle {
    pub(crate) state: Arc<CircuitBreakerState>,
}

impl CircuitBreakerHandle {
    /// Reset the breaker to Closed, clearing failure counts.
    pub fn reset(&self) {
        self.state.reset();
    }

    /// Current breaker state.
    pub fn state(&self) -> CircuitState {
        self.state.current_state()
    }
}

/// Errors from breaker registries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitBreakerRegistryError {
    /// The requested circuit breaker name was not found.
    NotFound { name: String },
}

impl std::fmt::Display for CircuitBreakerRegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerRegistryError::NotFound { name } => {
                write!(f, "circuit breaker '{name}' not found")
            }
        }
    }
}

impl std::error::Error for CircuitBreakerRegistryError {}

/// Trait for breaker registries, injectable into admin surfaces.
pub trait CircuitBreakerRegistry: Send + Sync + std::fmt::Debug {
    /// Register a breaker handle by name, overwriting any existing handle.
    ///
    /// Overwrite is deliberate: when two registrations share a name, the
    /// last one wins, and the replacement is a swap of state, not a merge.
    fn register(&self, name: String, handle: CircuitBreakerHandle);
    /// Get a breaker handle by name.
    fn get(&self, name: &str) -> Option<CircuitBreakerHandle>;
    /// Force-reset a breaker by name, erroring if missing.
    fn reset(&self, name: &str) -> Result<(), CircuitBreakerRegistryError>;
    /// Snapshot breaker states sorted by name.
    fn snapshot(&self) -> Vec<(String, CircuitState)>;
}

/// In-memory registry backed by an RwLock.
#[derive(Default, Clone, Debug)]
pub struct InMemoryCircuitBreakerRegistry {
    inner: Arc<RwLock<HashMap<String, CircuitBreakerHandle>>>,
}

impl InMemoryCircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CircuitBreakerRegistry for InMemoryCircuitBreakerRegistry {
    fn register(&self, name: String, handle: CircuitBreakerHandle) {
        let mut map = self.inner.write().expect("circuit breaker registry poisoned");
        if map.contains_key(&name) {
            warn!(name = %name, "circuit breaker name replaced; last registration wins");
        }
        map.insert(name, handle);
    }

    fn get(&self, name: &str) -> Option<CircuitBreakerHandle> {
        let map = self.inner.read().expect("circuit breaker registry poisoned");
        map.get(name).cloned()
    }

    fn reset(&self, name: &str) -> Result<(), CircuitBreakerRegistryError> {
        let map = self.inner.read().expect("circuit breaker registry poisoned");
        match map.get(name) {
            Some(handle) => {
                handle.reset();
                Ok(())
            }
            None => Err(CircuitBreakerRegistryError::NotFound { name: name.to_string() }),
        }
    }

    fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let map = self.inner.read().expect("circuit breaker registry poisoned");
        let mut entries: Vec<(String, CircuitState)> =
            map.iter().map(|(k, v)| (k.clone(), v.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
