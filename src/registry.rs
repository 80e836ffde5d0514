//! Registry: creates, caches and wires named circuit breakers
//!
//! The registry is the only public entry point applications use. It is an
//! explicit, injectable object rather than process-wide state, so tests
//! construct isolated registries freely.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::circuit::CircuitBreaker;
use crate::errors::StorageError;
use crate::events::{CircuitEvent, EventBus};
use crate::storage::{MemoryStorage, StorageBackend};

/// Per-circuit settings, fixed at record-creation time.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitConfig {
    /// Consecutive failures tolerated while Closed before opening
    pub threshold: u32,
    /// Cool-down in seconds before an Open circuit may probe
    pub ttl: f64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            ttl: 30.0,
        }
    }
}

/// Factory and cache for named [`CircuitBreaker`]s, all bound to one
/// backing store and one hook list.
#[derive(Debug)]
pub struct Registry {
    storage: Arc<dyn StorageBackend>,
    events: EventBus,
    defaults: CircuitConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl Registry {
    /// Start configuring a registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Registry over an in-memory store with default settings.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Return the breaker for `name`, creating it with the registry's
    /// default threshold and ttl on first request.
    pub async fn get(&self, name: &str) -> Result<Arc<CircuitBreaker>, StorageError> {
        self.get_with(name, self.defaults.clone()).await
    }

    /// Return the breaker for `name`, creating its record with `config`
    /// on first request. If any process already created the record, the
    /// existing threshold and ttl win and `config` is ignored
    /// (first-writer-wins).
    ///
    /// # Panics
    ///
    /// Panics if `config.threshold` is 0 or `config.ttl` is not positive,
    /// matching the builder's validation.
    pub async fn get_with(
        &self,
        name: &str,
        config: CircuitConfig,
    ) -> Result<Arc<CircuitBreaker>, StorageError> {
        assert!(config.threshold > 0, "threshold must be positive");
        assert!(config.ttl > 0.0, "ttl must be positive");

        let mut breakers = self.breakers.lock().await;
        if let Some(breaker) = breakers.get(name) {
            return Ok(breaker.clone());
        }

        let (record, created) = self
            .storage
            .get_or_create(name, config.threshold, config.ttl)
            .await?;
        if created {
            self.events.emit(&CircuitEvent::Created {
                circuit: name.to_string(),
            });
        }
        debug!(
            circuit = name,
            threshold = record.threshold,
            ttl = record.ttl,
            created,
            "circuit bound"
        );

        let breaker = Arc::new(CircuitBreaker::new(
            name,
            self.storage.clone(),
            self.events.clone(),
        ));
        breakers.insert(name.to_string(), breaker.clone());
        Ok(breaker)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for a [`Registry`] with fluent configuration.
pub struct RegistryBuilder {
    storage: Option<Arc<dyn StorageBackend>>,
    defaults: CircuitConfig,
    events: EventBus,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self {
            storage: None,
            defaults: CircuitConfig::default(),
            events: EventBus::new(),
        }
    }

    /// Default failure threshold for circuits created by this registry.
    ///
    /// # Panics
    ///
    /// Panics if `threshold` is 0.
    pub fn threshold(mut self, threshold: u32) -> Self {
        assert!(threshold > 0, "threshold must be positive");
        self.defaults.threshold = threshold;
        self
    }

    /// Default cool-down in seconds before an Open circuit may probe.
    ///
    /// # Panics
    ///
    /// Panics if `ttl` is not positive.
    pub fn ttl_secs(mut self, ttl: f64) -> Self {
        assert!(ttl > 0.0, "ttl must be positive");
        self.defaults.ttl = ttl;
        self
    }

    /// Backing store shared by every breaker from this registry.
    /// Defaults to a fresh [`MemoryStorage`].
    pub fn storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Register an event hook. May be called multiple times; hooks fire
    /// in registration order.
    pub fn on_event<F>(mut self, hook: F) -> Self
    where
        F: Fn(&CircuitEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(Arc::new(hook));
        self
    }

    /// Build the registry.
    pub fn build(self) -> Registry {
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));

        Registry {
            storage,
            events: self.events,
            defaults: self.defaults,
            breakers: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}
