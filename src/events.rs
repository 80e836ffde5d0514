//! Event bus for circuit lifecycle notifications
//!
//! Hooks are registered once, on the registry, and invoked synchronously
//! in registration order for every emitted event. A panicking hook is
//! caught and logged; observability must never break the protected call
//! path.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::warn;

use crate::state::CircuitState;

/// Lifecycle events emitted by breakers and the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum CircuitEvent {
    /// A circuit's record was created in the backing store. Emitted once
    /// per name; re-requesting an existing circuit stays silent.
    Created { circuit: String },
    /// The circuit moved between states, including lazy Open -> HalfOpen
    /// expiry observed on a read.
    StateChanged {
        circuit: String,
        from: CircuitState,
        to: CircuitState,
    },
    /// A failure was recorded, whether or not it flipped the state.
    Failed {
        circuit: String,
        failure_count: u32,
        state: CircuitState,
    },
    /// A half-open probe succeeded and the circuit closed.
    Recovered { circuit: String },
}

impl CircuitEvent {
    /// Name of the circuit the event concerns.
    pub fn circuit(&self) -> &str {
        match self {
            CircuitEvent::Created { circuit }
            | CircuitEvent::StateChanged { circuit, .. }
            | CircuitEvent::Failed { circuit, .. }
            | CircuitEvent::Recovered { circuit } => circuit,
        }
    }
}

/// A registered event callback.
pub type Hook = Arc<dyn Fn(&CircuitEvent) + Send + Sync>;

/// Fan-out of circuit events to registered hooks.
#[derive(Clone, Default)]
pub struct EventBus {
    hooks: Vec<Hook>,
}

impl EventBus {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    /// Register a hook. Hooks fire in registration order.
    pub fn subscribe(&mut self, hook: Hook) {
        self.hooks.push(hook);
    }

    /// Invoke every hook with the event. Panics inside a hook are caught
    /// and logged so later hooks and the caller still run.
    pub fn emit(&self, event: &CircuitEvent) {
        for hook in &self.hooks {
            if catch_unwind(AssertUnwindSafe(|| hook(event))).is_err() {
                warn!(circuit = event.circuit(), "event hook panicked, ignoring");
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("hooks", &self.hooks.len())
            .finish()
    }
}
