//! The circuit breaker: a stateless accessor bound to one name
//!
//! Every transition is delegated to, and authoritative in, the backing
//! store, so any number of breaker instances (same name, same store,
//! different processes) observe a consistent view. The breaker itself
//! only carries wiring: the name, the store handle, and the event bus.

use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

use crate::errors::{CircuitError, StorageError};
use crate::events::{CircuitEvent, EventBus};
use crate::state::CircuitState;
use crate::storage::{StorageBackend, Transition};

/// Result of the admission check at guarded-call entry.
enum Admission {
    /// Circuit is closed, the call proceeds normally.
    Allowed,
    /// Circuit is half-open and this call won the probe slot.
    AllowedProbe,
    /// Circuit is open and the cool-down has not elapsed.
    RejectedOpen,
    /// Circuit is half-open but another probe is outstanding.
    RejectedProbePending,
}

/// A named circuit breaker. Obtain instances through
/// [`Registry::get`](crate::Registry::get).
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: String,
    storage: Arc<dyn StorageBackend>,
    events: EventBus,
}

impl CircuitBreaker {
    pub(crate) fn new(name: impl Into<String>, storage: Arc<dyn StorageBackend>, events: EventBus) -> Self {
        Self {
            name: name.into(),
            storage,
            events,
        }
    }

    /// Name of the circuit this breaker guards.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, read from the backing store.
    pub async fn state(&self) -> Result<CircuitState, StorageError> {
        let transition = self.storage.read(&self.name).await?;
        self.publish_transition(&transition);
        Ok(transition.record.state)
    }

    /// Consecutive failures recorded since the circuit last entered
    /// Closed. Meaningful only while Closed.
    pub async fn failure_count(&self) -> Result<u32, StorageError> {
        let transition = self.storage.read(&self.name).await?;
        self.publish_transition(&transition);
        Ok(transition.record.failure_count)
    }

    /// Run a protected operation under this circuit.
    ///
    /// Entry consults the store: a Closed circuit admits the call, an
    /// Open one rejects it with [`CircuitError::Open`] without touching
    /// the downstream, and a HalfOpen one admits only the single caller
    /// that wins the probe slot. On success the failure count resets; a
    /// store that fails while recording the success propagates as
    /// [`CircuitError::Storage`]. On failure the count is recorded and
    /// the operation's own error is re-surfaced as
    /// [`CircuitError::Execution`], never swallowed.
    ///
    /// No timeout is imposed on `f`; a caller-cancelled or timed-out
    /// operation takes the failure path like any other error.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.admit().await? {
            Admission::RejectedOpen | Admission::RejectedProbePending => {
                Err(CircuitError::Open {
                    circuit: self.name.clone(),
                })
            }
            Admission::Allowed | Admission::AllowedProbe => match f().await {
                Ok(value) => {
                    self.on_success().await?;
                    Ok(value)
                }
                Err(err) => {
                    self.on_failure().await;
                    Err(CircuitError::Execution(err))
                }
            },
        }
    }

    async fn admit(&self) -> Result<Admission, StorageError> {
        let transition = self.storage.read(&self.name).await?;
        self.publish_transition(&transition);

        match transition.record.state {
            CircuitState::Closed => Ok(Admission::Allowed),
            CircuitState::Open => Ok(Admission::RejectedOpen),
            CircuitState::HalfOpen => {
                if self.storage.try_acquire_probe(&self.name).await? {
                    Ok(Admission::AllowedProbe)
                } else {
                    Ok(Admission::RejectedProbePending)
                }
            }
        }
    }

    /// Record a success. Storage failures propagate here: nothing else is
    /// owed to the caller, and a success the store never saw must not
    /// look committed.
    async fn on_success(&self) -> Result<(), StorageError> {
        let transition = self.storage.record_success(&self.name).await?;
        if transition.from == CircuitState::HalfOpen
            && transition.record.state == CircuitState::Closed
        {
            self.events.emit(&CircuitEvent::Recovered {
                circuit: self.name.clone(),
            });
        }
        self.publish_transition(&transition);
        Ok(())
    }

    /// Record a failure. The protected call's own error is about to
    /// propagate regardless; a bookkeeping failure only gets logged.
    async fn on_failure(&self) {
        match self.storage.record_failure(&self.name).await {
            Ok(transition) => {
                self.events.emit(&CircuitEvent::Failed {
                    circuit: self.name.clone(),
                    failure_count: transition.record.failure_count,
                    state: transition.record.state,
                });
                self.publish_transition(&transition);
            }
            Err(err) => {
                warn!(circuit = %self.name, error = %err, "failed to record failure");
            }
        }
    }

    fn publish_transition(&self, transition: &Transition) {
        if transition.changed() {
            info!(
                circuit = %self.name,
                from = %transition.from,
                to = %transition.record.state,
                "circuit state changed"
            );
            self.events.emit(&CircuitEvent::StateChanged {
                circuit: self.name.clone(),
                from: transition.from,
                to: transition.record.state,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::io;
    use std::sync::Mutex;
    use std::time::Duration;

    async fn breaker(threshold: u32, ttl: f64) -> (CircuitBreaker, Arc<MemoryStorage>) {
        breaker_with_bus(threshold, ttl, EventBus::new()).await
    }

    async fn breaker_with_bus(
        threshold: u32,
        ttl: f64,
        events: EventBus,
    ) -> (CircuitBreaker, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .get_or_create("api", threshold, ttl)
            .await
            .unwrap();
        (
            CircuitBreaker::new("api", storage.clone(), events),
            storage,
        )
    }

    fn io_err() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionRefused, "downstream down")
    }

    #[tokio::test]
    async fn test_fourth_call_rejected_after_three_failures() {
        let (breaker, _) = breaker(3, 10.0).await;

        for _ in 0..3 {
            let result = breaker.call(|| async { Err::<(), _>(io_err()) }).await;
            assert!(matches!(result, Err(CircuitError::Execution(_))));
        }

        // Rejected immediately, downstream never invoked.
        let invoked = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let invoked_by_call = invoked.clone();
        let result = breaker
            .call(move || async move {
                invoked_by_call.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok::<(), io::Error>(())
            })
            .await;
        assert!(matches!(result, Err(CircuitError::Open { .. })));
        assert!(!invoked.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let (breaker, _) = breaker(3, 10.0).await;

        let _ = breaker.call(|| async { Err::<(), _>(io_err()) }).await;
        let _ = breaker.call(|| async { Err::<(), _>(io_err()) }).await;
        assert_eq!(breaker.failure_count().await.unwrap(), 2);

        breaker
            .call(|| async { Ok::<_, io::Error>(()) })
            .await
            .unwrap();
        assert_eq!(breaker.failure_count().await.unwrap(), 0);
        assert_eq!(breaker.state().await.unwrap(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_probe_recovers_circuit_after_ttl() {
        let (breaker, _) = breaker(1, 0.05).await;

        let _ = breaker.call(|| async { Err::<(), _>(io_err()) }).await;
        assert_eq!(breaker.state().await.unwrap(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;

        breaker
            .call(|| async { Ok::<_, io::Error>(()) })
            .await
            .unwrap();
        assert_eq!(breaker.state().await.unwrap(), CircuitState::Closed);
        assert_eq!(breaker.failure_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_probe_reopens_circuit() {
        let (breaker, _) = breaker(1, 0.05).await;

        let _ = breaker.call(|| async { Err::<(), _>(io_err()) }).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let result = breaker.call(|| async { Err::<(), _>(io_err()) }).await;
        assert!(matches!(result, Err(CircuitError::Execution(_))));
        assert_eq!(breaker.state().await.unwrap(), CircuitState::Open);

        // The new window starts from the probe failure.
        let result = breaker.call(|| async { Ok::<_, io::Error>(()) }).await;
        assert!(matches!(result, Err(CircuitError::Open { .. })));
    }

    #[tokio::test]
    async fn test_only_one_probe_admitted_per_window() {
        let (breaker, storage) = breaker(1, 0.05).await;

        let _ = breaker.call(|| async { Err::<(), _>(io_err()) }).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        // First caller takes the slot; a second arriving before the
        // probe's outcome is committed gets rejected.
        assert_eq!(breaker.state().await.unwrap(), CircuitState::HalfOpen);
        assert!(storage.try_acquire_probe("api").await.unwrap());

        let result = breaker.call(|| async { Ok::<_, io::Error>(()) }).await;
        assert!(matches!(result, Err(CircuitError::Open { .. })));
    }

    #[tokio::test]
    async fn test_emits_failed_state_changed_and_recovered() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_hook = seen.clone();
        let mut bus = EventBus::new();
        bus.subscribe(Arc::new(move |event: &CircuitEvent| {
            seen_hook.lock().unwrap().push(event.clone());
        }));
        let (breaker, _) = breaker_with_bus(1, 0.05, bus).await;

        let _ = breaker.call(|| async { Err::<(), _>(io_err()) }).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        breaker
            .call(|| async { Ok::<_, io::Error>(()) })
            .await
            .unwrap();

        let events = seen.lock().unwrap().clone();
        assert!(events.contains(&CircuitEvent::Failed {
            circuit: "api".to_string(),
            failure_count: 0,
            state: CircuitState::Open,
        }));
        assert!(events.contains(&CircuitEvent::StateChanged {
            circuit: "api".to_string(),
            from: CircuitState::Closed,
            to: CircuitState::Open,
        }));
        assert!(events.contains(&CircuitEvent::StateChanged {
            circuit: "api".to_string(),
            from: CircuitState::Open,
            to: CircuitState::HalfOpen,
        }));
        assert!(events.contains(&CircuitEvent::Recovered {
            circuit: "api".to_string(),
        }));
        assert!(events.contains(&CircuitEvent::StateChanged {
            circuit: "api".to_string(),
            from: CircuitState::HalfOpen,
            to: CircuitState::Closed,
        }));
    }

    #[tokio::test]
    async fn test_store_outage_during_success_recording_fails_loud() {
        use crate::storage::RemoteStorage;
        use crate::storage::testkv::FakeKvClient;

        let client = Arc::new(FakeKvClient::new());
        let storage = Arc::new(RemoteStorage::new(client.clone()));
        storage.get_or_create("api", 3, 10.0).await.unwrap();
        let breaker = CircuitBreaker::new("api", storage, EventBus::new());

        // Store goes down between admission and outcome; the caller must
        // see the storage error, not a success the store never recorded.
        let client_in_call = client.clone();
        let result = breaker
            .call(move || async move {
                client_in_call.set_down(true);
                Ok::<_, io::Error>("value")
            })
            .await;
        assert!(matches!(result, Err(CircuitError::Storage(_))));
    }

    #[tokio::test]
    async fn test_storage_failure_surfaces_as_storage_error() {
        use crate::storage::RemoteStorage;
        use crate::storage::testkv::FakeKvClient;

        let client = Arc::new(FakeKvClient::new());
        let storage = Arc::new(RemoteStorage::new(client.clone()));
        storage.get_or_create("api", 3, 10.0).await.unwrap();
        let breaker = CircuitBreaker::new("api", storage, EventBus::new());

        client.set_down(true);
        let result = breaker.call(|| async { Ok::<_, io::Error>(()) }).await;
        assert!(matches!(result, Err(CircuitError::Storage(_))));
    }

    #[tokio::test]
    async fn test_protected_error_is_propagated_verbatim() {
        let (breaker, _) = breaker(5, 10.0).await;

        let result = breaker.call(|| async { Err::<(), _>(io_err()) }).await;
        match result {
            Err(CircuitError::Execution(err)) => {
                assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
            }
            other => panic!("expected Execution error, got {other:?}"),
        }
    }
}
