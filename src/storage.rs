//! Storage backends holding the authoritative circuit records
//!
//! Two implementations of the same five-operation port:
//! - `MemoryStorage`: single-process, a mutex-guarded name -> record map
//! - `RemoteStorage`: multi-process, optimistic compare-and-swap writes
//!   against a shared key-value store
//!
//! Every operation is atomic on its own; no caller mutates a record
//! outside these operations.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use crate::clock;
use crate::errors::StorageError;
use crate::state::{CircuitRecord, CircuitState};

/// Outcome of a storage operation that may have moved the record through
/// a transition. `from` is the state before the operation applied its
/// rule, letting the breaker emit state-change events without the store
/// knowing about hooks.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: CircuitState,
    pub record: CircuitRecord,
}

impl Transition {
    /// True when the operation changed the circuit's state.
    pub fn changed(&self) -> bool {
        self.from != self.record.state
    }
}

/// Abstract transactional boundary over a circuit's record.
///
/// Each operation is an atomic read-modify-write. Within one process the
/// in-memory backend serializes them behind a lock; across processes the
/// remote backend relies on the store's compare-and-swap.
#[async_trait]
pub trait StorageBackend: Send + Sync + fmt::Debug {
    /// Return the existing record for `name`, or insert a fresh Closed
    /// record. Idempotent: an existing record is returned unchanged, with
    /// the flag reporting whether this call created it.
    async fn get_or_create(
        &self,
        name: &str,
        threshold: u32,
        ttl: f64,
    ) -> Result<(CircuitRecord, bool), StorageError>;

    /// Read the record, applying the lazy Open -> HalfOpen expiry check
    /// before returning.
    async fn read(&self, name: &str) -> Result<Transition, StorageError>;

    /// Apply the failure transition rule and return the post-transition
    /// record.
    async fn record_failure(&self, name: &str) -> Result<Transition, StorageError>;

    /// Apply the success transition rule and return the post-transition
    /// record.
    async fn record_success(&self, name: &str) -> Result<Transition, StorageError>;

    /// Claim the single probe slot of a half-open circuit. Succeeds at
    /// most once per Open -> HalfOpen window.
    async fn try_acquire_probe(&self, name: &str) -> Result<bool, StorageError>;
}

/// Single-process storage: a name -> record map behind one lock.
///
/// The lock serializes all five operations, which is the entirety of the
/// linearizability argument for the in-memory case.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    records: Mutex<HashMap<String, CircuitRecord>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    async fn update<T>(
        &self,
        name: &str,
        apply: impl FnOnce(&mut CircuitRecord) -> T,
    ) -> Result<(Transition, T), StorageError> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(name)
            .ok_or_else(|| StorageError::UnknownCircuit(name.to_string()))?;
        let from = record.state;
        let out = apply(record);
        Ok((
            Transition {
                from,
                record: record.clone(),
            },
            out,
        ))
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn get_or_create(
        &self,
        name: &str,
        threshold: u32,
        ttl: f64,
    ) -> Result<(CircuitRecord, bool), StorageError> {
        let mut records = self.records.lock().await;
        if let Some(existing) = records.get(name) {
            return Ok((existing.clone(), false));
        }
        let record = CircuitRecord::new(name, threshold, ttl);
        records.insert(name.to_string(), record.clone());
        Ok((record, true))
    }

    async fn read(&self, name: &str) -> Result<Transition, StorageError> {
        let (transition, _) = self
            .update(name, |record| {
                record.refresh(clock::now());
            })
            .await?;
        Ok(transition)
    }

    async fn record_failure(&self, name: &str) -> Result<Transition, StorageError> {
        let (transition, _) = self
            .update(name, |record| {
                let now = clock::now();
                record.refresh(now);
                record.record_failure(now);
            })
            .await?;
        Ok(transition)
    }

    async fn record_success(&self, name: &str) -> Result<Transition, StorageError> {
        let (transition, _) = self
            .update(name, |record| {
                record.refresh(clock::now());
                record.record_success();
            })
            .await?;
        Ok(transition)
    }

    async fn try_acquire_probe(&self, name: &str) -> Result<bool, StorageError> {
        let (_, acquired) = self
            .update(name, |record| {
                let now = clock::now();
                record.refresh(now);
                record.try_acquire_probe(now)
            })
            .await?;
        Ok(acquired)
    }
}

/// Minimal contract this crate consumes from a shared key-value store.
///
/// The store must offer at least single-key linearizability for
/// `compare_and_set`; everything else about the client (connection
/// handling, clustering, timeouts) is the implementor's concern.
#[async_trait]
pub trait KeyValueClient: Send + Sync + fmt::Debug {
    /// Fetch the value stored at `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Unconditionally store `value` at `key`.
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Store `value` only if the current value still equals `expected`
    /// (`None` meaning the key must be absent). Returns false when the
    /// comparison failed and nothing was written.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, StorageError>;
}

fn encode(record: &CircuitRecord) -> Result<String, StorageError> {
    serde_json::to_string(record).map_err(|e| StorageError::Codec(e.to_string()))
}

fn decode(raw: &str) -> Result<CircuitRecord, StorageError> {
    serde_json::from_str(raw).map_err(|e| StorageError::Codec(e.to_string()))
}

/// Multi-process storage over a shared key-value store.
///
/// Records are stored as JSON under `{key_prefix}{name}`. Mutations are
/// optimistic versioned writes: read the raw value, apply the transition
/// rule, then compare-and-swap the new encoding against the value read.
/// Conflicts retry with jittered exponential backoff, bounded by
/// `max_attempts`; exhaustion surfaces as `StorageError::Unavailable`.
#[derive(Debug, Clone)]
pub struct RemoteStorage {
    client: Arc<dyn KeyValueClient>,
    key_prefix: String,
    max_attempts: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    multiplier: f64,
    jitter: f64,
}

impl RemoteStorage {
    pub fn new(client: Arc<dyn KeyValueClient>) -> Self {
        Self {
            client,
            key_prefix: "circuit:".to_string(),
            max_attempts: 5,
            base_delay_ms: 10,
            max_delay_ms: 250,
            multiplier: 2.0,
            jitter: 0.25,
        }
    }

    /// Namespace prefix for record keys (default `circuit:`).
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Cap on compare-and-set attempts per operation. Clamped to the
    /// backoff policy's attempt range (1..=255).
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.clamp(1, u8::MAX as u32);
        self
    }

    /// Jitter factor applied to the backoff between attempts
    /// (0.0 = none, 1.0 = full jitter).
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.key_prefix, name)
    }

    /// Optimistic read-modify-write loop shared by every mutating
    /// operation. Unchanged records skip the write entirely.
    async fn update<T>(
        &self,
        name: &str,
        apply: impl Fn(&mut CircuitRecord) -> T + Send,
    ) -> Result<(Transition, T), StorageError> {
        let key = self.key(name);
        let policy = chrono_machines::Policy {
            max_attempts: 1,
            base_delay_ms: self.base_delay_ms,
            multiplier: self.multiplier,
            max_delay_ms: self.max_delay_ms,
        };

        for attempt in 1..=self.max_attempts {
            let raw = self
                .client
                .get(&key)
                .await?
                .ok_or_else(|| StorageError::UnknownCircuit(name.to_string()))?;
            let mut record = decode(&raw)?;
            let from = record.state;
            let out = apply(&mut record);
            let encoded = encode(&record)?;

            if encoded == raw {
                return Ok((Transition { from, record }, out));
            }
            if self
                .client
                .compare_and_set(&key, Some(&raw), &encoded)
                .await?
            {
                return Ok((Transition { from, record }, out));
            }

            debug!(circuit = name, attempt, "compare-and-set conflict, backing off");
            let delay_ms = policy.calculate_delay(attempt as u8, self.jitter);
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        Err(StorageError::Unavailable(format!(
            "compare-and-set contention for circuit '{name}' persisted after {} attempts",
            self.max_attempts
        )))
    }
}

#[async_trait]
impl StorageBackend for RemoteStorage {
    async fn get_or_create(
        &self,
        name: &str,
        threshold: u32,
        ttl: f64,
    ) -> Result<(CircuitRecord, bool), StorageError> {
        let key = self.key(name);

        // At most two rounds: losing the creation race means somebody
        // else just wrote the record, so the reread must find it.
        for _ in 0..2 {
            if let Some(raw) = self.client.get(&key).await? {
                return Ok((decode(&raw)?, false));
            }
            let record = CircuitRecord::new(name, threshold, ttl);
            let encoded = encode(&record)?;
            if self.client.compare_and_set(&key, None, &encoded).await? {
                return Ok((record, true));
            }
        }

        Err(StorageError::Unavailable(format!(
            "could not create record for circuit '{name}'"
        )))
    }

    async fn read(&self, name: &str) -> Result<Transition, StorageError> {
        let (transition, _) = self
            .update(name, |record| {
                record.refresh(clock::now());
            })
            .await?;
        Ok(transition)
    }

    async fn record_failure(&self, name: &str) -> Result<Transition, StorageError> {
        let (transition, _) = self
            .update(name, |record| {
                let now = clock::now();
                record.refresh(now);
                record.record_failure(now);
            })
            .await?;
        Ok(transition)
    }

    async fn record_success(&self, name: &str) -> Result<Transition, StorageError> {
        let (transition, _) = self
            .update(name, |record| {
                record.refresh(clock::now());
                record.record_success();
            })
            .await?;
        Ok(transition)
    }

    async fn try_acquire_probe(&self, name: &str) -> Result<bool, StorageError> {
        let (_, acquired) = self
            .update(name, |record| {
                let now = clock::now();
                record.refresh(now);
                record.try_acquire_probe(now)
            })
            .await?;
        Ok(acquired)
    }
}
