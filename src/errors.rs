//! Error types for circuit breaker operations

use thiserror::Error;

/// Errors raised by a backing store.
///
/// A breaker never guesses a state when its store is unreachable; these
/// errors propagate so the caller decides whether to fail open or closed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// The store could not complete an atomic operation (network failure,
    /// store down, or compare-and-set contention that outlasted the retry
    /// budget).
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),

    /// No record exists for the circuit. Breakers obtained through the
    /// registry always create their record first, so this points at a
    /// store that lost data or a name that bypassed the registry.
    #[error("no record found for circuit '{0}'")]
    UnknownCircuit(String),

    /// The stored record could not be encoded or decoded.
    #[error("bad circuit record encoding: {0}")]
    Codec(String),
}

/// Errors surfaced by a guarded call, generic over the protected
/// operation's own error type.
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// The call was rejected without invoking the downstream: the circuit
    /// is open, or half-open with the probe slot already taken.
    #[error("circuit '{circuit}' is open")]
    Open { circuit: String },

    /// The backing store failed before the call could be admitted.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The protected call itself failed. Always propagated after the
    /// failure has been recorded.
    #[error("protected call failed: {0}")]
    Execution(E),
}

impl<E> CircuitError<E> {
    /// True when the call was rejected by the breaker rather than failed
    /// downstream.
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitError::Open { .. })
    }
}
