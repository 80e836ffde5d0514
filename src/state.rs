//! Circuit state model and the persisted per-circuit record
//!
//! The transition rules live here, on [`CircuitRecord`], so that every
//! storage backend applies exactly the same state machine. Backends only
//! decide how the record is locked or compare-and-swapped; they never
//! reinterpret the rules.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::clock;

/// State of a circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed,
    /// Cool-down window active, calls are rejected immediately
    Open,
    /// Cool-down elapsed, a single probe call may test recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// The persisted unit: one record per circuit name.
///
/// The record is the only authoritative state a circuit has. Breaker
/// objects hold no counters of their own, so any number of processes
/// bound to the same backing store observe a consistent view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitRecord {
    /// Unique circuit name, immutable once created
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures observed while Closed
    pub failure_count: u32,
    /// Wall-clock instant the circuit last opened, set only while Open
    pub opened_at: Option<f64>,
    /// Whether the single half-open probe slot is currently claimed
    #[serde(default)]
    pub probe_in_flight: bool,
    /// When the probe slot was claimed, for reclaiming abandoned probes
    #[serde(default)]
    pub probe_acquired_at: Option<f64>,
    /// Consecutive failures tolerated while Closed before opening
    pub threshold: u32,
    /// Cool-down duration in seconds before Open may probe
    pub ttl: f64,
}

impl CircuitRecord {
    /// Fresh Closed record. `threshold` and `ttl` are fixed for the
    /// lifetime of the circuit.
    pub fn new(name: impl Into<String>, threshold: u32, ttl: f64) -> Self {
        Self {
            name: name.into(),
            state: CircuitState::Closed,
            failure_count: 0,
            opened_at: None,
            probe_in_flight: false,
            probe_acquired_at: None,
            threshold,
            ttl,
        }
    }

    /// Lazy expiry check, applied by every storage read before the record
    /// is returned. Open circuits whose cool-down elapsed move to
    /// HalfOpen; a probe slot whose holder never reported an outcome is
    /// released after a further `ttl`. Returns true when the state
    /// changed.
    pub fn refresh(&mut self, now: f64) -> bool {
        match self.state {
            CircuitState::Open => {
                let expired = self
                    .opened_at
                    .is_some_and(|opened_at| now >= clock::expires_at(opened_at, self.ttl));
                if expired {
                    self.state = CircuitState::HalfOpen;
                    self.opened_at = None;
                    self.probe_in_flight = false;
                    self.probe_acquired_at = None;
                    return true;
                }
                false
            }
            CircuitState::HalfOpen => {
                let abandoned = self.probe_in_flight
                    && self
                        .probe_acquired_at
                        .is_some_and(|acquired| now >= clock::expires_at(acquired, self.ttl));
                if abandoned {
                    self.probe_in_flight = false;
                    self.probe_acquired_at = None;
                }
                false
            }
            CircuitState::Closed => false,
        }
    }

    /// Apply the failure rule for the current state.
    pub fn record_failure(&mut self, now: f64) {
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.threshold {
                    self.trip(now);
                }
            }
            CircuitState::HalfOpen => self.trip(now),
            // A straggler reporting after the circuit re-opened must not
            // extend the current window.
            CircuitState::Open => {}
        }
    }

    /// Apply the success rule for the current state.
    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::Closed => self.failure_count = 0,
            CircuitState::HalfOpen => {
                self.state = CircuitState::Closed;
                self.failure_count = 0;
                self.opened_at = None;
                self.probe_in_flight = false;
                self.probe_acquired_at = None;
            }
            // A success observed while Open belongs to a call admitted
            // before the circuit tripped; the record stays untouched.
            CircuitState::Open => {}
        }
    }

    /// Claim the single half-open probe slot. Succeeds at most once per
    /// Open -> HalfOpen window.
    pub fn try_acquire_probe(&mut self, now: f64) -> bool {
        if self.state == CircuitState::HalfOpen && !self.probe_in_flight {
            self.probe_in_flight = true;
            self.probe_acquired_at = Some(now);
            true
        } else {
            false
        }
    }

    fn trip(&mut self, now: f64) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.failure_count = 0;
        self.probe_in_flight = false;
        self.probe_acquired_at = None;
    }
}
