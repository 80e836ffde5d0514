//! Tripswitch - named, shared circuit breakers with pluggable persistence
//!
//! This crate provides the fail-fast/fail-recover state machine and its
//! persistence contract:
//! - Three-state lifecycle (Closed → Open → HalfOpen) driven by
//!   consecutive-failure thresholds and a cool-down ttl
//! - Authoritative state in a backing store: in-memory for one process,
//!   a remote key-value store for many processes sharing one circuit
//! - Lazy expiry: the open window is data checked on read, no timers
//! - A registry that creates and caches named breakers and fans
//!   lifecycle events out to registered hooks
//!
//! # Example
//!
//! ```no_run
//! use tripswitch::{CircuitError, Registry};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Registry::builder()
//!     .threshold(3)
//!     .ttl_secs(10.0)
//!     .on_event(|event| println!("circuit event: {event:?}"))
//!     .build();
//!
//! let breaker = registry.get("payment_api").await?;
//!
//! match breaker.call(|| async { payment_request().await }).await {
//!     Ok(receipt) => println!("paid: {receipt}"),
//!     Err(CircuitError::Open { circuit }) => println!("{circuit} is open, using fallback"),
//!     Err(CircuitError::Storage(e)) => return Err(e.into()),
//!     Err(CircuitError::Execution(e)) => return Err(e.into()),
//! }
//! # Ok(())
//! # }
//! # async fn payment_request() -> Result<String, std::io::Error> { Ok("ok".to_string()) }
//! ```
//!
//! Multiple processes share a circuit by handing the registry a
//! [`RemoteStorage`] built over any [`KeyValueClient`] implementation;
//! the breaker itself holds no state, so every instance bound to the
//! same store observes the same view.

mod clock;

pub mod circuit;
pub mod errors;
pub mod events;
pub mod registry;
pub mod state;
pub mod storage;

pub use circuit::CircuitBreaker;
pub use errors::{CircuitError, StorageError};
pub use events::{CircuitEvent, EventBus, Hook};
pub use registry::{CircuitConfig, Registry, RegistryBuilder};
pub use state::{CircuitRecord, CircuitState};
pub use storage::{KeyValueClient, MemoryStorage, RemoteStorage, StorageBackend, Transition};
