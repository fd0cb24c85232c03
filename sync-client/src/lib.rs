//! The client half of the synchronization engine: a durable local store, a
//! mutation queue, a batching push pipeline guarded by a circuit breaker, a
//! cursor-based pull pipeline, full-resync bootstrap, relationship
//! reconciliation, and the scheduler that drives them all single-flight.

pub mod bootstrap;
pub mod circuit_breaker;
pub mod local_store;
pub mod mutation_queue;
pub mod pull;
pub mod push;
pub mod reconcile;
pub mod scheduler;
pub mod transport;

#[cfg(test)]
mod fake_transport;

pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use local_store::{LocalStore, PendingMutationRow, StoredEntity, SyncStatus};
pub use scheduler::{Scheduler, SchedulerState, SyncHistoryEntry};
pub use transport::{HttpTransport, SyncTransport};

pub use sync_core::{ChangeLogEntry, EntityId, EntityKind, Error, Operation, PropertyValue, Result, SyncConfig};
