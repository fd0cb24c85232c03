//! The server half of the synchronization engine: the append-only change
//! log, the idempotency-key dedup store, the per-user entity repositories,
//! and the `axum` HTTP surface over §6's JSON contract. Repositories are
//! exposed as trait objects; the in-memory implementations here are
//! reference implementations good enough to drive the seed scenarios — a
//! production deployment swaps in a Postgres/PostgREST-backed store behind
//! the same traits.

pub mod change_log;
pub mod idempotency;
pub mod repository;
pub mod routes;

pub use change_log::{ChangeLogStore, ChangesPage, InMemoryChangeLogStore};
pub use idempotency::{IdempotencyStore, InMemoryIdempotencyStore};
pub use repository::{BatchCreateOutcome, EntityRepository, InMemoryEntityRepository};
pub use routes::{router, AppState};
