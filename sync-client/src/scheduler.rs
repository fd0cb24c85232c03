//! §4.11: the single-flight scheduler. Generalized from `state_machine.rs`'s
//! `SetupStateMachine` — "an explicit state the engine transitions through,
//! with a guard stopping re-entrant runs" is the idiom kept; the
//! meta-global/crypto-key handshake that state machine drove is gone, since
//! this engine has no equivalent negotiation step.
//!
//! Modeled as a `parking_lot::Mutex`-guarded single-writer rather than an
//! async actor: every public method takes the lock, does synchronous I/O
//! through `store`/`transport`, and releases it. `force_full_resync`'s
//! bounded wait uses a `Condvar` the same way `interrupt-support` gates a
//! cooperative cancellation point on a deadline.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use parking_lot::{Condvar, Mutex};
use sync_core::{Operation, SyncConfig};

use crate::bootstrap;
use crate::circuit_breaker::CircuitBreaker;
use crate::local_store::LocalStore;
use crate::pull;
use crate::push;
use crate::reconcile;
use crate::transport::SyncTransport;

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerState {
    Idle,
    Syncing { done: usize, total: usize },
    Pulling,
    RateLimited { retry_after: Duration, pending: usize },
    Error { message: String },
}

#[derive(Debug, Clone)]
pub struct SyncHistoryEntry {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub items_synced: usize,
    pub status: &'static str,
    pub error: Option<String>,
}

struct Inner {
    state: SchedulerState,
    is_syncing: bool,
    force_bootstrap: bool,
    breaker: CircuitBreaker,
    history: Vec<SyncHistoryEntry>,
}

/// Owns the local store, the transport, and every piece of state the spec
/// reserves exclusively for the Scheduler: circuit-breaker fields and
/// `pending_delete_ids`. No other module mutates these.
pub struct Scheduler {
    store: LocalStore,
    transport: Box<dyn SyncTransport>,
    config: SyncConfig,
    env: String,
    inner: Mutex<Inner>,
    sync_done: Condvar,
}

impl Scheduler {
    pub fn new(store: LocalStore, transport: Box<dyn SyncTransport>, config: SyncConfig, env: impl Into<String>) -> Self {
        Scheduler {
            store,
            transport,
            config,
            env: env.into(),
            inner: Mutex::new(Inner {
                state: SchedulerState::Idle,
                is_syncing: false,
                force_bootstrap: false,
                breaker: CircuitBreaker::new(),
                history: Vec::new(),
            }),
            sync_done: Condvar::new(),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.inner.lock().state.clone()
    }

    pub fn history(&self) -> Vec<SyncHistoryEntry> {
        self.inner.lock().history.clone()
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// §4.11's `perform_sync`. Single-flight: a second caller observing
    /// `is_syncing == true` returns immediately without touching the
    /// network or the local store.
    pub fn perform_sync(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.is_syncing {
                return;
            }
            inner.is_syncing = true;
        }

        let started_at = Utc::now();
        let start = Instant::now();
        let result = self.run_sync_cycle();
        let duration_ms = start.elapsed().as_millis() as u64;

        let mut inner = self.inner.lock();
        let entry = match &result {
            Ok(None) => {
                // Health check failed; nothing ran this cycle, so nothing
                // is recorded in history either.
                inner.state = SchedulerState::Idle;
                None
            }
            Ok(Some(items)) => {
                inner.state = SchedulerState::Idle;
                Some(SyncHistoryEntry {
                    started_at,
                    duration_ms,
                    items_synced: *items,
                    status: "ok",
                    error: None,
                })
            }
            Err(SyncCycleOutcome::RateLimited { retry_after, pending }) => {
                inner.state = SchedulerState::RateLimited {
                    retry_after: *retry_after,
                    pending: *pending,
                };
                Some(SyncHistoryEntry {
                    started_at,
                    duration_ms,
                    items_synced: 0,
                    status: "rate_limited",
                    error: None,
                })
            }
            Err(SyncCycleOutcome::Error(message)) => {
                error!("perform_sync: {message}");
                inner.state = SchedulerState::Error { message: message.clone() };
                Some(SyncHistoryEntry {
                    started_at,
                    duration_ms,
                    items_synced: 0,
                    status: "error",
                    error: Some(message.clone()),
                })
            }
        };
        if let Some(entry) = entry {
            inner.history.push(entry);
        }
        inner.force_bootstrap = false;
        inner.is_syncing = false;
        drop(inner);
        self.sync_done.notify_all();

        if let Err(e) = self.store.set_pending_delete_ids(&self.env, &[]) {
            warn!("perform_sync: failed to clear persisted pending_delete_ids: {e}");
        }
    }

    fn run_sync_cycle(&self) -> Result<Option<usize>, SyncCycleOutcome> {
        if self.transport.health_check().is_err() {
            info!("perform_sync: health check failed, aborting silently (likely captive portal)");
            return Ok(None);
        }

        self.inner.lock().state = SchedulerState::Syncing { done: 0, total: 0 };

        let pending_delete_ids = self.snapshot_pending_delete_ids().map_err(to_error)?;

        let push_summary = {
            let mut inner = self.inner.lock();
            push::push(&self.store, self.transport.as_ref(), &mut inner.breaker, &self.config)
                .map_err(to_error)?
        };

        if push_summary.rate_limited {
            let inner = self.inner.lock();
            let retry_after = inner
                .breaker
                .retry_after(Instant::now())
                .unwrap_or(self.config.rate_limit_base_backoff);
            let pending = self.store.fetch_pending_mutations().map_err(to_error)?.len();
            return Err(SyncCycleOutcome::RateLimited { retry_after, pending });
        }

        let needs_bootstrap = self.inner.lock().force_bootstrap || self.store.get_cursor(&self.env).map_err(to_error)? == 0;

        let mut items_synced = push_summary.succeeded;
        if needs_bootstrap {
            let bootstrap_summary = bootstrap::bootstrap(&self.store, self.transport.as_ref(), &self.config, &self.env)
                .map_err(to_error)?;
            items_synced += bootstrap_summary.fetched;
        } else {
            self.inner.lock().state = SchedulerState::Pulling;
            let pull_summary = pull::pull(
                &self.store,
                self.transport.as_ref(),
                &self.config,
                &self.env,
                &pending_delete_ids,
            )
            .map_err(to_error)?;
            items_synced += pull_summary.applied;
        }

        reconcile::reconcile_event_type_relations(&self.store).map_err(to_error)?;

        Ok(Some(items_synced))
    }

    fn snapshot_pending_delete_ids(&self) -> sync_core::Result<HashSet<String>> {
        let ids: HashSet<String> = self
            .store
            .fetch_pending_mutations()?
            .into_iter()
            .filter(|m| m.operation == Operation::Delete)
            .map(|m| m.entity_id)
            .collect();
        let persisted: Vec<String> = ids.iter().cloned().collect();
        self.store.set_pending_delete_ids(&self.env, &persisted)?;
        Ok(ids)
    }

    /// §4.11's `force_full_resync`: waits (bounded) for any in-flight sync,
    /// then rewinds the cursor to 0, flags the next cycle for bootstrap,
    /// and runs it.
    pub fn force_full_resync(&self) {
        let deadline = Instant::now() + self.config.wait_for_completion_timeout;
        {
            let mut inner = self.inner.lock();
            while inner.is_syncing {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    warn!("force_full_resync: timed out waiting for in-flight sync, proceeding anyway");
                    break;
                }
                let timed_out = self.sync_done.wait_for(&mut inner, remaining).timed_out();
                if timed_out {
                    warn!("force_full_resync: timed out waiting for in-flight sync, proceeding anyway");
                    break;
                }
            }
            inner.force_bootstrap = true;
        }
        if let Err(e) = self.store.reset_cursor(&self.env) {
            error!("force_full_resync: failed to reset cursor: {e}");
            return;
        }
        self.perform_sync();
    }

    /// §4.11's `skip_to_latest_cursor`: recovers from a large change-log
    /// backlog by jumping the pull position forward without touching the
    /// push queue.
    pub fn skip_to_latest_cursor(&self) -> sync_core::Result<()> {
        let latest = self.transport.get_cursor()?;
        self.store.set_cursor(&self.env, latest)
    }

    /// §4.11's `clear_pending_mutations`: last-resort recovery that drops
    /// every pending mutation, optionally marking the corresponding
    /// entities `failed`, and resets the circuit breaker.
    pub fn clear_pending_mutations(&self, mark_failed: bool) -> sync_core::Result<()> {
        if mark_failed {
            for mutation in self.store.fetch_pending_mutations()? {
                self.store.mark_failed(mutation.entity_kind, &mutation.entity_id)?;
            }
        }
        self.store.delete_all_pending_mutations()?;
        self.inner.lock().breaker.reset();
        Ok(())
    }
}

enum SyncCycleOutcome {
    RateLimited { retry_after: Duration, pending: usize },
    Error(String),
}

fn to_error(e: sync_core::Error) -> SyncCycleOutcome {
    SyncCycleOutcome::Error(e.to_string())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fake_transport::FakeTransport;
    use crate::mutation_queue::enqueue;
    use serde_json::json;
    use sync_core::EntityKind;

    fn scheduler_with(transport: FakeTransport) -> Scheduler {
        Scheduler::new(
            LocalStore::open_in_memory().unwrap(),
            Box::new(transport),
            SyncConfig::default(),
            "test",
        )
    }

    #[test]
    fn test_first_sync_bootstraps_and_sets_cursor() {
        let transport = FakeTransport::new();
        let et_id = sync_core::EntityId::new().to_string();
        transport.seed_row(EntityKind::EventType, &et_id, json!({"id": et_id}));
        let scheduler = scheduler_with(transport);

        scheduler.perform_sync();

        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert!(scheduler
            .store()
            .find_by_id(EntityKind::EventType, &et_id)
            .unwrap()
            .is_some());
        assert_eq!(scheduler.history().len(), 1);
        assert_eq!(scheduler.history()[0].status, "ok");
    }

    #[test]
    fn test_health_check_failure_aborts_silently() {
        let transport = FakeTransport::new();
        transport.set_unhealthy();
        let scheduler = scheduler_with(transport);

        scheduler.perform_sync();

        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert!(scheduler.history().is_empty());
    }

    #[test]
    fn test_rate_limit_surfaces_rate_limited_state() {
        let transport = FakeTransport::new();
        transport.rate_limit_next(10);
        let scheduler = scheduler_with(transport);
        // past the implicit bootstrap (cursor 0, empty server = no bootstrap
        // work but still runs); enqueue pending work so push has something
        // to rate-limit against.
        for i in 0..5 {
            let id = format!("et{i}");
            scheduler
                .store()
                .insert_pending(EntityKind::EventType, &id, &json!({"id": id}))
                .unwrap();
            enqueue(scheduler.store(), EntityKind::EventType, Operation::Create, &id, &json!({"id": id})).unwrap();
        }

        scheduler.perform_sync();

        match scheduler.state() {
            SchedulerState::RateLimited { pending, .. } => assert_eq!(pending, 5),
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn test_clear_pending_mutations_marks_failed_and_resets_breaker() {
        let transport = FakeTransport::new();
        let scheduler = scheduler_with(transport);
        scheduler
            .store()
            .insert_pending(EntityKind::EventType, "et1", &json!({"id": "et1"}))
            .unwrap();
        enqueue(
            scheduler.store(),
            EntityKind::EventType,
            Operation::Create,
            "et1",
            &json!({"id": "et1"}),
        )
        .unwrap();

        scheduler.clear_pending_mutations(true).unwrap();

        assert!(scheduler.store().fetch_pending_mutations().unwrap().is_empty());
        let entity = scheduler
            .store()
            .find_by_id(EntityKind::EventType, "et1")
            .unwrap()
            .unwrap();
        assert_eq!(entity.sync_status, crate::local_store::SyncStatus::Failed);
    }

    #[test]
    fn test_force_full_resync_flushes_pending_then_rebuilds_from_server() {
        let transport = FakeTransport::new();
        let et_id = sync_core::EntityId::new().to_string();
        transport.seed_row(EntityKind::EventType, &et_id, json!({"id": et_id}));
        let scheduler = scheduler_with(transport);

        scheduler.perform_sync();
        assert!(scheduler
            .store()
            .find_by_id(EntityKind::EventType, &et_id)
            .unwrap()
            .is_some());

        // Local drift the server doesn't know about, plus a pending create
        // that force_full_resync must push before it nuclear-deletes.
        scheduler
            .store()
            .upsert(EntityKind::EventType, "stale", |_| json!({"id": "stale"}))
            .unwrap();
        scheduler
            .store()
            .insert_pending(EntityKind::EventType, "et2", &json!({"id": "et2"}))
            .unwrap();
        enqueue(
            scheduler.store(),
            EntityKind::EventType,
            Operation::Create,
            "et2",
            &json!({"id": "et2"}),
        )
        .unwrap();

        scheduler.force_full_resync();

        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert!(scheduler.store().fetch_pending_mutations().unwrap().is_empty());
        assert!(scheduler
            .store()
            .find_by_id(EntityKind::EventType, "stale")
            .unwrap()
            .is_none());
        assert!(scheduler
            .store()
            .find_by_id(EntityKind::EventType, &et_id)
            .unwrap()
            .is_some());
        assert!(
            scheduler.store().find_by_id(EntityKind::EventType, "et2").unwrap().is_some(),
            "et2 was pushed to the server before the nuclear reset, so bootstrap refetches it"
        );
    }

    #[test]
    fn test_skip_to_latest_cursor_jumps_ahead_without_touching_pending_queue() {
        let transport = FakeTransport::new();
        for i in 0..3 {
            let id = format!("et{i}");
            transport.seed_row(EntityKind::EventType, &id, json!({"id": id}));
        }
        let scheduler = scheduler_with(transport);
        assert_eq!(scheduler.store().get_cursor("test").unwrap(), 0);

        scheduler
            .store()
            .insert_pending(EntityKind::EventType, "local1", &json!({"id": "local1"}))
            .unwrap();
        enqueue(
            scheduler.store(),
            EntityKind::EventType,
            Operation::Create,
            "local1",
            &json!({"id": "local1"}),
        )
        .unwrap();

        scheduler.skip_to_latest_cursor().unwrap();

        assert_eq!(scheduler.store().get_cursor("test").unwrap(), 3);
        assert_eq!(scheduler.store().fetch_pending_mutations().unwrap().len(), 1);
    }
}
