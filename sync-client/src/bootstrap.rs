//! §4.9: the full nuclear-reset fetch run on first sync (`cursor == 0`) or
//! on `ForceFullResync`. After bootstrap the local store's row set equals
//! the server's current truth, so the incremental pull for that cycle is
//! skipped outright — replaying the accumulated change log over a freshly
//! rebuilt store could resurrect rows the log's later entries deleted.

use log::info;
use serde_json::Value;
use sync_core::{EntityKind, SyncConfig};

use crate::local_store::LocalStore;
use crate::transport::{ListParams, SyncTransport};

#[derive(Debug, Default)]
pub struct BootstrapSummary {
    pub fetched: usize,
    pub cursor: i64,
}

/// Runs the full teardown-and-refetch. Returns the cursor the local store
/// was set to, which the caller (the scheduler) uses to skip that cycle's
/// incremental pull.
pub fn bootstrap(
    store: &LocalStore,
    transport: &dyn SyncTransport,
    _config: &SyncConfig,
    env: &str,
) -> sync_core::Result<BootstrapSummary> {
    for kind in EntityKind::DELETE_ORDER {
        store.delete_all(kind)?;
    }
    info!("bootstrap: local store wiped, dependency order {:?}", EntityKind::DELETE_ORDER);

    let mut summary = BootstrapSummary::default();
    for kind in EntityKind::FETCH_ORDER {
        let rows = fetch_all_for_kind(transport, kind)?;
        for row in &rows {
            let id = row
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| sync_core::Error::Store(format!("{kind:?} row missing id")))?;
            store.upsert(kind, id, |_| row.clone())?;
        }
        summary.fetched += rows.len();
        info!("bootstrap: fetched {} rows of kind {:?}", rows.len(), kind);
    }

    let cursor = transport.get_cursor().unwrap_or(i64::MAX);
    store.set_cursor(env, cursor)?;
    summary.cursor = cursor;
    info!("bootstrap: cursor set to {cursor}, incremental pull skipped this cycle");
    Ok(summary)
}

/// `PropertyDefinition` is paginated by `event_type_id` server-side; every
/// other kind is a flat list. Pulling all property definitions means
/// walking every already-bootstrapped event type.
fn fetch_all_for_kind(transport: &dyn SyncTransport, kind: EntityKind) -> sync_core::Result<Vec<Value>> {
    if kind != EntityKind::PropertyDefinition {
        return transport.list(kind, &ListParams::default());
    }
    let event_types = transport.list(EntityKind::EventType, &ListParams::default())?;
    let mut out = Vec::new();
    for et in &event_types {
        if let Some(event_type_id) = et.get("id").and_then(Value::as_str) {
            let params = ListParams {
                event_type_id: Some(event_type_id.to_string()),
            };
            out.extend(transport.list(kind, &params)?);
        }
    }
    Ok(out)
}
