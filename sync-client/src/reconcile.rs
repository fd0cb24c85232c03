//! §4.10: resolves the `Event -> EventType` foreign key after every
//! pull/bootstrap. The wire/local row carries `event_type_id` always and an
//! optional, lazily-resolved `event_type` field; this walks every event
//! missing the latter and fills it in from whatever is locally present.
//! Orphans (parent not yet synced) are left unresolved — a later sync,
//! once the parent has arrived, repairs them.

use log::warn;
use serde_json::Value;
use sync_core::EntityKind;

use crate::local_store::LocalStore;

#[derive(Debug, Default)]
pub struct ReconcileSummary {
    pub resolved: usize,
    pub orphaned: usize,
}

pub fn reconcile_event_type_relations(store: &LocalStore) -> sync_core::Result<ReconcileSummary> {
    let mut summary = ReconcileSummary::default();
    let events = store.fetch_all(EntityKind::Event)?;

    for event in &events {
        let already_resolved = event
            .data
            .get("event_type")
            .map(|v| !v.is_null())
            .unwrap_or(false);
        if already_resolved {
            continue;
        }
        let Some(event_type_id) = event.data.get("event_type_id").and_then(Value::as_str) else {
            continue;
        };
        match store.find_by_id(EntityKind::EventType, event_type_id)? {
            Some(parent) => {
                let data = parent.data;
                store.upsert(EntityKind::Event, &event.id, |mut row| {
                    if let Value::Object(map) = &mut row {
                        map.insert("event_type".to_string(), data.clone());
                    }
                    row
                })?;
                summary.resolved += 1;
            }
            None => {
                warn!(
                    "reconcile: event {} references event_type {} not yet present locally",
                    event.id, event_type_id
                );
                summary.orphaned += 1;
            }
        }
    }

    Ok(summary)
}
