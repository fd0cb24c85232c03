//! §4.8: cursor-based incremental fetch, applied against the local store
//! with a resurrection check against the set of entity ids carrying a
//! pending delete mutation — conceptually the same "a delete marker wins
//! over a concurrent incoming upsert" idea as `tombstone.rs`'s
//! `MaybeTombstone`, without its untagged-enum wire format (this spec's
//! wire shape already distinguishes `operation: "delete"` directly).

use std::collections::HashSet;

use log::{info, warn};
use sync_core::{ChangeLogEntry, EntityKind, Operation, SyncConfig};

use crate::local_store::LocalStore;
use crate::transport::SyncTransport;

#[derive(Debug, Default)]
pub struct PullSummary {
    pub applied: usize,
    pub skipped_resurrection: usize,
}

pub fn pull(
    store: &LocalStore,
    transport: &dyn SyncTransport,
    config: &SyncConfig,
    env: &str,
    pending_delete_ids: &HashSet<String>,
) -> sync_core::Result<PullSummary> {
    let mut summary = PullSummary::default();
    loop {
        let cursor = store.get_cursor(env)?;
        let page = transport.get_changes(cursor, config.change_feed_limit)?;
        for entry in &page.changes {
            apply_entry(store, entry, pending_delete_ids, &mut summary)?;
        }
        if page.next_cursor > cursor {
            store.set_cursor(env, page.next_cursor)?;
        }
        info!(
            "pull: applied {} changes, cursor now {}",
            page.changes.len(),
            page.next_cursor
        );
        if !page.has_more {
            break;
        }
    }
    Ok(summary)
}

fn apply_entry(
    store: &LocalStore,
    entry: &ChangeLogEntry,
    pending_delete_ids: &HashSet<String>,
    summary: &mut PullSummary,
) -> sync_core::Result<()> {
    let id = entry.entity_id.to_string();
    match entry.operation {
        Operation::Create | Operation::Update => {
            if pending_delete_ids.contains(&id) {
                summary.skipped_resurrection += 1;
                return Ok(());
            }
            let data = match &entry.data {
                Some(d) => d.clone(),
                None => {
                    warn!("pull: {:?} entry for {} missing data, skipping", entry.operation, id);
                    return Ok(());
                }
            };
            store.upsert(entry.entity_kind, &id, |_| data)?;
            summary.applied += 1;
        }
        Operation::Delete => {
            store.delete(entry.entity_kind, &id)?;
            summary.applied += 1;
        }
    }
    Ok(())
}
