//! §4.1: the append-only, per-user change log that drives incremental
//! pull. The production store is a trait so a Postgres/PostgREST-backed
//! implementation can swap in without touching callers; this reference
//! implementation keeps everything behind one `parking_lot::Mutex` so
//! `append` is atomic with the entity mutation it describes, the way a
//! real backing store would do both in one transaction.

use parking_lot::Mutex;
use serde_json::Value;
use sync_core::{ChangeLogEntry, EntityKind, Operation, Result};

pub trait ChangeLogStore: Send + Sync {
    /// Appends one entry for `user_id` and returns its freshly assigned id.
    fn append(
        &self,
        user_id: &str,
        entity_kind: EntityKind,
        operation: Operation,
        entity_id: &str,
        data: Option<Value>,
    ) -> Result<i64>;

    /// Entries with `id > cursor`, ordered ascending, capped at `limit`.
    fn get_since(&self, user_id: &str, cursor: i64, limit: usize) -> Result<ChangesPage>;

    /// Highest id ever assigned to `user_id`, or 0 if none.
    fn get_latest_cursor(&self, user_id: &str) -> Result<i64>;
}

#[derive(Debug, Clone)]
pub struct ChangesPage {
    pub changes: Vec<ChangeLogEntry>,
    pub next_cursor: i64,
    pub has_more: bool,
}

#[derive(Default)]
struct UserLog {
    entries: Vec<ChangeLogEntry>,
}

#[derive(Default)]
pub struct InMemoryChangeLogStore {
    by_user: Mutex<std::collections::HashMap<String, UserLog>>,
    next_id: Mutex<i64>,
}

impl InMemoryChangeLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChangeLogStore for InMemoryChangeLogStore {
    fn append(
        &self,
        user_id: &str,
        entity_kind: EntityKind,
        operation: Operation,
        entity_id: &str,
        data: Option<Value>,
    ) -> Result<i64> {
        let mut next_id = self.next_id.lock();
        *next_id += 1;
        let id = *next_id;
        drop(next_id);

        let entry = ChangeLogEntry {
            id,
            entity_kind,
            operation,
            entity_id: entity_id.parse()?,
            data,
            deleted_at: if operation == Operation::Delete {
                Some(chrono::Utc::now())
            } else {
                None
            },
            created_at: chrono::Utc::now(),
        };
        self.by_user
            .lock()
            .entry(user_id.to_string())
            .or_default()
            .entries
            .push(entry);
        Ok(id)
    }

    fn get_since(&self, user_id: &str, cursor: i64, limit: usize) -> Result<ChangesPage> {
        let by_user = self.by_user.lock();
        let Some(log) = by_user.get(user_id) else {
            return Ok(ChangesPage {
                changes: Vec::new(),
                next_cursor: cursor,
                has_more: false,
            });
        };
        let mut page: Vec<ChangeLogEntry> = log
            .entries
            .iter()
            .filter(|e| e.id > cursor)
            .take(limit + 1)
            .cloned()
            .collect();
        let has_more = page.len() > limit;
        page.truncate(limit);
        let next_cursor = page.last().map(|e| e.id).unwrap_or(cursor);
        Ok(ChangesPage {
            changes: page,
            next_cursor,
            has_more,
        })
    }

    fn get_latest_cursor(&self, user_id: &str) -> Result<i64> {
        Ok(self
            .by_user
            .lock()
            .get(user_id)
            .and_then(|log| log.entries.last())
            .map(|e| e.id)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ids_are_strictly_increasing_across_users() {
        let log = InMemoryChangeLogStore::new();
        let id = sync_core::EntityId::new().to_string();
        let a = log
            .append("alice", EntityKind::Event, Operation::Create, &id, Some(json!({})))
            .unwrap();
        let id2 = sync_core::EntityId::new().to_string();
        let b = log
            .append("bob", EntityKind::Event, Operation::Create, &id2, Some(json!({})))
            .unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_get_since_paginates_and_reports_has_more() {
        let log = InMemoryChangeLogStore::new();
        for _ in 0..5 {
            let id = sync_core::EntityId::new().to_string();
            log.append("alice", EntityKind::Event, Operation::Create, &id, Some(json!({})))
                .unwrap();
        }
        let page = log.get_since("alice", 0, 3).unwrap();
        assert_eq!(page.changes.len(), 3);
        assert!(page.has_more);
        let rest = log.get_since("alice", page.next_cursor, 3).unwrap();
        assert_eq!(rest.changes.len(), 2);
        assert!(!rest.has_more);
    }

    #[test]
    fn test_empty_poll_does_not_reset_cursor() {
        let log = InMemoryChangeLogStore::new();
        let id = sync_core::EntityId::new().to_string();
        log.append("alice", EntityKind::Event, Operation::Create, &id, Some(json!({})))
            .unwrap();
        let latest = log.get_latest_cursor("alice").unwrap();
        let page = log.get_since("alice", latest, 10).unwrap();
        assert!(page.changes.is_empty());
        assert_eq!(page.next_cursor, latest);
    }

    #[test]
    fn test_missing_user_is_empty_not_error() {
        let log = InMemoryChangeLogStore::new();
        assert_eq!(log.get_latest_cursor("nobody").unwrap(), 0);
        let page = log.get_since("nobody", 0, 10).unwrap();
        assert!(page.changes.is_empty());
        assert!(!page.has_more);
    }
}
