//! An in-memory stand-in for `HttpTransport`, used by every test in this
//! crate. Mirrors the shape of the real server closely enough to drive the
//! seed scenarios end-to-end without a running HTTP server.
#![cfg(test)]

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;
use sync_core::{ChangeLogEntry, EntityKind, Error, Operation, Result};

use crate::transport::{BatchCreateError, BatchCreateResponse, ChangesPage, ListParams, SyncTransport};

struct Inner {
    rows: HashMap<EntityKind, HashMap<String, Value>>,
    change_log: Vec<ChangeLogEntry>,
    seen_idempotency_keys: HashMap<String, Value>,
    healthy: bool,
    rate_limit_remaining: u32,
    natural_key_field: Option<&'static str>,
}

pub struct FakeTransport {
    inner: Mutex<Inner>,
}

impl FakeTransport {
    pub fn new() -> Self {
        FakeTransport {
            inner: Mutex::new(Inner {
                rows: HashMap::new(),
                change_log: Vec::new(),
                seen_idempotency_keys: HashMap::new(),
                healthy: true,
                rate_limit_remaining: 0,
                natural_key_field: None,
            }),
        }
    }

    pub fn set_unhealthy(&self) {
        self.inner.lock().healthy = false;
    }

    /// Make the next N mutating calls return `RateLimit`.
    pub fn rate_limit_next(&self, n: u32) {
        self.inner.lock().rate_limit_remaining = n;
    }

    pub fn set_natural_key_field(&self, field: &'static str) {
        self.inner.lock().natural_key_field = Some(field);
    }

    pub fn change_log_len(&self) -> usize {
        self.inner.lock().change_log.len()
    }

    pub fn seed_row(&self, kind: EntityKind, id: &str, body: Value) {
        let mut inner = self.inner.lock();
        let next_id = inner.change_log.len() as i64 + 1;
        inner
            .rows
            .entry(kind)
            .or_default()
            .insert(id.to_string(), body.clone());
        inner.change_log.push(ChangeLogEntry {
            id: next_id,
            entity_kind: kind,
            operation: Operation::Create,
            entity_id: id.parse().unwrap(),
            data: Some(body),
            deleted_at: None,
            created_at: chrono::Utc::now(),
        });
    }

    fn take_rate_limit(inner: &mut Inner) -> bool {
        if inner.rate_limit_remaining > 0 {
            inner.rate_limit_remaining -= 1;
            true
        } else {
            false
        }
    }

    fn append_change(inner: &mut Inner, kind: EntityKind, op: Operation, id: &str, data: Option<Value>) {
        let next_id = inner.change_log.len() as i64 + 1;
        inner.change_log.push(ChangeLogEntry {
            id: next_id,
            entity_kind: kind,
            operation: op,
            entity_id: id.parse().unwrap(),
            data,
            deleted_at: if op == Operation::Delete {
                Some(chrono::Utc::now())
            } else {
                None
            },
            created_at: chrono::Utc::now(),
        });
    }
}

impl SyncTransport for FakeTransport {
    fn health_check(&self) -> Result<()> {
        if self.inner.lock().healthy {
            Ok(())
        } else {
            Err(Error::HealthCheckFailed)
        }
    }

    fn list(&self, kind: EntityKind, _params: &ListParams) -> Result<Vec<Value>> {
        Ok(self
            .inner
            .lock()
            .rows
            .get(&kind)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    fn create(&self, kind: EntityKind, idempotency_key: &str, body: &Value) -> Result<Value> {
        let mut inner = self.inner.lock();
        if let Some(prior) = inner.seen_idempotency_keys.get(idempotency_key).cloned() {
            return Ok(prior);
        }
        if Self::take_rate_limit(&mut inner) {
            return Err(Error::RateLimit);
        }
        let id = body
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Api {
                status: 422,
                message: "missing id".into(),
            })?
            .to_string();
        if inner.rows.entry(kind).or_default().contains_key(&id) {
            return Err(Error::Duplicate);
        }
        inner.rows.get_mut(&kind).unwrap().insert(id.clone(), body.clone());
        Self::append_change(&mut inner, kind, Operation::Create, &id, Some(body.clone()));
        inner
            .seen_idempotency_keys
            .insert(idempotency_key.to_string(), body.clone());
        Ok(body.clone())
    }

    fn batch_create_events(
        &self,
        _idempotency_key: &str,
        events: &[Value],
    ) -> Result<BatchCreateResponse> {
        let mut inner = self.inner.lock();
        let mut created = Vec::new();
        let mut errors = Vec::new();
        let natural_key_field = inner.natural_key_field;
        for (index, body) in events.iter().enumerate() {
            if Self::take_rate_limit(&mut inner) {
                errors.push(BatchCreateError {
                    index,
                    message: "rate limited".into(),
                });
                continue;
            }
            let id = match body.get("id").and_then(Value::as_str) {
                Some(id) => id.to_string(),
                None => {
                    errors.push(BatchCreateError {
                        index,
                        message: "missing id".into(),
                    });
                    continue;
                }
            };
            let duplicate_by_id = inner
                .rows
                .get(&EntityKind::Event)
                .map(|m| m.contains_key(&id))
                .unwrap_or(false);
            if duplicate_by_id {
                errors.push(BatchCreateError {
                    index,
                    message: "duplicate".into(),
                });
                continue;
            }
            // A natural-key collision (e.g. the same HealthKit sample
            // pushed from two devices) is not an error: the server's row
            // is returned under `created`, same as a fresh insert, so the
            // client can reconcile by natural key instead of by id.
            let existing_by_natural_key = natural_key_field.and_then(|field| {
                let wanted = body.get(field)?;
                inner
                    .rows
                    .get(&EntityKind::Event)
                    .and_then(|m| m.values().find(|row| row.get(field) == Some(wanted)))
                    .cloned()
            });
            if let Some(existing) = existing_by_natural_key {
                created.push(existing);
                continue;
            }
            inner
                .rows
                .entry(EntityKind::Event)
                .or_default()
                .insert(id.clone(), body.clone());
            Self::append_change(&mut inner, EntityKind::Event, Operation::Create, &id, Some(body.clone()));
            created.push(body.clone());
        }
        Ok(BatchCreateResponse { created, errors })
    }

    fn update(&self, kind: EntityKind, id: &str, body: &Value) -> Result<Value> {
        let mut inner = self.inner.lock();
        if Self::take_rate_limit(&mut inner) {
            return Err(Error::RateLimit);
        }
        if !inner.rows.get(&kind).map_or(false, |m| m.contains_key(id)) {
            return Err(Error::NotFound);
        }
        inner.rows.get_mut(&kind).unwrap().insert(id.to_string(), body.clone());
        Self::append_change(&mut inner, kind, Operation::Update, id, Some(body.clone()));
        Ok(body.clone())
    }

    fn delete(&self, kind: EntityKind, id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if Self::take_rate_limit(&mut inner) {
            return Err(Error::RateLimit);
        }
        inner.rows.get_mut(&kind).map(|m| m.remove(id));
        Self::append_change(&mut inner, kind, Operation::Delete, id, None);
        Ok(())
    }

    fn get_changes(&self, since: i64, limit: usize) -> Result<ChangesPage> {
        let inner = self.inner.lock();
        let mut page: Vec<ChangeLogEntry> = inner
            .change_log
            .iter()
            .filter(|c| c.id > since)
            .take(limit + 1)
            .cloned()
            .collect();
        let has_more = page.len() > limit;
        page.truncate(limit);
        let next_cursor = page.last().map(|c| c.id).unwrap_or(since);
        Ok(ChangesPage {
            changes: page,
            next_cursor,
            has_more,
        })
    }

    fn get_cursor(&self) -> Result<i64> {
        Ok(self.inner.lock().change_log.last().map(|c| c.id).unwrap_or(0))
    }
}
