//! §4.3: upsert-by-id entity storage, scoped per user, with every
//! successful mutation appended to the change log in the same critical
//! section. The production store is a trait; this reference
//! implementation is an in-memory `HashMap` guarded by one
//! `parking_lot::Mutex`, standing in for the PostgREST-backed store the
//! spec places out of scope.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;
use sync_core::{EntityKind, Error, Operation, PropertyValue, Result};

use crate::change_log::ChangeLogStore;

#[derive(Debug, Clone)]
pub struct BatchCreateError {
    pub index: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct BatchCreateOutcome {
    pub created: Vec<Value>,
    pub errors: Vec<BatchCreateError>,
}

impl BatchCreateOutcome {
    pub fn total(&self) -> usize {
        self.created.len() + self.errors.len()
    }
}

pub trait EntityRepository: Send + Sync {
    /// Honors a client-supplied `id`. Re-inserting an existing id returns
    /// `Error::Duplicate` — the push pipeline treats that the same as a
    /// server-reported duplicate.
    fn create(&self, user_id: &str, kind: EntityKind, body: Value) -> Result<Value>;

    fn get_by_id(&self, user_id: &str, kind: EntityKind, id: &str) -> Result<Option<Value>>;

    fn list(&self, user_id: &str, kind: EntityKind, event_type_id: Option<&str>) -> Result<Vec<Value>>;

    /// Shallow-merges `patch` into the existing row; `Error::NotFound` if
    /// absent.
    fn update(&self, user_id: &str, kind: EntityKind, id: &str, patch: Value) -> Result<Value>;

    fn delete(&self, user_id: &str, kind: EntityKind, id: &str) -> Result<()>;

    /// Upserts by a natural key (e.g. a HealthKit sample id) instead of the
    /// client-chosen row id; returns the existing row if the natural key
    /// is already present under a different id.
    fn upsert_by_natural_key(
        &self,
        user_id: &str,
        kind: EntityKind,
        natural_key_field: &str,
        body: Value,
    ) -> Result<Value>;

    /// Input is `[request]`; output accounts for every input exactly once
    /// (`created.len() + errors.len() == bodies.len()`). A single failure
    /// does not abort the rest of the batch.
    fn batch_create(
        &self,
        user_id: &str,
        kind: EntityKind,
        bodies: Vec<Value>,
        natural_key_field: Option<&str>,
    ) -> Result<BatchCreateOutcome>;
}

type Table = HashMap<String, Value>;

pub struct InMemoryEntityRepository {
    change_log: std::sync::Arc<dyn ChangeLogStore>,
    tables: Mutex<HashMap<(String, EntityKind), Table>>,
}

impl InMemoryEntityRepository {
    pub fn new(change_log: std::sync::Arc<dyn ChangeLogStore>) -> Self {
        InMemoryEntityRepository {
            change_log,
            tables: Mutex::new(HashMap::new()),
        }
    }

    fn stamp_create(user_id: &str, mut body: Value) -> Result<(String, Value)> {
        let id = body
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Api {
                status: 422,
                message: "missing id".into(),
            })?
            .to_string();
        if let Value::Object(map) = &mut body {
            let now = chrono::Utc::now().to_rfc3339();
            map.insert("user_id".into(), Value::String(user_id.to_string()));
            map.entry("created_at").or_insert(Value::String(now.clone()));
            map.insert("updated_at".into(), Value::String(now));
        }
        Ok((id, body))
    }
}

impl EntityRepository for InMemoryEntityRepository {
    fn create(&self, user_id: &str, kind: EntityKind, body: Value) -> Result<Value> {
        PropertyValue::validate_bag(&body)?;
        let (id, stamped) = Self::stamp_create(user_id, body)?;
        let mut tables = self.tables.lock();
        let table = tables.entry((user_id.to_string(), kind)).or_default();
        if table.contains_key(&id) {
            return Err(Error::Duplicate);
        }
        table.insert(id.clone(), stamped.clone());
        drop(tables);
        self.change_log
            .append(user_id, kind, Operation::Create, &id, Some(stamped.clone()))?;
        Ok(stamped)
    }

    fn get_by_id(&self, user_id: &str, kind: EntityKind, id: &str) -> Result<Option<Value>> {
        Ok(self
            .tables
            .lock()
            .get(&(user_id.to_string(), kind))
            .and_then(|t| t.get(id))
            .cloned())
    }

    fn list(&self, user_id: &str, kind: EntityKind, event_type_id: Option<&str>) -> Result<Vec<Value>> {
        let tables = self.tables.lock();
        let Some(table) = tables.get(&(user_id.to_string(), kind)) else {
            return Ok(Vec::new());
        };
        let rows = table.values().filter(|row| match event_type_id {
            Some(wanted) => row.get("event_type_id").and_then(Value::as_str) == Some(wanted),
            None => true,
        });
        Ok(rows.cloned().collect())
    }

    fn update(&self, user_id: &str, kind: EntityKind, id: &str, patch: Value) -> Result<Value> {
        let mut tables = self.tables.lock();
        let table = tables
            .entry((user_id.to_string(), kind))
            .or_default();
        let Some(existing) = table.get(id).cloned() else {
            return Err(Error::NotFound);
        };
        let mut merged = existing;
        if let (Value::Object(into), Value::Object(from)) = (&mut merged, &patch) {
            for (k, v) in from {
                into.insert(k.clone(), v.clone());
            }
            into.insert(
                "updated_at".into(),
                Value::String(chrono::Utc::now().to_rfc3339()),
            );
        }
        PropertyValue::validate_bag(&merged)?;
        table.insert(id.to_string(), merged.clone());
        drop(tables);
        self.change_log
            .append(user_id, kind, Operation::Update, id, Some(merged.clone()))?;
        Ok(merged)
    }

    fn delete(&self, user_id: &str, kind: EntityKind, id: &str) -> Result<()> {
        self.tables
            .lock()
            .entry((user_id.to_string(), kind))
            .or_default()
            .remove(id);
        self.change_log.append(user_id, kind, Operation::Delete, id, None)?;
        Ok(())
    }

    fn upsert_by_natural_key(
        &self,
        user_id: &str,
        kind: EntityKind,
        natural_key_field: &str,
        body: Value,
    ) -> Result<Value> {
        let wanted = body.get(natural_key_field).cloned();
        let mut tables = self.tables.lock();
        let table = tables.entry((user_id.to_string(), kind)).or_default();
        if let Some(existing) = table
            .values()
            .find(|row| row.get(natural_key_field) == wanted.as_ref() && wanted.is_some())
        {
            return Ok(existing.clone());
        }
        drop(tables);
        self.create(user_id, kind, body)
    }

    fn batch_create(
        &self,
        user_id: &str,
        kind: EntityKind,
        bodies: Vec<Value>,
        natural_key_field: Option<&str>,
    ) -> Result<BatchCreateOutcome> {
        let mut outcome = BatchCreateOutcome::default();
        for (index, body) in bodies.into_iter().enumerate() {
            let duplicate_by_natural_key = natural_key_field.and_then(|field| body.get(field)).is_some()
                && {
                    let tables = self.tables.lock();
                    let wanted = body.get(natural_key_field.unwrap());
                    tables
                        .get(&(user_id.to_string(), kind))
                        .map(|t| t.values().any(|row| row.get(natural_key_field.unwrap()) == wanted))
                        .unwrap_or(false)
                };
            if duplicate_by_natural_key {
                let natural_key_value = body.get(natural_key_field.unwrap()).cloned();
                let tables = self.tables.lock();
                let existing = tables
                    .get(&(user_id.to_string(), kind))
                    .and_then(|t| t.values().find(|row| row.get(natural_key_field.unwrap()).cloned() == natural_key_value))
                    .cloned();
                drop(tables);
                if let Some(row) = existing {
                    outcome.created.push(row);
                    continue;
                }
            }
            match self.create(user_id, kind, body) {
                Ok(row) => outcome.created.push(row),
                Err(Error::Duplicate) => outcome.errors.push(BatchCreateError {
                    index,
                    message: "duplicate: row already exists".into(),
                }),
                Err(e) => outcome.errors.push(BatchCreateError {
                    index,
                    message: e.to_string(),
                }),
            }
        }
        Ok(outcome)
    }
}
