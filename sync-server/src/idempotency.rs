//! §4.2: dedup for the `Idempotency-Key` header. A second request with the
//! same `(key, route, user_id)` returns exactly what the first one
//! returned, without re-running repository side effects.

use parking_lot::Mutex;
use serde_json::Value;
use sync_core::{IdempotencyRecord, Result};

pub trait IdempotencyStore: Send + Sync {
    fn get(&self, key: &str, route: &str, user_id: &str) -> Result<Option<IdempotencyRecord>>;

    /// Inserts a record. A duplicate insert for the same `(key, route,
    /// user_id)` is ignored and the existing record returned, rather than
    /// erroring — callers handle both outcomes uniformly.
    fn store(
        &self,
        key: &str,
        route: &str,
        user_id: &str,
        response_body: Value,
        status_code: u16,
    ) -> Result<IdempotencyRecord>;
}

fn composite_key(key: &str, route: &str, user_id: &str) -> String {
    format!("{user_id}\0{route}\0{key}")
}

#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    records: Mutex<std::collections::HashMap<String, IdempotencyRecord>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdempotencyStore for InMemoryIdempotencyStore {
    fn get(&self, key: &str, route: &str, user_id: &str) -> Result<Option<IdempotencyRecord>> {
        Ok(self.records.lock().get(&composite_key(key, route, user_id)).cloned())
    }

    fn store(
        &self,
        key: &str,
        route: &str,
        user_id: &str,
        response_body: Value,
        status_code: u16,
    ) -> Result<IdempotencyRecord> {
        let mut records = self.records.lock();
        let composite = composite_key(key, route, user_id);
        if let Some(existing) = records.get(&composite) {
            return Ok(existing.clone());
        }
        let record = IdempotencyRecord {
            key: key.to_string(),
            route: route.to_string(),
            user_id: user_id.to_string(),
            response_body,
            status_code,
            created_at: chrono::Utc::now(),
        };
        records.insert(composite, record.clone());
        Ok(record)
    }
}
