//! The embedded, durable local store. Grounded on `logins-sql`'s
//! `LoginDb`/`PasswordEngine` split: a thin synchronous wrapper around a
//! single `rusqlite::Connection`, one transaction per sync-visible
//! operation, so a crash between commits never loses a row that was
//! already committed.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use sync_core::{EntityKind, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Pending,
    Synced,
    Failed,
}

impl SyncStatus {
    fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }

    fn from_str(s: &str) -> SyncStatus {
        match s {
            "pending" => SyncStatus::Pending,
            "failed" => SyncStatus::Failed,
            _ => SyncStatus::Synced,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredEntity {
    pub kind: EntityKind,
    pub id: String,
    pub data: Value,
    pub sync_status: SyncStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PendingMutationRow {
    pub id: String,
    pub entity_kind: EntityKind,
    pub operation: sync_core::Operation,
    pub entity_id: String,
    pub payload: Value,
    pub client_request_id: String,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

pub struct LocalStore {
    conn: Connection,
}

impl LocalStore {
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::Store(e.to_string()))?;
        let store = LocalStore { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::Store(e.to_string()))?;
        let store = LocalStore { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS entities (
                    kind TEXT NOT NULL,
                    id TEXT NOT NULL,
                    data TEXT NOT NULL,
                    sync_status TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (kind, id)
                );
                CREATE TABLE IF NOT EXISTS pending_mutations (
                    id TEXT PRIMARY KEY,
                    entity_kind TEXT NOT NULL,
                    operation TEXT NOT NULL,
                    entity_id TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    client_request_id TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT
                );
                CREATE TABLE IF NOT EXISTS sync_meta (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );",
            )
            .map_err(|e| Error::Store(e.to_string()))
    }

    fn kind_str(kind: EntityKind) -> &'static str {
        kind.as_str()
    }

    fn parse_kind(s: &str) -> Result<EntityKind> {
        match s {
            "event" => Ok(EntityKind::Event),
            "event_type" => Ok(EntityKind::EventType),
            "geofence" => Ok(EntityKind::Geofence),
            "property_definition" => Ok(EntityKind::PropertyDefinition),
            other => Err(Error::Store(format!("unknown entity kind {other}"))),
        }
    }

    /// Fetch-or-create by id, run `mutator` over the (possibly fresh,
    /// `Value::Null`-seeded) row, persist with `sync_status = synced`.
    pub fn upsert(
        &self,
        kind: EntityKind,
        id: &str,
        mutator: impl FnOnce(Value) -> Value,
    ) -> Result<()> {
        let existing = self.find_by_id(kind, id)?;
        let current = existing.map(|e| e.data).unwrap_or(Value::Null);
        let updated = mutator(current);
        let now = Utc::now();
        self.conn
            .execute(
                "INSERT INTO entities (kind, id, data, sync_status, updated_at)
                 VALUES (?1, ?2, ?3, 'synced', ?4)
                 ON CONFLICT(kind, id) DO UPDATE SET
                    data = excluded.data, sync_status = 'synced', updated_at = excluded.updated_at",
                params![
                    Self::kind_str(kind),
                    id,
                    updated.to_string(),
                    now.to_rfc3339()
                ],
            )
            .map_err(|e| Error::Store(e.to_string()))?;
        Ok(())
    }

    /// Insert a brand-new locally-authored entity as `pending`.
    pub fn insert_pending(&self, kind: EntityKind, id: &str, data: &Value) -> Result<()> {
        let now = Utc::now();
        self.conn
            .execute(
                "INSERT INTO entities (kind, id, data, sync_status, updated_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4)
                 ON CONFLICT(kind, id) DO UPDATE SET
                    data = excluded.data, updated_at = excluded.updated_at",
                params![Self::kind_str(kind), id, data.to_string(), now.to_rfc3339()],
            )
            .map_err(|e| Error::Store(e.to_string()))?;
        Ok(())
    }

    pub fn delete(&self, kind: EntityKind, id: &str) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM entities WHERE kind = ?1 AND id = ?2",
                params![Self::kind_str(kind), id],
            )
            .map_err(|e| Error::Store(e.to_string()))?;
        Ok(())
    }

    pub fn find_by_id(&self, kind: EntityKind, id: &str) -> Result<Option<StoredEntity>> {
        self.conn
            .query_row(
                "SELECT data, sync_status, updated_at FROM entities WHERE kind = ?1 AND id = ?2",
                params![Self::kind_str(kind), id],
                |row| {
                    let data: String = row.get(0)?;
                    let status: String = row.get(1)?;
                    let updated_at: String = row.get(2)?;
                    Ok((data, status, updated_at))
                },
            )
            .optional()
            .map_err(|e| Error::Store(e.to_string()))?
            .map(|(data, status, updated_at)| {
                Ok(StoredEntity {
                    kind,
                    id: id.to_string(),
                    data: serde_json::from_str(&data)?,
                    sync_status: SyncStatus::from_str(&status),
                    updated_at: DateTime::parse_from_rfc3339(&updated_at)
                        .map(|d| d.with_timezone(&Utc))
                        .map_err(|e| Error::Store(e.to_string()))?,
                })
            })
            .transpose()
    }

    pub fn fetch_all(&self, kind: EntityKind) -> Result<Vec<StoredEntity>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, data, sync_status, updated_at FROM entities WHERE kind = ?1")
            .map_err(|e| Error::Store(e.to_string()))?;
        let rows = stmt
            .query_map(params![Self::kind_str(kind)], |row| {
                let id: String = row.get(0)?;
                let data: String = row.get(1)?;
                let status: String = row.get(2)?;
                let updated_at: String = row.get(3)?;
                Ok((id, data, status, updated_at))
            })
            .map_err(|e| Error::Store(e.to_string()))?;
        let mut out = Vec::new();
        for row in rows {
            let (id, data, status, updated_at) = row.map_err(|e| Error::Store(e.to_string()))?;
            out.push(StoredEntity {
                kind,
                id,
                data: serde_json::from_str(&data)?,
                sync_status: SyncStatus::from_str(&status),
                updated_at: DateTime::parse_from_rfc3339(&updated_at)
                    .map(|d| d.with_timezone(&Utc))
                    .map_err(|e| Error::Store(e.to_string()))?,
            });
        }
        Ok(out)
    }

    pub fn delete_all(&self, kind: EntityKind) -> Result<()> {
        self.conn
            .execute("DELETE FROM entities WHERE kind = ?1", params![Self::kind_str(kind)])
            .map_err(|e| Error::Store(e.to_string()))?;
        Ok(())
    }

    pub fn mark_synced(&self, kind: EntityKind, id: &str) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE entities SET sync_status = 'synced' WHERE kind = ?1 AND id = ?2",
                params![Self::kind_str(kind), id],
            )
            .map_err(|e| Error::Store(e.to_string()))?;
        if changed == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    pub fn mark_failed(&self, kind: EntityKind, id: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE entities SET sync_status = 'failed' WHERE kind = ?1 AND id = ?2",
                params![Self::kind_str(kind), id],
            )
            .map_err(|e| Error::Store(e.to_string()))?;
        Ok(())
    }

    // -- pending mutations --------------------------------------------

    pub fn has_pending_mutation(
        &self,
        kind: EntityKind,
        entity_id: &str,
        operation: sync_core::Operation,
    ) -> Result<bool> {
        let op_str = format!("{:?}", operation).to_lowercase();
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM pending_mutations
                 WHERE entity_kind = ?1 AND entity_id = ?2 AND operation = ?3",
                params![Self::kind_str(kind), entity_id, op_str],
                |row| row.get(0),
            )
            .map_err(|e| Error::Store(e.to_string()))?;
        Ok(count > 0)
    }

    pub fn insert_pending_mutation(
        &self,
        kind: EntityKind,
        entity_id: &str,
        operation: sync_core::Operation,
        payload: &Value,
        client_request_id: &str,
    ) -> Result<()> {
        let op_str = format!("{:?}", operation).to_lowercase();
        let id = uuid::Uuid::now_v7().to_string();
        self.conn
            .execute(
                "INSERT INTO pending_mutations
                    (id, entity_kind, operation, entity_id, payload, client_request_id, created_at, attempts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
                params![
                    id,
                    Self::kind_str(kind),
                    op_str,
                    entity_id,
                    payload.to_string(),
                    client_request_id,
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(|e| Error::Store(e.to_string()))?;
        Ok(())
    }

    pub fn fetch_pending_mutations(&self) -> Result<Vec<PendingMutationRow>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, entity_kind, operation, entity_id, payload, client_request_id,
                        created_at, attempts, last_error
                 FROM pending_mutations ORDER BY created_at ASC",
            )
            .map_err(|e| Error::Store(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, Option<String>>(8)?,
                ))
            })
            .map_err(|e| Error::Store(e.to_string()))?;
        let mut out = Vec::new();
        for row in rows {
            let (id, kind, op, entity_id, payload, client_request_id, created_at, attempts, last_error) =
                row.map_err(|e| Error::Store(e.to_string()))?;
            out.push(PendingMutationRow {
                id,
                entity_kind: Self::parse_kind(&kind)?,
                operation: match op.as_str() {
                    "create" => sync_core::Operation::Create,
                    "update" => sync_core::Operation::Update,
                    "delete" => sync_core::Operation::Delete,
                    other => return Err(Error::Store(format!("unknown operation {other}"))),
                },
                entity_id,
                payload: serde_json::from_str(&payload)?,
                client_request_id,
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .map(|d| d.with_timezone(&Utc))
                    .map_err(|e| Error::Store(e.to_string()))?,
                attempts: attempts as u32,
                last_error,
            });
        }
        Ok(out)
    }

    pub fn delete_pending_mutation(&self, id: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM pending_mutations WHERE id = ?1", params![id])
            .map_err(|e| Error::Store(e.to_string()))?;
        Ok(())
    }

    pub fn delete_all_pending_mutations(&self) -> Result<()> {
        self.conn
            .execute("DELETE FROM pending_mutations", [])
            .map_err(|e| Error::Store(e.to_string()))?;
        Ok(())
    }

    pub fn record_mutation_failure(&self, id: &str, message: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE pending_mutations SET attempts = attempts + 1, last_error = ?2 WHERE id = ?1",
                params![id, message],
            )
            .map_err(|e| Error::Store(e.to_string()))?;
        Ok(())
    }

    // -- sync_meta key/value --------------------------------------------

    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row("SELECT value FROM sync_meta WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| Error::Store(e.to_string()))
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sync_meta (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map_err(|e| Error::Store(e.to_string()))?;
        Ok(())
    }

    pub fn get_cursor(&self, env: &str) -> Result<i64> {
        Ok(self
            .get_meta(&format!("sync_engine_cursor_{env}"))?
            .and_then(|s| s.parse().ok())
            .unwrap_or(0))
    }

    /// Monotonic guard: refuses to move the cursor backward.
    pub fn set_cursor(&self, env: &str, cursor: i64) -> Result<()> {
        let current = self.get_cursor(env)?;
        if cursor < current {
            return Ok(());
        }
        self.set_meta(&format!("sync_engine_cursor_{env}"), &cursor.to_string())
    }

    /// Bypasses the monotonic guard. Only `force_full_resync` may call this:
    /// it deliberately rewinds to 0 so the following bootstrap starts clean.
    pub fn reset_cursor(&self, env: &str) -> Result<()> {
        self.set_meta(&format!("sync_engine_cursor_{env}"), "0")
    }

    pub fn get_pending_delete_ids(&self, env: &str) -> Result<Vec<String>> {
        Ok(self
            .get_meta(&format!("sync_engine_pending_delete_ids_{env}"))?
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default())
    }

    pub fn set_pending_delete_ids(&self, env: &str, ids: &[String]) -> Result<()> {
        let json = serde_json::to_string(ids)?;
        self.set_meta(&format!("sync_engine_pending_delete_ids_{env}"), &json)
    }
}
