//! The network boundary, factored out into a trait the same way
//! `sync15-adapter`'s `SetupStorageClient` was — "to make mocking easier"
//! is the exact justification the teacher gives for that split, and it's
//! why the push/pull/bootstrap/scheduler tests in this crate never stand
//! up a real HTTP server.

use std::time::Duration;

use log::warn;
use serde_json::Value;
use sync_core::{EntityKind, Error, Result};

#[derive(Debug, Clone, Default)]
pub struct ListParams {
    pub event_type_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChangesPage {
    pub changes: Vec<sync_core::ChangeLogEntry>,
    pub next_cursor: i64,
    pub has_more: bool,
}

#[derive(Debug, Clone, Default)]
pub struct BatchCreateResponse {
    pub created: Vec<Value>,
    pub errors: Vec<BatchCreateError>,
}

#[derive(Debug, Clone)]
pub struct BatchCreateError {
    pub index: usize,
    pub message: String,
}

/// Everything the sync engine needs from the server, as a trait so tests
/// can swap in an in-memory fake instead of a mocked HTTP server.
pub trait SyncTransport: Send + Sync {
    fn health_check(&self) -> Result<()>;

    fn list(&self, kind: EntityKind, params: &ListParams) -> Result<Vec<Value>>;

    fn create(&self, kind: EntityKind, idempotency_key: &str, body: &Value) -> Result<Value>;

    /// Batch-create events only; other kinds always go through `create`.
    fn batch_create_events(
        &self,
        idempotency_key: &str,
        events: &[Value],
    ) -> Result<BatchCreateResponse>;

    fn update(&self, kind: EntityKind, id: &str, body: &Value) -> Result<Value>;

    fn delete(&self, kind: EntityKind, id: &str) -> Result<()>;

    fn get_changes(&self, since: i64, limit: usize) -> Result<ChangesPage>;

    fn get_cursor(&self) -> Result<i64>;
}

/// Production implementation over `reqwest::blocking`, mirroring
/// `storage_client.rs`'s `exec_request`/`build_request` split: one place
/// builds the request, one place executes it and maps non-2xx responses
/// onto the shared error taxonomy.
pub struct HttpTransport {
    base_url: url::Url,
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new(base_url: url::Url, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Network(e.to_string()))?;
        Ok(HttpTransport { base_url, client })
    }

    fn url(&self, path: &str) -> url::Url {
        self.base_url.join(path).expect("path must be a valid relative url")
    }

    fn map_status(resp: reqwest::blocking::Response) -> Result<reqwest::blocking::Response> {
        let status = resp.status();
        if status.as_u16() == 409 {
            return Err(Error::Duplicate);
        }
        if status.as_u16() == 429 {
            return Err(Error::RateLimit);
        }
        if !status.is_success() {
            let status_code = status.as_u16();
            let message = resp.text().unwrap_or_default();
            return Err(Error::Api {
                status: status_code,
                message,
            });
        }
        Ok(resp)
    }
}

impl SyncTransport for HttpTransport {
    fn health_check(&self) -> Result<()> {
        let resp = self
            .client
            .get(self.url("healthz"))
            .send()
            .map_err(|e| Error::Network(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Error::HealthCheckFailed)
        }
    }

    fn list(&self, kind: EntityKind, params: &ListParams) -> Result<Vec<Value>> {
        let mut req = self.client.get(self.url(kind.collection_path()));
        if let Some(event_type_id) = &params.event_type_id {
            req = req.query(&[("event_type_id", event_type_id.as_str())]);
        }
        let resp = req.send().map_err(|e| Error::Network(e.to_string()))?;
        let resp = Self::map_status(resp)?;
        resp.json().map_err(|e| Error::Network(e.to_string()))
    }

    fn create(&self, kind: EntityKind, idempotency_key: &str, body: &Value) -> Result<Value> {
        let resp = self
            .client
            .post(self.url(kind.collection_path()))
            .header("Idempotency-Key", idempotency_key)
            .json(body)
            .send()
            .map_err(|e| Error::Network(e.to_string()))?;
        let resp = Self::map_status(resp)?;
        resp.json().map_err(|e| Error::Network(e.to_string()))
    }

    fn batch_create_events(
        &self,
        idempotency_key: &str,
        events: &[Value],
    ) -> Result<BatchCreateResponse> {
        let resp = self
            .client
            .post(self.url("events:batch"))
            .header("Idempotency-Key", idempotency_key)
            .json(&serde_json::json!({ "events": events }))
            .send()
            .map_err(|e| Error::Network(e.to_string()))?;
        let resp = Self::map_status(resp)?;
        let body: Value = resp.json().map_err(|e| Error::Network(e.to_string()))?;
        let created = body
            .get("created")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let errors = body
            .get("errors")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|e| {
                        Some(BatchCreateError {
                            index: e.get("index")?.as_u64()? as usize,
                            message: e.get("message")?.as_str()?.to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(BatchCreateResponse { created, errors })
    }

    fn update(&self, kind: EntityKind, id: &str, body: &Value) -> Result<Value> {
        let path = format!("{}/{}", kind.collection_path(), id);
        let resp = self
            .client
            .patch(self.url(&path))
            .json(body)
            .send()
            .map_err(|e| Error::Network(e.to_string()))?;
        let resp = Self::map_status(resp)?;
        resp.json().map_err(|e| Error::Network(e.to_string()))
    }

    fn delete(&self, kind: EntityKind, id: &str) -> Result<()> {
        let path = format!("{}/{}", kind.collection_path(), id);
        let resp = self
            .client
            .delete(self.url(&path))
            .send()
            .map_err(|e| Error::Network(e.to_string()))?;
        Self::map_status(resp)?;
        Ok(())
    }

    fn get_changes(&self, since: i64, limit: usize) -> Result<ChangesPage> {
        let resp = self
            .client
            .get(self.url("changes"))
            .query(&[("since", since.to_string()), ("limit", limit.to_string())])
            .send()
            .map_err(|e| Error::Network(e.to_string()))?;
        let resp = Self::map_status(resp)?;
        // A change row carrying an entity_kind/operation the client doesn't
        // know about yet (forward-compat) must not fail the whole page, so
        // `changes` is decoded row-by-row rather than as one typed Vec.
        #[derive(serde::Deserialize)]
        struct Wire {
            changes: Vec<Value>,
            next_cursor: i64,
            has_more: bool,
        }
        let wire: Wire = resp.json().map_err(|e| Error::Network(e.to_string()))?;
        let changes = wire
            .changes
            .into_iter()
            .filter_map(|row| match serde_json::from_value::<sync_core::ChangeLogEntry>(row.clone()) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("get_changes: skipping unrecognized change row: {e} ({row})");
                    None
                }
            })
            .collect();
        Ok(ChangesPage {
            changes,
            next_cursor: wire.next_cursor,
            has_more: wire.has_more,
        })
    }

    fn get_cursor(&self) -> Result<i64> {
        let resp = self
            .client
            .get(self.url("changes/cursor"))
            .send()
            .map_err(|e| Error::Network(e.to_string()))?;
        let resp = Self::map_status(resp)?;
        let body: Value = resp.json().map_err(|e| Error::Network(e.to_string()))?;
        body.get("cursor")
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::Store("response missing cursor field".into()))
    }
}
