//! §6's HTTP surface, wired with `axum`. Authentication is an external
//! collaborator per the spec's scope cut; each request's `user_id` is read
//! from an `X-User-Id` header as the stand-in a real deployment would
//! replace with whatever the auth layer resolves.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use log::warn;
use serde::Deserialize;
use serde_json::{json, Value};
use sync_core::{EntityKind, Error};

use crate::change_log::ChangeLogStore;
use crate::idempotency::IdempotencyStore;
use crate::repository::EntityRepository;

pub struct AppState {
    pub change_log: Arc<dyn ChangeLogStore>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub repository: Arc<dyn EntityRepository>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/event_types", get(list_event_types).post(create_event_type))
        .route("/events", get(list_events).post(create_event))
        .route("/geofences", get(list_geofences).post(create_geofence))
        .route(
            "/property_definitions",
            get(list_property_definitions).post(create_property_definition),
        )
        .route("/events:batch", post(batch_create_events))
        .route("/event_types/{id}", patch(update_event_type).delete(delete_event_type))
        .route("/events/{id}", patch(update_event).delete(delete_event))
        .route("/geofences/{id}", patch(update_geofence).delete(delete_geofence))
        .route(
            "/property_definitions/{id}",
            patch(update_property_definition).delete(delete_property_definition),
        )
        .route("/changes", get(get_changes))
        .route("/changes/cursor", get(get_cursor))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

fn user_id(headers: &HeaderMap) -> Result<String, Response> {
    headers
        .get("X-User-Id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .ok_or_else(|| (StatusCode::UNAUTHORIZED, "missing X-User-Id header").into_response())
}

fn idempotency_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Duplicate => StatusCode::CONFLICT,
            Error::RateLimit => StatusCode::TOO_MANY_REQUESTS,
            Error::NotFound => StatusCode::NOT_FOUND,
            Error::Api { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            Error::Decode(_) | Error::InvalidId(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::HealthCheckFailed | Error::Network(_) => StatusCode::BAD_GATEWAY,
            Error::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Wraps a create handler with the idempotency contract: a repeat request
/// carrying the same `(key, route, user_id)` returns the cached response
/// byte-for-byte without touching the repository again.
fn with_idempotency(
    state: &AppState,
    key: Option<&str>,
    route: &str,
    user_id: &str,
    run: impl FnOnce() -> Result<(StatusCode, Value), Error>,
) -> Result<(StatusCode, Json<Value>), Error> {
    if let Some(key) = key {
        if let Some(cached) = state.idempotency.get(key, route, user_id)? {
            let status = StatusCode::from_u16(cached.status_code).unwrap_or(StatusCode::OK);
            return Ok((status, Json(cached.response_body)));
        }
        let (status, body) = run()?;
        state.idempotency.store(key, route, user_id, body.clone(), status.as_u16())?;
        return Ok((status, Json(body)));
    }
    let (status, body) = run()?;
    Ok((status, Json(body)))
}

macro_rules! list_handler {
    ($name:ident, $kind:expr) => {
        async fn $name(
            State(state): State<Arc<AppState>>,
            headers: HeaderMap,
            Query(params): Query<ListQuery>,
        ) -> Result<Json<Vec<Value>>, Response> {
            let uid = user_id(&headers)?;
            let rows = state
                .repository
                .list(&uid, $kind, params.event_type_id.as_deref())
                .map_err(IntoResponse::into_response)?;
            Ok(Json(rows))
        }
    };
}

macro_rules! create_handler {
    ($name:ident, $kind:expr, $route:literal) => {
        async fn $name(
            State(state): State<Arc<AppState>>,
            headers: HeaderMap,
            Json(body): Json<Value>,
        ) -> Result<(StatusCode, Json<Value>), Response> {
            let uid = user_id(&headers)?;
            let key = idempotency_key(&headers);
            with_idempotency(&state, key.as_deref(), $route, &uid, || {
                let row = state.repository.create(&uid, $kind, body)?;
                Ok((StatusCode::CREATED, row))
            })
            .map_err(IntoResponse::into_response)
        }
    };
}

macro_rules! update_handler {
    ($name:ident, $kind:expr) => {
        async fn $name(
            State(state): State<Arc<AppState>>,
            headers: HeaderMap,
            Path(id): Path<String>,
            Json(patch): Json<Value>,
        ) -> Result<Json<Value>, Response> {
            let uid = user_id(&headers)?;
            let row = state
                .repository
                .update(&uid, $kind, &id, patch)
                .map_err(IntoResponse::into_response)?;
            Ok(Json(row))
        }
    };
}

macro_rules! delete_handler {
    ($name:ident, $kind:expr) => {
        async fn $name(
            State(state): State<Arc<AppState>>,
            headers: HeaderMap,
            Path(id): Path<String>,
        ) -> Result<StatusCode, Response> {
            let uid = user_id(&headers)?;
            state.repository.delete(&uid, $kind, &id).map_err(IntoResponse::into_response)?;
            Ok(StatusCode::NO_CONTENT)
        }
    };
}

#[derive(Debug, Deserialize, Default)]
struct ListQuery {
    event_type_id: Option<String>,
}

list_handler!(list_event_types, EntityKind::EventType);
list_handler!(list_events, EntityKind::Event);
list_handler!(list_geofences, EntityKind::Geofence);
list_handler!(list_property_definitions, EntityKind::PropertyDefinition);

create_handler!(create_event_type, EntityKind::EventType, "/event_types");
create_handler!(create_event, EntityKind::Event, "/events");
create_handler!(create_geofence, EntityKind::Geofence, "/geofences");
create_handler!(
    create_property_definition,
    EntityKind::PropertyDefinition,
    "/property_definitions"
);

update_handler!(update_event_type, EntityKind::EventType);
update_handler!(update_event, EntityKind::Event);
update_handler!(update_geofence, EntityKind::Geofence);
update_handler!(update_property_definition, EntityKind::PropertyDefinition);

delete_handler!(delete_event_type, EntityKind::EventType);
delete_handler!(delete_event, EntityKind::Event);
delete_handler!(delete_geofence, EntityKind::Geofence);
delete_handler!(delete_property_definition, EntityKind::PropertyDefinition);

#[derive(Debug, Deserialize)]
struct BatchEventsBody {
    events: Vec<Value>,
}

async fn batch_create_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<BatchEventsBody>,
) -> Result<Json<Value>, Response> {
    let uid = user_id(&headers)?;
    let outcome = state
        .repository
        .batch_create(&uid, EntityKind::Event, body.events, Some("natural_key"))
        .map_err(IntoResponse::into_response)?;
    let total = outcome.total();
    let success = outcome.created.len();
    let failed = outcome.errors.len();
    Ok(Json(json!({
        "created": outcome.created,
        "errors": outcome.errors.iter().map(|e| json!({"index": e.index, "message": e.message})).collect::<Vec<_>>(),
        "total": total,
        "success": success,
        "failed": failed,
    })))
}

#[derive(Debug, Deserialize)]
struct ChangesQuery {
    since: Option<i64>,
    limit: Option<usize>,
}

const DEFAULT_CHANGE_FEED_LIMIT: usize = 100;
const MAX_CHANGE_FEED_LIMIT: usize = 500;

async fn get_changes(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ChangesQuery>,
) -> Result<Json<Value>, Response> {
    let uid = user_id(&headers)?;
    let since = query.since.unwrap_or(0);
    let limit = query
        .limit
        .unwrap_or(DEFAULT_CHANGE_FEED_LIMIT)
        .min(MAX_CHANGE_FEED_LIMIT);
    if query.limit.is_some_and(|l| l > MAX_CHANGE_FEED_LIMIT) {
        warn!("get_changes: requested limit above max, clamping to {MAX_CHANGE_FEED_LIMIT}");
    }
    let page = state
        .change_log
        .get_since(&uid, since, limit)
        .map_err(IntoResponse::into_response)?;
    Ok(Json(json!({
        "changes": page.changes,
        "next_cursor": page.next_cursor,
        "has_more": page.has_more,
    })))
}

async fn get_cursor(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, Response> {
    let uid = user_id(&headers)?;
    let cursor = state
        .change_log
        .get_latest_cursor(&uid)
        .map_err(IntoResponse::into_response)?;
    Ok(Json(json!({ "cursor": cursor })))
}
